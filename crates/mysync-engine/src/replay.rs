use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use mysync_core::{
    is_backup_candidate, synthesize_alter, synthesize_create, BackupFileName, ChangeLogEntry,
    ChangeOp, ColumnDescriptor, InsertOutcome, Row, Severity, SqlConnection, SyncError,
};
use serde::Serialize;

use crate::files::{mark_consumed, read_schema_snapshot};
use crate::CancelFlag;

/// Every pending change log in `dir`, ordered by run stamp and then table.
///
/// All candidate names are validated before anything is returned, so a single malformed name
/// stops a restore before it touches the target.
///
/// # Errors
/// Returns [`SyncError::MalformedFileName`] for the first name outside the convention, or an
/// I/O error when the directory cannot be listed.
pub fn discover_backup_files(dir: &Path) -> Result<Vec<BackupFileName>, SyncError> {
    let entries = std::fs::read_dir(dir).map_err(|err| SyncError::io(dir, err))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| SyncError::io(dir, err))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if !is_backup_candidate(file_name) {
            continue;
        }
        names.push(BackupFileName::parse(file_name)?);
    }

    names.sort();
    Ok(names)
}

/// Counters for one replayed change log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub inserted: u64,
    /// Inserts the target already held.
    pub duplicates: u64,
    pub updated: u64,
    /// Malformed lines that were logged and passed over.
    pub skipped: u64,
    pub max_key: Option<i64>,
}

impl ReplayReport {
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Applies change logs from one backup directory to a target database.
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    dir: PathBuf,
    cancel: CancelFlag,
}

impl ReplayEngine {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, cancel: CancelFlag) -> Self {
        Self { dir: dir.into(), cancel }
    }

    #[must_use]
    pub fn log_path(&self, name: &BackupFileName) -> PathBuf {
        self.dir.join(name.backup_file_name())
    }

    #[must_use]
    pub fn snapshot_path(&self, name: &BackupFileName) -> PathBuf {
        self.dir.join(name.schema_file_name())
    }

    /// The schema snapshot paired with `name`, if one was written.
    ///
    /// # Errors
    /// Returns [`SyncError::Snapshot`] when the file exists but cannot be decoded.
    pub fn load_snapshot(
        &self,
        name: &BackupFileName,
    ) -> Result<Option<Vec<ColumnDescriptor>>, SyncError> {
        read_schema_snapshot(&self.snapshot_path(name))
    }

    /// Create the table from `snapshot` when the target lacks it, otherwise add or change
    /// columns so the live table matches the snapshot. Columns are never dropped.
    ///
    /// Returns the statements that were executed.
    ///
    /// # Errors
    /// Returns [`SyncError::Snapshot`] when the table must be created and no snapshot exists,
    /// or the connection error of a rejected statement.
    pub fn reconcile_schema<C: SqlConnection + ?Sized>(
        &self,
        conn: &mut C,
        name: &BackupFileName,
        snapshot: Option<&[ColumnDescriptor]>,
        known_tables: &mut BTreeSet<String>,
    ) -> Result<Vec<String>, SyncError> {
        let table = name.table.as_str();

        if !known_tables.contains(table) {
            let Some(columns) = snapshot else {
                return Err(SyncError::Snapshot {
                    path: self.snapshot_path(name),
                    reason: format!("table {table} does not exist and no schema snapshot was found"),
                });
            };
            let statement = synthesize_create(table, columns);
            tracing::info!(table, "creating table from snapshot");
            conn.execute_ddl(&statement)?;
            known_tables.insert(table.to_string());
            return Ok(vec![statement]);
        }

        let Some(columns) = snapshot else {
            tracing::warn!(table, stamp = %name.stamp, "no schema snapshot, keeping live table as is");
            return Ok(Vec::new());
        };

        let live = conn.describe(table)?;
        let statements = synthesize_alter(table, &live, columns);
        for statement in &statements {
            tracing::info!(table, statement = %statement, "reconciling column");
            conn.execute_ddl(statement)?;
        }
        Ok(statements)
    }

    /// Apply every entry of the change log `name`, then rename it with the consumed suffix.
    ///
    /// Inserts the target already holds are counted as duplicates. Updates set every column
    /// except `key_field` on the row with the entry's key. Malformed lines are logged and
    /// skipped.
    ///
    /// # Errors
    /// Returns [`SyncError::Cancelled`], any connection or I/O error, or
    /// [`SyncError::Validation`] for an update entry when the table has no key field. The file
    /// keeps its name on every error.
    pub fn replay_file<C: SqlConnection + ?Sized>(
        &self,
        conn: &mut C,
        name: &BackupFileName,
        key_field: Option<&str>,
    ) -> Result<ReplayReport, SyncError> {
        let table = name.table.as_str();
        let path = self.log_path(name);
        let file = File::open(&path).map_err(|err| SyncError::io(&path, err))?;

        let mut report = ReplayReport::default();
        let mut reader = BufReader::new(file);
        let mut raw = Vec::new();
        let mut line_number = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            raw.clear();
            if reader.read_until(b'\n', &mut raw).map_err(|err| SyncError::io(&path, err))? == 0 {
                break;
            }
            line_number += 1;

            let parsed = match std::str::from_utf8(&raw) {
                Ok(line) => {
                    let line = line.trim_end_matches(['\n', '\r']);
                    if line.trim().is_empty() {
                        continue;
                    }
                    ChangeLogEntry::parse_line(line, line_number)
                }
                Err(err) => Err(SyncError::MalformedEntry {
                    line: line_number,
                    reason: format!("line is not valid UTF-8: {err}"),
                }),
            };
            let entry = match parsed {
                Ok(entry) => entry,
                Err(err) if err.severity() == Severity::Skippable => {
                    tracing::warn!(table, file = %path.display(), error = %err, "skipping change log entry");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match entry.op {
                ChangeOp::Insert => match conn.insert_row(table, &entry.payload)? {
                    InsertOutcome::Inserted => report.inserted += 1,
                    InsertOutcome::Duplicate => report.duplicates += 1,
                },
                ChangeOp::Update => {
                    let Some(key_field) = key_field else {
                        return Err(SyncError::Validation(format!(
                            "cannot apply update for {table}: no primary key field"
                        )));
                    };
                    let values: Row = entry
                        .payload
                        .iter()
                        .filter(|(field, _)| field.as_str() != key_field)
                        .map(|(field, value)| (field.clone(), value.clone()))
                        .collect();
                    if values.is_empty() {
                        report.skipped += 1;
                        continue;
                    }
                    conn.update_row(table, key_field, entry.key, &values)?;
                    report.updated += 1;
                }
            }
            report.max_key = Some(report.max_key.map_or(entry.key, |max| max.max(entry.key)));
        }

        let consumed = mark_consumed(&path)?;
        tracing::info!(
            table,
            file = %consumed.display(),
            inserted = report.inserted,
            duplicates = report.duplicates,
            updated = report.updated,
            skipped = report.skipped,
            "change log replayed"
        );
        Ok(report)
    }
}
