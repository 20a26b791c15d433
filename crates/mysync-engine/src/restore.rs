use std::collections::BTreeSet;
use std::path::PathBuf;

use mysync_core::{
    ensure_role, BackupFileName, CheckpointStore, ColumnDescriptor, RoleOverride, RunType,
    SqlConnection, SyncError, TableRoleFields,
};
use serde::Serialize;

use crate::introspect::SchemaIntrospector;
use crate::replay::{discover_backup_files, ReplayEngine, ReplayReport};
use crate::CancelFlag;

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub dir: PathBuf,
    pub overrides: Vec<RoleOverride>,
}

impl RestoreConfig {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), overrides: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoredFile {
    pub file: String,
    pub table: String,
    pub ddl: Vec<String>,
    #[serde(flatten)]
    pub replay: ReplayReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub file: String,
    pub table: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub files: Vec<RestoredFile>,
    pub failures: Vec<FileFailure>,
    /// Files left untouched because an earlier file of the same table failed.
    pub skipped: Vec<String>,
}

impl RestoreReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }
}

/// One restore run over every pending change log in a directory.
pub struct RestoreRunner<C, S> {
    conn: C,
    store: S,
    config: RestoreConfig,
    cancel: CancelFlag,
}

impl<C: SqlConnection, S: CheckpointStore> RestoreRunner<C, S> {
    #[must_use]
    pub fn new(conn: C, store: S, config: RestoreConfig) -> Self {
        Self { conn, store, config, cancel: CancelFlag::new() }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replay pending change logs in stamp order.
    ///
    /// A file that fails is left in place together with every later file of its table; the
    /// other tables carry on and the failure is listed in the report.
    ///
    /// # Errors
    /// Returns [`SyncError::RoleViolation`] before any database access when the control store
    /// already marks this database as a backup source, [`SyncError::MalformedFileName`] before
    /// any change when a candidate file is misnamed, [`SyncError::Cancelled`], and errors from
    /// listing the target tables.
    pub fn run(&mut self) -> Result<RestoreReport, SyncError> {
        ensure_role(&mut self.store, RunType::Restore)?;

        let names = discover_backup_files(&self.config.dir)?;
        tracing::info!(files = names.len(), dir = %self.config.dir.display(), "starting restore run");

        let mut known_tables: BTreeSet<String> = self.conn.list_tables()?.into_iter().collect();
        let introspector = SchemaIntrospector::new(self.config.overrides.clone());
        let engine = ReplayEngine::new(&self.config.dir, self.cancel.clone());
        let mut failed_tables = BTreeSet::new();
        let mut report = RestoreReport::default();

        for name in &names {
            let file = name.backup_file_name();
            if failed_tables.contains(&name.table) {
                tracing::warn!(file = %file, "skipping file after earlier failure of its table");
                report.skipped.push(file);
                continue;
            }

            match self.restore_file(&engine, &introspector, name, &mut known_tables) {
                Ok(restored) => report.files.push(restored),
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(err) => {
                    tracing::error!(file = %file, error = %err, "restore of file failed");
                    failed_tables.insert(name.table.clone());
                    report.failures.push(FileFailure {
                        file,
                        table: name.table.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            restored = report.files.len(),
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            "restore run finished"
        );
        Ok(report)
    }

    fn restore_file(
        &mut self,
        engine: &ReplayEngine,
        introspector: &SchemaIntrospector,
        name: &BackupFileName,
        known_tables: &mut BTreeSet<String>,
    ) -> Result<RestoredFile, SyncError> {
        let table = name.table.as_str();
        let snapshot = engine.load_snapshot(name)?;
        let roles = self.roles_for(introspector, table, snapshot.as_deref(), known_tables)?;

        let record = self.store.upsert(RunType::Restore, table, &roles)?;
        let ddl = engine.reconcile_schema(&mut self.conn, name, snapshot.as_deref(), known_tables)?;
        let replay = engine.replay_file(&mut self.conn, name, roles.primary_key_field.as_deref())?;

        let cursor_id = replay.max_key.map_or(record.cursor_id, |key| key.max(record.cursor_id));
        self.store.advance(table, cursor_id, name.stamp.0, replay.applied())?;

        Ok(RestoredFile { file: name.backup_file_name(), table: table.to_string(), ddl, replay })
    }

    fn roles_for(
        &mut self,
        introspector: &SchemaIntrospector,
        table: &str,
        snapshot: Option<&[ColumnDescriptor]>,
        known_tables: &BTreeSet<String>,
    ) -> Result<TableRoleFields, SyncError> {
        if let Some(columns) = snapshot {
            return Ok(introspector.roles_for(table, columns));
        }
        if known_tables.contains(table) {
            let live = introspector.describe(&mut self.conn, table)?;
            return Ok(introspector.roles_for(table, &live));
        }
        Ok(TableRoleFields::default())
    }
}
