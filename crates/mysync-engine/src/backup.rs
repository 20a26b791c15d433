use std::path::PathBuf;

use mysync_core::{
    ensure_role, format_datetime, BackupFileName, CheckpointStore, RoleOverride, RunStamp, RunType,
    SqlConnection, SyncError, TableFilter, CONTROL_TABLE,
};
use serde::Serialize;

use crate::capture::{CaptureOptions, ChangeCaptureEngine};
use crate::introspect::SchemaIntrospector;
use crate::CancelFlag;

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub filter: TableFilter,
    /// Write `scheme.<table>.<stamp>.json` next to every change log.
    pub schema_snapshot: bool,
    pub options: CaptureOptions,
    pub overrides: Vec<RoleOverride>,
}

impl BackupConfig {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            filter: TableFilter::default(),
            schema_snapshot: true,
            options: CaptureOptions::default(),
            overrides: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Exported,
    Unchanged,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub status: TableStatus,
    pub inserted: u64,
    pub updated: u64,
    pub cursor_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TableOutcome {
    fn skipped(table: &str, reason: String) -> Self {
        Self {
            table: table.to_string(),
            status: TableStatus::Skipped,
            inserted: 0,
            updated: 0,
            cursor_id: mysync_core::INITIAL_CURSOR,
            file: None,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub stamp: String,
    pub capture_instant: String,
    pub tables: Vec<TableOutcome>,
}

impl BackupReport {
    #[must_use]
    pub fn files(&self) -> Vec<&PathBuf> {
        self.tables.iter().filter_map(|outcome| outcome.file.as_ref()).collect()
    }
}

/// One backup run over every selected table, sequentially.
pub struct BackupRunner<C, S> {
    conn: C,
    store: S,
    config: BackupConfig,
    cancel: CancelFlag,
}

impl<C: SqlConnection, S: CheckpointStore> BackupRunner<C, S> {
    #[must_use]
    pub fn new(conn: C, store: S, config: BackupConfig) -> Self {
        Self { conn, store, config, cancel: CancelFlag::new() }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Export the delta of every selected table and advance its checkpoint.
    ///
    /// Tables whose key cannot drive a cursor are skipped with a warning. Any other failure
    /// stops the run; tables finished before it keep their advanced checkpoints.
    ///
    /// # Errors
    /// Returns [`SyncError::RoleViolation`] before any database read when the control store
    /// already marks this database as a restore target, [`SyncError::Cancelled`] when the run
    /// is interrupted, and any connection, file or store error.
    pub fn run(&mut self) -> Result<BackupReport, SyncError> {
        ensure_role(&mut self.store, RunType::Backup)?;

        let tables: Vec<String> = self
            .conn
            .list_tables()?
            .into_iter()
            .filter(|table| table != CONTROL_TABLE && self.config.filter.allows(table))
            .collect();
        tracing::info!(tables = tables.len(), dir = %self.config.dir.display(), "starting backup run");

        if !self.config.options.settle_pause.is_zero() {
            std::thread::sleep(self.config.options.settle_pause);
        }
        let instant = self.conn.current_time()?;
        let stamp = RunStamp(instant);

        let introspector = SchemaIntrospector::new(self.config.overrides.clone());
        let engine = ChangeCaptureEngine::new(self.config.options, &self.config.dir, self.cancel.clone());
        let mut report = BackupReport {
            stamp: stamp.to_string(),
            capture_instant: format_datetime(instant),
            tables: Vec::with_capacity(tables.len()),
        };

        for table in &tables {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let columns = introspector.describe(&mut self.conn, table)?;
            let roles = introspector.roles_for(table, &columns);
            if let Some(reason) = SchemaIntrospector::uncursorable_reason(&columns, &roles) {
                tracing::warn!(table = %table, reason = %reason, "skipping table");
                report.tables.push(TableOutcome::skipped(table, reason));
                continue;
            }
            let name = match BackupFileName::new(table, stamp) {
                Ok(name) => name,
                Err(err) => {
                    tracing::warn!(table = %table, error = %err, "skipping table");
                    report.tables.push(TableOutcome::skipped(table, err.to_string()));
                    continue;
                }
            };

            let checkpoint = self.store.upsert(RunType::Backup, table, &roles)?;
            let snapshot = self.config.schema_snapshot.then_some(columns.as_slice());
            let outcome = engine.capture_table(&mut self.conn, &checkpoint, instant, &name, snapshot)?;

            let cursor_id = outcome.new_cursor.max(checkpoint.cursor_id);
            let status = if outcome.file.is_some() {
                self.store.advance(table, cursor_id, instant, outcome.delta_count())?;
                TableStatus::Exported
            } else {
                TableStatus::Unchanged
            };

            report.tables.push(TableOutcome {
                table: table.clone(),
                status,
                inserted: outcome.inserted,
                updated: outcome.updated,
                cursor_id,
                file: outcome.file,
                reason: None,
            });
        }

        tracing::info!(stamp = %report.stamp, files = report.files().len(), "backup run finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use anyhow::Result;
    use mysync_core::{ChangeLogEntry, ChangeOp, ColumnDescriptor, KeyRole, TableRoleFields};
    use mysync_store_sqlite::SqliteCheckpointStore;
    use time::macros::datetime;

    use super::*;
    use crate::testing::{orders_columns, MemoryDatabase};

    fn config(dir: &Path) -> BackupConfig {
        let mut config = BackupConfig::new(dir);
        config.options = CaptureOptions {
            page_size: 2,
            settle_pause: Duration::ZERO,
            page_pause: Duration::ZERO,
        };
        config
    }

    fn read_entries(path: &Path) -> Result<Vec<ChangeLogEntry>> {
        let body = std::fs::read_to_string(path)?;
        let entries = body
            .lines()
            .enumerate()
            .map(|(index, line)| ChangeLogEntry::parse_line(line, index + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn seeded_orders() -> MemoryDatabase {
        let mut db = MemoryDatabase::new(datetime!(2024-06-01 12:00));
        db.create_table("orders", orders_columns());
        for id in 1..=5 {
            db.insert_at("orders", id, datetime!(2024-06-01 10:00));
        }
        db
    }

    fn dir_entries(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    #[test]
    fn second_run_exports_only_the_delta() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = seeded_orders();
        let mut store = SqliteCheckpointStore::open(Path::new(":memory:"))?;

        let first = BackupRunner::new(&mut db, &mut store, config(dir.path())).run()?;
        assert_eq!(first.tables[0].status, TableStatus::Exported);
        assert_eq!((first.tables[0].inserted, first.tables[0].updated), (5, 0));

        db.insert_at("orders", 6, datetime!(2024-06-01 12:30));
        db.insert_at("orders", 7, datetime!(2024-06-01 12:30));
        db.touch("orders", 3, "renamed", datetime!(2024-06-01 12:30));
        db.set_now(datetime!(2024-06-01 13:00));

        let second = BackupRunner::new(&mut db, &mut store, config(dir.path())).run()?;
        let outcome = &second.tables[0];
        assert_eq!((outcome.inserted, outcome.updated, outcome.cursor_id), (2, 1, 7));

        let file = outcome.file.as_ref().ok_or_else(|| anyhow::anyhow!("no change log"))?;
        let ops: Vec<(ChangeOp, i64)> =
            read_entries(file)?.iter().map(|entry| (entry.op, entry.key)).collect();
        assert_eq!(ops, vec![(ChangeOp::Insert, 6), (ChangeOp::Insert, 7), (ChangeOp::Update, 3)]);

        let record = store.record("orders")?.ok_or_else(|| anyhow::anyhow!("no checkpoint"))?;
        assert_eq!(record.cursor_id, 7);
        assert_eq!(record.watermark, datetime!(2024-06-01 13:00));
        assert_eq!(record.delta_count, 3);
        Ok(())
    }

    #[test]
    fn updated_rows_spanning_several_pages_come_out_once_in_key_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = seeded_orders();
        let mut store = SqliteCheckpointStore::open(Path::new(":memory:"))?;
        BackupRunner::new(&mut db, &mut store, config(dir.path())).run()?;

        for id in [5, 1, 4, 2] {
            db.touch("orders", id, "renamed", datetime!(2024-06-01 12:30));
        }
        db.set_now(datetime!(2024-06-01 13:00));
        let fetches_before = db.fetches();

        let report = BackupRunner::new(&mut db, &mut store, config(dir.path())).run()?;
        let outcome = &report.tables[0];
        assert_eq!((outcome.inserted, outcome.updated, outcome.cursor_id), (0, 4, 5));
        assert!(db.fetches() - fetches_before >= 3, "four updates at page size 2 need three pages");

        let file = outcome.file.as_ref().ok_or_else(|| anyhow::anyhow!("no change log"))?;
        let ops: Vec<(ChangeOp, i64)> =
            read_entries(file)?.iter().map(|entry| (entry.op, entry.key)).collect();
        assert_eq!(
            ops,
            vec![
                (ChangeOp::Update, 1),
                (ChangeOp::Update, 2),
                (ChangeOp::Update, 4),
                (ChangeOp::Update, 5),
            ]
        );
        Ok(())
    }

    #[test]
    fn unchanged_tables_write_nothing_and_keep_their_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = seeded_orders();
        let mut store = SqliteCheckpointStore::open(Path::new(":memory:"))?;

        BackupRunner::new(&mut db, &mut store, config(dir.path())).run()?;
        let before = store.record("orders")?;
        let files_before = dir_entries(dir.path())?;

        db.set_now(datetime!(2024-06-01 13:00));
        let report = BackupRunner::new(&mut db, &mut store, config(dir.path())).run()?;

        assert_eq!(report.tables[0].status, TableStatus::Unchanged);
        assert_eq!(store.record("orders")?, before);
        assert_eq!(dir_entries(dir.path())?, files_before);
        Ok(())
    }

    #[test]
    fn first_run_writes_log_and_snapshot_pair() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = seeded_orders();
        let mut store = SqliteCheckpointStore::open(Path::new(":memory:"))?;

        let report = BackupRunner::new(&mut db, &mut store, config(dir.path())).run()?;

        assert_eq!(report.stamp, "2024-06-01_12-00-00");
        assert_eq!(
            dir_entries(dir.path())?,
            vec![
                "backup.orders.2024-06-01_12-00-00.json".to_string(),
                "scheme.orders.2024-06-01_12-00-00.json".to_string(),
            ]
        );
        let snapshot: Vec<ColumnDescriptor> = serde_json::from_slice(&std::fs::read(
            dir.path().join("scheme.orders.2024-06-01_12-00-00.json"),
        )?)?;
        assert_eq!(snapshot, orders_columns());
        Ok(())
    }

    #[test]
    fn tables_without_update_field_export_inserts_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = seeded_orders();
        let columns: Vec<ColumnDescriptor> =
            orders_columns().into_iter().filter(|column| column.field != "update_at").collect();
        db.create_table("events", columns);
        db.insert_at("events", 1, datetime!(2024-06-01 10:00));
        let mut store = SqliteCheckpointStore::open(Path::new(":memory:"))?;

        BackupRunner::new(&mut db, &mut store, config(dir.path())).run()?;
        db.touch("events", 1, "renamed", datetime!(2024-06-01 12:30));
        db.set_now(datetime!(2024-06-01 13:00));
        let report = BackupRunner::new(&mut db, &mut store, config(dir.path())).run()?;

        let events = report
            .tables
            .iter()
            .find(|outcome| outcome.table == "events")
            .ok_or_else(|| anyhow::anyhow!("events missing from report"))?;
        assert_eq!(events.status, TableStatus::Unchanged);
        assert_eq!(events.updated, 0);
        Ok(())
    }

    #[test]
    fn cancelled_capture_leaves_no_file_and_no_progress() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = seeded_orders();
        let cancel = CancelFlag::new();
        db.cancel_after_fetches(1, cancel.clone());
        let mut store = SqliteCheckpointStore::open(Path::new(":memory:"))?;

        let result = BackupRunner::new(&mut db, &mut store, config(dir.path()))
            .with_cancel(cancel)
            .run();

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(dir_entries(dir.path())?.is_empty());
        let record = store.record("orders")?.ok_or_else(|| anyhow::anyhow!("no checkpoint"))?;
        assert_eq!(record.cursor_id, mysync_core::INITIAL_CURSOR);
        assert_eq!(record.delta_count, 0);
        Ok(())
    }

    #[test]
    fn restore_target_refuses_backup_before_reading() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = seeded_orders();
        let mut store = SqliteCheckpointStore::open(Path::new(":memory:"))?;
        store.upsert_record(RunType::Restore, "orders", &TableRoleFields::default())?;

        let result = BackupRunner::new(&mut db, &mut store, config(dir.path())).run();

        assert!(matches!(
            result,
            Err(SyncError::RoleViolation { requested: RunType::Backup, found: RunType::Restore })
        ));
        assert_eq!(db.calls(), 0);
        assert!(dir_entries(dir.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn control_table_filtered_tables_and_keyless_tables_are_left_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = seeded_orders();
        db.create_table(CONTROL_TABLE, orders_columns());
        db.insert_at(CONTROL_TABLE, 1, datetime!(2024-06-01 10:00));
        db.create_table("audit", orders_columns());
        db.insert_at("audit", 1, datetime!(2024-06-01 10:00));
        db.create_table(
            "notes",
            vec![ColumnDescriptor {
                field: "body".to_string(),
                column_type: "text".to_string(),
                nullable: true,
                key_role: KeyRole::Other(String::new()),
                default: String::new(),
                extra: String::new(),
            }],
        );
        let mut store = SqliteCheckpointStore::open(Path::new(":memory:"))?;

        let mut config = config(dir.path());
        config.filter = TableFilter::from_comma_lists("", "audit");
        let report = BackupRunner::new(&mut db, &mut store, config).run()?;

        let statuses: Vec<(&str, TableStatus)> =
            report.tables.iter().map(|outcome| (outcome.table.as_str(), outcome.status)).collect();
        assert_eq!(statuses, vec![("notes", TableStatus::Skipped), ("orders", TableStatus::Exported)]);
        assert!(store.record(CONTROL_TABLE)?.is_none());
        assert!(store.record("notes")?.is_none());
        Ok(())
    }
}
