use std::path::Path;

use anyhow::{anyhow, Context, Result};
use mysync_core::{
    format_datetime, parse_datetime, CheckpointRecord, CheckpointStore, RunType, SyncError,
    TableRoleFields, CONTROL_TABLE, INITIAL_CURSOR, INITIAL_WATERMARK,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, PrimitiveDateTime};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS mysync (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_type TEXT NOT NULL CHECK (run_type IN ('backup','restore')),
  table_name TEXT NOT NULL UNIQUE,
  pkey_field TEXT NOT NULL DEFAULT '',
  create_field TEXT NOT NULL DEFAULT '',
  update_field TEXT NOT NULL DEFAULT '',
  latest_id INTEGER NOT NULL,
  latest_time TEXT NOT NULL,
  record_count INTEGER NOT NULL DEFAULT 0 CHECK (record_count >= 0),
  create_at TEXT NOT NULL,
  update_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mysync_run_type ON mysync(run_type);
";

const SELECT_RECORD_COLUMNS: &str = "run_type, table_name, pkey_field, create_field, update_field,
     latest_id, latest_time, record_count";

/// Checkpoint records kept in a local `SQLite` control file instead of the database being
/// backed up.
pub struct SqliteCheckpointStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteCheckpointStore {
    /// Open the control file, configure runtime pragmas and apply pending migrations.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, configured or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite control store at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect();

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the file is from a newer release.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported control store version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "applied control store migration");
        }

        Ok(())
    }

    /// Load the checkpoint of one table.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or the stored row cannot be decoded.
    pub fn record(&self, table: &str) -> Result<Option<CheckpointRecord>> {
        let query = format!("SELECT {SELECT_RECORD_COLUMNS} FROM {CONTROL_TABLE} WHERE table_name = ?1");
        let raw = self
            .conn
            .query_row(&query, params![table], RawRecord::from_row)
            .optional()
            .with_context(|| format!("failed to load checkpoint for {table}"))?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Insert a fresh record, or refresh only the role fields of an existing one.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_record(
        &mut self,
        run_type: RunType,
        table: &str,
        fields: &TableRoleFields,
    ) -> Result<CheckpointRecord> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO mysync(
                    run_type, table_name, pkey_field, create_field, update_field,
                    latest_id, latest_time, record_count, create_at, update_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
                 ON CONFLICT(table_name) DO UPDATE SET
                    pkey_field = excluded.pkey_field,
                    create_field = excluded.create_field,
                    update_field = excluded.update_field,
                    update_at = excluded.update_at",
                params![
                    run_type.as_str(),
                    table,
                    fields.primary_key_field.as_deref().unwrap_or_default(),
                    fields.create_time_field.as_deref().unwrap_or_default(),
                    fields.update_time_field.as_deref().unwrap_or_default(),
                    INITIAL_CURSOR,
                    format_datetime(INITIAL_WATERMARK),
                    now,
                ],
            )
            .with_context(|| format!("failed to upsert checkpoint for {table}"))?;

        self.record(table)?
            .ok_or_else(|| anyhow!("checkpoint for {table} vanished after upsert"))
    }

    /// Move cursor and watermark forward; values behind the stored ones are ignored.
    ///
    /// Returns `false` when the table has no record.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn advance_record(
        &mut self,
        table: &str,
        cursor_id: i64,
        watermark: PrimitiveDateTime,
        delta_count: u64,
    ) -> Result<bool> {
        let delta_count = i64::try_from(delta_count).context("delta count exceeds i64")?;
        let changed = self
            .conn
            .execute(
                "UPDATE mysync SET
                    latest_id = MAX(latest_id, ?2),
                    latest_time = MAX(latest_time, ?3),
                    record_count = ?4,
                    update_at = ?5
                 WHERE table_name = ?1",
                params![table, cursor_id, format_datetime(watermark), delta_count, now_rfc3339()?],
            )
            .with_context(|| format!("failed to advance checkpoint for {table}"))?;
        Ok(changed == 1)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn has_records_of_type(&self, run_type: RunType) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM mysync WHERE run_type = ?1)",
                params![run_type.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to read checkpoint run types")?;
        Ok(exists == 1)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn records(&self) -> Result<Vec<CheckpointRecord>> {
        let query =
            format!("SELECT {SELECT_RECORD_COLUMNS} FROM {CONTROL_TABLE} ORDER BY table_name ASC");
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], RawRecord::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn find_by_table(&mut self, table: &str) -> Result<Option<CheckpointRecord>, SyncError> {
        self.record(table).map_err(store_error)
    }

    fn upsert(
        &mut self,
        run_type: RunType,
        table: &str,
        fields: &TableRoleFields,
    ) -> Result<CheckpointRecord, SyncError> {
        self.upsert_record(run_type, table, fields).map_err(store_error)
    }

    fn advance(
        &mut self,
        table: &str,
        cursor_id: i64,
        watermark: PrimitiveDateTime,
        delta_count: u64,
    ) -> Result<(), SyncError> {
        if self.advance_record(table, cursor_id, watermark, delta_count).map_err(store_error)? {
            Ok(())
        } else {
            Err(SyncError::MissingCheckpoint(table.to_string()))
        }
    }

    fn has_any_of_type(&mut self, run_type: RunType) -> Result<bool, SyncError> {
        self.has_records_of_type(run_type).map_err(store_error)
    }

    fn list(&mut self) -> Result<Vec<CheckpointRecord>, SyncError> {
        self.records().map_err(store_error)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn store_error(err: anyhow::Error) -> SyncError {
    SyncError::Database(format!("{err:#}"))
}

struct RawRecord {
    run_type: String,
    table_name: String,
    pkey_field: String,
    create_field: String,
    update_field: String,
    latest_id: i64,
    latest_time: String,
    record_count: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_type: row.get(0)?,
            table_name: row.get(1)?,
            pkey_field: row.get(2)?,
            create_field: row.get(3)?,
            update_field: row.get(4)?,
            latest_id: row.get(5)?,
            latest_time: row.get(6)?,
            record_count: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<CheckpointRecord> {
        let run_type = RunType::parse(&self.run_type)
            .ok_or_else(|| anyhow!("unknown run_type: {}", self.run_type))?;
        let watermark = parse_datetime(&self.latest_time)
            .with_context(|| format!("invalid latest_time for {}", self.table_name))?;

        Ok(CheckpointRecord {
            run_type,
            fields: TableRoleFields {
                primary_key_field: non_empty(self.pkey_field),
                create_time_field: non_empty(self.create_field),
                update_time_field: non_empty(self.update_field),
            },
            table_name: self.table_name,
            cursor_id: self.latest_id,
            watermark,
            delta_count: u64::try_from(self.record_count).unwrap_or_default(),
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
