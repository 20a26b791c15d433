use anyhow::{Context, Result};
use mysql_async::prelude::Queryable;
use mysql_async::Params;
use mysync_core::{
    format_datetime, parse_datetime, CheckpointRecord, CheckpointStore, RunType, SyncError,
    TableRoleFields, CONTROL_TABLE, INITIAL_CURSOR, INITIAL_WATERMARK,
};
use time::PrimitiveDateTime;

use crate::{wait, MysqlSession};

const CREATE_CONTROL_TABLE: &str = "CREATE TABLE IF NOT EXISTS `mysync` (
    id int NOT NULL AUTO_INCREMENT,
    run_type char(7) NOT NULL,
    table_name varchar(64) NOT NULL,
    pkey_field varchar(64) NOT NULL DEFAULT '',
    create_field varchar(64) NOT NULL DEFAULT '',
    update_field varchar(64) NOT NULL DEFAULT '',
    latest_id bigint NOT NULL DEFAULT -1,
    latest_time datetime NOT NULL DEFAULT '1970-01-01 00:00:00',
    record_count bigint unsigned NOT NULL DEFAULT 0,
    create_at timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP,
    update_at timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
    PRIMARY KEY (id),
    UNIQUE KEY uniq_mysync_table_name (table_name)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

const SELECT_RECORD: &str = "SELECT run_type, table_name, pkey_field, create_field, update_field,
        latest_id, DATE_FORMAT(latest_time, '%Y-%m-%d %H:%i:%s'), record_count
     FROM `mysync`";

type RawRecord = (String, String, String, String, String, i64, String, u64);

/// Checkpoints kept in the `mysync` table of the database being synchronized.
pub struct MysqlCheckpointStore {
    session: MysqlSession,
}

impl MysqlCheckpointStore {
    /// Use `session` for the control table, creating the table when it is missing.
    ///
    /// # Errors
    /// Returns an error when the control table cannot be created.
    pub fn open(mut session: MysqlSession) -> Result<Self> {
        let s = &mut session;
        wait(&s.runtime, s.timeout, s.conn.query_drop(CREATE_CONTROL_TABLE))
            .with_context(|| format!("failed to create control table {CONTROL_TABLE}"))?;
        Ok(Self { session })
    }

    fn records_where(
        &mut self,
        clause: &str,
        params: Vec<mysql_async::Value>,
    ) -> Result<Vec<CheckpointRecord>, SyncError> {
        let sql = format!("{SELECT_RECORD} {clause}");
        let s = &mut self.session;
        let params = if params.is_empty() { Params::Empty } else { Params::Positional(params) };
        let rows: Vec<RawRecord> = wait(&s.runtime, s.timeout, s.conn.exec(sql, params))?;
        rows.into_iter().map(into_record).collect()
    }
}

fn optional(field: String) -> Option<String> {
    (!field.is_empty()).then_some(field)
}

fn into_record(raw: RawRecord) -> Result<CheckpointRecord, SyncError> {
    let (run_type, table_name, pkey, create, update, cursor_id, watermark, delta_count) = raw;
    let run_type = RunType::parse(run_type.trim()).ok_or_else(|| {
        SyncError::Database(format!("unknown run type {run_type:?} for table {table_name}"))
    })?;
    Ok(CheckpointRecord {
        run_type,
        table_name,
        fields: TableRoleFields {
            primary_key_field: optional(pkey),
            create_time_field: optional(create),
            update_time_field: optional(update),
        },
        cursor_id,
        watermark: parse_datetime(&watermark)?,
        delta_count,
    })
}

fn role_text(field: Option<&String>) -> mysql_async::Value {
    mysql_async::Value::from(field.map(String::as_str).unwrap_or_default())
}

impl CheckpointStore for MysqlCheckpointStore {
    fn find_by_table(&mut self, table: &str) -> Result<Option<CheckpointRecord>, SyncError> {
        let mut records = self.records_where("WHERE table_name = ?", vec![table.into()])?;
        Ok(records.pop())
    }

    fn upsert(
        &mut self,
        run_type: RunType,
        table: &str,
        fields: &TableRoleFields,
    ) -> Result<CheckpointRecord, SyncError> {
        let params: Vec<mysql_async::Value> = vec![
            run_type.as_str().into(),
            table.into(),
            role_text(fields.primary_key_field.as_ref()),
            role_text(fields.create_time_field.as_ref()),
            role_text(fields.update_time_field.as_ref()),
            INITIAL_CURSOR.into(),
            format_datetime(INITIAL_WATERMARK).into(),
        ];
        let s = &mut self.session;
        wait(
            &s.runtime,
            s.timeout,
            s.conn.exec_drop(
                "INSERT INTO `mysync`
                    (run_type, table_name, pkey_field, create_field, update_field, latest_id, latest_time, record_count)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0)
                 ON DUPLICATE KEY UPDATE
                    pkey_field = VALUES(pkey_field),
                    create_field = VALUES(create_field),
                    update_field = VALUES(update_field)",
                Params::Positional(params),
            ),
        )?;

        self.find_by_table(table)?
            .ok_or_else(|| SyncError::MissingCheckpoint(table.to_string()))
    }

    fn advance(
        &mut self,
        table: &str,
        cursor_id: i64,
        watermark: PrimitiveDateTime,
        delta_count: u64,
    ) -> Result<(), SyncError> {
        // MySQL reports zero affected rows for an unchanged row, so existence is checked first.
        if self.find_by_table(table)?.is_none() {
            return Err(SyncError::MissingCheckpoint(table.to_string()));
        }

        let params: Vec<mysql_async::Value> = vec![
            cursor_id.into(),
            format_datetime(watermark).into(),
            delta_count.into(),
            table.into(),
        ];
        let s = &mut self.session;
        wait(
            &s.runtime,
            s.timeout,
            s.conn.exec_drop(
                "UPDATE `mysync`
                 SET latest_id = GREATEST(latest_id, ?),
                     latest_time = GREATEST(latest_time, ?),
                     record_count = ?
                 WHERE table_name = ?",
                Params::Positional(params),
            ),
        )?;
        tracing::debug!(table, cursor_id, delta_count, "checkpoint advanced");
        Ok(())
    }

    fn has_any_of_type(&mut self, run_type: RunType) -> Result<bool, SyncError> {
        let s = &mut self.session;
        let count: Option<u64> = wait(
            &s.runtime,
            s.timeout,
            s.conn.exec_first(
                "SELECT COUNT(*) FROM `mysync` WHERE run_type = ?",
                Params::Positional(vec![run_type.as_str().into()]),
            ),
        )?;
        Ok(count.unwrap_or_default() > 0)
    }

    fn list(&mut self) -> Result<Vec<CheckpointRecord>, SyncError> {
        self.records_where("ORDER BY table_name", Vec::new())
    }
}
