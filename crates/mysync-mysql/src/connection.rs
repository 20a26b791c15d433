use mysql_async::prelude::Queryable;
use mysql_async::Params;
use mysync_core::{
    parse_datetime, quote_ident, ColumnDescriptor, InsertOutcome, KeyRole, Row, RowFilter,
    SqlConnection, SyncError,
};
use time::PrimitiveDateTime;

use crate::sql::{
    count_statement, insert_statement, select_statement, update_statement, value_to_json,
    ER_DUP_ENTRY,
};
use crate::{wait, wait_raw, MysqlSession};

/// The database being backed up or restored.
pub struct MysqlConnection {
    session: MysqlSession,
}

impl MysqlConnection {
    #[must_use]
    pub fn new(session: MysqlSession) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn into_session(self) -> MysqlSession {
        self.session
    }
}

fn cell_text(row: &mysql_async::Row, index: usize) -> String {
    match row.as_ref(index) {
        Some(mysql_async::Value::Bytes(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
        Some(mysql_async::Value::NULL) | None => String::new(),
        Some(other) => other.as_sql(true).trim_matches('\'').to_string(),
    }
}

fn descriptor_from(row: &mysql_async::Row) -> ColumnDescriptor {
    let key = cell_text(row, 3);
    ColumnDescriptor {
        field: cell_text(row, 0),
        column_type: cell_text(row, 1),
        nullable: cell_text(row, 2).eq_ignore_ascii_case("YES"),
        key_role: KeyRole::from(key),
        default: cell_text(row, 4),
        extra: cell_text(row, 5),
    }
}

fn payload_from(row: &mysql_async::Row) -> Row {
    let mut payload = Row::new();
    for (index, column) in row.columns_ref().iter().enumerate() {
        let value = row
            .as_ref(index)
            .map_or(serde_json::Value::Null, |value| value_to_json(value, column.column_type()));
        payload.insert(column.name_str().into_owned(), value);
    }
    payload
}

impl SqlConnection for MysqlConnection {
    fn list_tables(&mut self) -> Result<Vec<String>, SyncError> {
        let s = &mut self.session;
        wait(&s.runtime, s.timeout, s.conn.query::<String, _>("SHOW TABLES"))
    }

    fn describe(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, SyncError> {
        let s = &mut self.session;
        let rows: Vec<mysql_async::Row> = wait(
            &s.runtime,
            s.timeout,
            s.conn.query(format!("DESCRIBE {}", quote_ident(table))),
        )?;
        Ok(rows.iter().map(descriptor_from).collect())
    }

    fn current_time(&mut self) -> Result<PrimitiveDateTime, SyncError> {
        let s = &mut self.session;
        let now: Option<String> = wait(
            &s.runtime,
            s.timeout,
            s.conn.query_first("SELECT DATE_FORMAT(NOW(), '%Y-%m-%d %H:%i:%s')"),
        )?;
        let now = now.ok_or_else(|| SyncError::Database("server returned no current time".to_string()))?;
        parse_datetime(&now)
    }

    fn count_rows(&mut self, table: &str, filter: &RowFilter) -> Result<u64, SyncError> {
        let (sql, params) = count_statement(table, filter);
        let s = &mut self.session;
        let count: Option<u64> =
            wait(&s.runtime, s.timeout, s.conn.exec_first(sql, Params::Positional(params)))?;
        Ok(count.unwrap_or_default())
    }

    fn fetch_rows(
        &mut self,
        table: &str,
        filter: &RowFilter,
        limit: usize,
    ) -> Result<Vec<Row>, SyncError> {
        let (sql, params) = select_statement(table, filter, limit);
        let s = &mut self.session;
        let rows: Vec<mysql_async::Row> =
            wait(&s.runtime, s.timeout, s.conn.exec(sql, Params::Positional(params)))?;
        Ok(rows.iter().map(payload_from).collect())
    }

    fn execute_ddl(&mut self, statement: &str) -> Result<(), SyncError> {
        tracing::debug!(statement, "executing ddl");
        let s = &mut self.session;
        wait(&s.runtime, s.timeout, s.conn.query_drop(statement))
    }

    fn insert_row(&mut self, table: &str, row: &Row) -> Result<InsertOutcome, SyncError> {
        let (sql, params) = insert_statement(table, row)?;
        let s = &mut self.session;
        match wait_raw(&s.runtime, s.timeout, s.conn.exec_drop(sql, Params::Positional(params)))? {
            Ok(()) => Ok(InsertOutcome::Inserted),
            Err(mysql_async::Error::Server(server)) if server.code == ER_DUP_ENTRY => {
                tracing::debug!(table, message = %server.message, "row already present");
                Ok(InsertOutcome::Duplicate)
            }
            Err(err) => Err(SyncError::database(err)),
        }
    }

    fn update_row(
        &mut self,
        table: &str,
        key_field: &str,
        key: i64,
        values: &Row,
    ) -> Result<u64, SyncError> {
        let (sql, params) = update_statement(table, key_field, key, values)?;
        let s = &mut self.session;
        wait(&s.runtime, s.timeout, s.conn.exec_drop(sql, Params::Positional(params)))?;
        Ok(s.conn.affected_rows())
    }
}
