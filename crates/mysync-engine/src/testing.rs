//! In-memory [`SqlConnection`] used by the engine tests.

use std::collections::BTreeMap;

use mysync_core::{
    format_datetime, parse_datetime, row_key, row_text, ColumnDescriptor, InsertOutcome,
    KeyRole, Row, RowFilter, SqlConnection, SyncError,
};
use serde_json::Value;
use time::PrimitiveDateTime;

use crate::CancelFlag;

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<ColumnDescriptor>,
    rows: BTreeMap<i64, Row>,
}

impl MemoryTable {
    fn key_field(&self) -> Option<&str> {
        self.columns.iter().find(|column| column.is_primary()).map(|column| column.field.as_str())
    }
}

#[derive(Debug)]
pub(crate) struct MemoryDatabase {
    now: PrimitiveDateTime,
    tables: BTreeMap<String, MemoryTable>,
    templates: BTreeMap<String, Vec<ColumnDescriptor>>,
    ddl_log: Vec<String>,
    calls: usize,
    fetches: usize,
    cancel_after_fetches: Option<(usize, CancelFlag)>,
    failing_inserts: Option<String>,
}

impl MemoryDatabase {
    pub(crate) fn new(now: PrimitiveDateTime) -> Self {
        Self {
            now,
            tables: BTreeMap::new(),
            templates: BTreeMap::new(),
            ddl_log: Vec::new(),
            calls: 0,
            fetches: 0,
            cancel_after_fetches: None,
            failing_inserts: None,
        }
    }

    pub(crate) fn set_now(&mut self, now: PrimitiveDateTime) {
        self.now = now;
    }

    pub(crate) fn create_table(&mut self, table: &str, columns: Vec<ColumnDescriptor>) {
        self.tables.insert(table.to_string(), MemoryTable { columns, rows: BTreeMap::new() });
    }

    /// Columns a later `CREATE TABLE` for `table` will produce.
    pub(crate) fn expect_schema(&mut self, table: &str, columns: Vec<ColumnDescriptor>) {
        self.templates.insert(table.to_string(), columns);
    }

    /// Insert an `orders`-shaped row created and last updated at `at`.
    pub(crate) fn insert_at(&mut self, table: &str, id: i64, at: PrimitiveDateTime) {
        let mut row = Row::new();
        row.insert("id".to_string(), Value::from(id));
        row.insert("name".to_string(), Value::from(format!("order-{id}")));
        row.insert("create_at".to_string(), Value::from(format_datetime(at)));
        row.insert("update_at".to_string(), Value::from(format_datetime(at)));
        if let Some(memory) = self.tables.get_mut(table) {
            memory.rows.insert(id, row);
        }
    }

    /// Rename a row and bump its update time, as an `ON UPDATE CURRENT_TIMESTAMP` column would.
    pub(crate) fn touch(&mut self, table: &str, id: i64, name: &str, at: PrimitiveDateTime) {
        if let Some(row) = self.tables.get_mut(table).and_then(|memory| memory.rows.get_mut(&id)) {
            row.insert("name".to_string(), Value::from(name));
            row.insert("update_at".to_string(), Value::from(format_datetime(at)));
        }
    }

    pub(crate) fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.get(table).map(|memory| memory.rows.values().cloned().collect()).unwrap_or_default()
    }

    pub(crate) fn ddl_log(&self) -> &[String] {
        &self.ddl_log
    }

    /// Every call made through the [`SqlConnection`] surface.
    pub(crate) fn calls(&self) -> usize {
        self.calls
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches
    }

    pub(crate) fn cancel_after_fetches(&mut self, fetches: usize, flag: CancelFlag) {
        self.cancel_after_fetches = Some((fetches, flag));
    }

    pub(crate) fn fail_inserts_into(&mut self, table: &str) {
        self.failing_inserts = Some(table.to_string());
    }

    fn table(&self, table: &str) -> Result<&MemoryTable, SyncError> {
        self.tables
            .get(table)
            .ok_or_else(|| SyncError::Database(format!("Table '{table}' doesn't exist")))
    }

    fn matching(&self, table: &str, filter: &RowFilter) -> Result<Vec<Row>, SyncError> {
        let memory = self.table(table)?;
        let mut rows = Vec::new();
        for row in memory.rows.values() {
            let Some(key) = row_key(row, &filter.key_field) else {
                continue;
            };
            if key <= filter.key_after || filter.key_through.is_some_and(|through| key > through) {
                continue;
            }
            if let Some(window) = &filter.updated {
                let Ok(updated) = parse_datetime(&row_text(row, &window.field)) else {
                    continue;
                };
                if updated <= window.after || updated > window.until {
                    continue;
                }
            }
            rows.push(row.clone());
        }
        Ok(rows)
    }
}

/// `id`, `name`, and create and update timestamps maintained by the server.
pub(crate) fn orders_columns() -> Vec<ColumnDescriptor> {
    let column = |field: &str, column_type: &str, key_role: KeyRole, default: &str, extra: &str| {
        ColumnDescriptor {
            field: field.to_string(),
            column_type: column_type.to_string(),
            nullable: false,
            key_role,
            default: default.to_string(),
            extra: extra.to_string(),
        }
    };
    vec![
        column("id", "bigint(20)", KeyRole::Primary, "", "auto_increment"),
        column("name", "varchar(64)", KeyRole::Other(String::new()), "", ""),
        column(
            "create_at",
            "timestamp",
            KeyRole::Other(String::new()),
            "CURRENT_TIMESTAMP",
            "DEFAULT_GENERATED",
        ),
        column(
            "update_at",
            "timestamp",
            KeyRole::Other(String::new()),
            "CURRENT_TIMESTAMP",
            "DEFAULT_GENERATED on update CURRENT_TIMESTAMP",
        ),
    ]
}

fn created_table_name(statement: &str) -> Option<String> {
    let rest = statement.strip_prefix("CREATE TABLE `")?;
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

impl SqlConnection for MemoryDatabase {
    fn list_tables(&mut self) -> Result<Vec<String>, SyncError> {
        self.calls += 1;
        Ok(self.tables.keys().cloned().collect())
    }

    fn describe(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, SyncError> {
        self.calls += 1;
        Ok(self.table(table)?.columns.clone())
    }

    fn current_time(&mut self) -> Result<PrimitiveDateTime, SyncError> {
        self.calls += 1;
        Ok(self.now)
    }

    fn count_rows(&mut self, table: &str, filter: &RowFilter) -> Result<u64, SyncError> {
        self.calls += 1;
        Ok(self.matching(table, filter)?.len() as u64)
    }

    fn fetch_rows(
        &mut self,
        table: &str,
        filter: &RowFilter,
        limit: usize,
    ) -> Result<Vec<Row>, SyncError> {
        self.calls += 1;
        self.fetches += 1;
        if let Some((after, flag)) = &self.cancel_after_fetches {
            if self.fetches >= *after {
                flag.cancel();
            }
        }
        let mut rows = self.matching(table, filter)?;
        rows.truncate(limit);
        Ok(rows)
    }

    fn execute_ddl(&mut self, statement: &str) -> Result<(), SyncError> {
        self.calls += 1;
        self.ddl_log.push(statement.to_string());
        if let Some(table) = created_table_name(statement) {
            if self.tables.contains_key(&table) {
                return Err(SyncError::Database(format!("Table '{table}' already exists")));
            }
            let columns = self.templates.get(&table).cloned().unwrap_or_default();
            self.create_table(&table, columns);
        }
        Ok(())
    }

    fn insert_row(&mut self, table: &str, row: &Row) -> Result<InsertOutcome, SyncError> {
        self.calls += 1;
        if self.failing_inserts.as_deref() == Some(table) {
            return Err(SyncError::Database(format!("insert into {table} rejected")));
        }
        let memory = self
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::Database(format!("Table '{table}' doesn't exist")))?;
        let key_field = memory
            .key_field()
            .ok_or_else(|| SyncError::Database(format!("table {table} has no primary key")))?;
        let key = row_key(row, key_field)
            .ok_or_else(|| SyncError::Database(format!("row for {table} has no {key_field}")))?;
        if memory.rows.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        memory.rows.insert(key, row.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn update_row(
        &mut self,
        table: &str,
        _key_field: &str,
        key: i64,
        values: &Row,
    ) -> Result<u64, SyncError> {
        self.calls += 1;
        let memory = self
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::Database(format!("Table '{table}' doesn't exist")))?;
        let Some(row) = memory.rows.get_mut(&key) else {
            return Ok(0);
        };
        for (field, value) in values {
            row.insert(field.clone(), value.clone());
        }
        Ok(1)
    }
}
