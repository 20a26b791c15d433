use serde_json::{Map, Value};
use time::PrimitiveDateTime;

use crate::schema::ColumnDescriptor;
use crate::SyncError;

/// Column name to value, in the column order the server returned.
pub type Row = Map<String, Value>;

/// `after < field <= until`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateWindow {
    pub field: String,
    pub after: PrimitiveDateTime,
    pub until: PrimitiveDateTime,
}

/// Row selection used by the capture scan; results are always ordered by `key_field` ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub key_field: String,
    /// Exclusive lower bound on the key.
    pub key_after: i64,
    /// Inclusive upper bound on the key.
    pub key_through: Option<i64>,
    pub updated: Option<UpdateWindow>,
}

impl RowFilter {
    #[must_use]
    pub fn keys_after(key_field: &str, key_after: i64) -> Self {
        Self { key_field: key_field.to_string(), key_after, key_through: None, updated: None }
    }
}

/// Result of inserting a replayed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The target's primary-key constraint already holds this row.
    Duplicate,
}

/// The live database the engines read from and write to.
pub trait SqlConnection {
    /// # Errors
    /// Returns [`SyncError::Database`] when the server call fails.
    fn list_tables(&mut self) -> Result<Vec<String>, SyncError>;

    /// Column metadata in server order.
    ///
    /// # Errors
    /// Returns [`SyncError::Database`] when the table does not exist or the call fails.
    fn describe(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, SyncError>;

    /// The server clock, used as the capture instant.
    ///
    /// # Errors
    /// Returns [`SyncError::Database`] when the server call fails.
    fn current_time(&mut self) -> Result<PrimitiveDateTime, SyncError>;

    /// # Errors
    /// Returns [`SyncError::Database`] when the server call fails.
    fn count_rows(&mut self, table: &str, filter: &RowFilter) -> Result<u64, SyncError>;

    /// At most `limit` rows matching `filter`, ascending by key.
    ///
    /// # Errors
    /// Returns [`SyncError::Database`] when the server call fails.
    fn fetch_rows(
        &mut self,
        table: &str,
        filter: &RowFilter,
        limit: usize,
    ) -> Result<Vec<Row>, SyncError>;

    /// # Errors
    /// Returns [`SyncError::Database`] when the statement is rejected.
    fn execute_ddl(&mut self, statement: &str) -> Result<(), SyncError>;

    /// # Errors
    /// Returns [`SyncError::Database`] for every failure except a primary-key conflict, which
    /// is reported as [`InsertOutcome::Duplicate`].
    fn insert_row(&mut self, table: &str, row: &Row) -> Result<InsertOutcome, SyncError>;

    /// Set `values` on the row whose `key_field` equals `key`; returns the affected row count.
    ///
    /// # Errors
    /// Returns [`SyncError::Database`] when the statement is rejected.
    fn update_row(
        &mut self,
        table: &str,
        key_field: &str,
        key: i64,
        values: &Row,
    ) -> Result<u64, SyncError>;
}

impl<T: SqlConnection + ?Sized> SqlConnection for &mut T {
    fn list_tables(&mut self) -> Result<Vec<String>, SyncError> {
        (**self).list_tables()
    }

    fn describe(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, SyncError> {
        (**self).describe(table)
    }

    fn current_time(&mut self) -> Result<PrimitiveDateTime, SyncError> {
        (**self).current_time()
    }

    fn count_rows(&mut self, table: &str, filter: &RowFilter) -> Result<u64, SyncError> {
        (**self).count_rows(table, filter)
    }

    fn fetch_rows(
        &mut self,
        table: &str,
        filter: &RowFilter,
        limit: usize,
    ) -> Result<Vec<Row>, SyncError> {
        (**self).fetch_rows(table, filter, limit)
    }

    fn execute_ddl(&mut self, statement: &str) -> Result<(), SyncError> {
        (**self).execute_ddl(statement)
    }

    fn insert_row(&mut self, table: &str, row: &Row) -> Result<InsertOutcome, SyncError> {
        (**self).insert_row(table, row)
    }

    fn update_row(
        &mut self,
        table: &str,
        key_field: &str,
        key: i64,
        values: &Row,
    ) -> Result<u64, SyncError> {
        (**self).update_row(table, key_field, key, values)
    }
}

/// Integer key held by `field`; numeric strings are accepted.
#[must_use]
pub fn row_key(row: &Row, field: &str) -> Option<i64> {
    match row.get(field)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Text form of `field`, empty for `NULL` or a missing column.
#[must_use]
pub fn row_text(row: &Row, field: &str) -> String {
    match row.get(field) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
