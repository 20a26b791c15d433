use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::macros::datetime;
use time::PrimitiveDateTime;

use crate::schema::TableRoleFields;
use crate::SyncError;

/// Name of the control table; it never takes part in a backup.
pub const CONTROL_TABLE: &str = "mysync";

pub const INITIAL_CURSOR: i64 = -1;

pub const INITIAL_WATERMARK: PrimitiveDateTime = datetime!(1970-01-01 0:00);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Backup,
    Restore,
}

impl RunType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backup" => Some(Self::Backup),
            "restore" => Some(Self::Restore),
            _ => None,
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Backup => Self::Restore,
            Self::Restore => Self::Backup,
        }
    }
}

impl Display for RunType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one table: everything up to `cursor_id` and `watermark` has been exported
/// (backup) or replayed (restore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_type: RunType,
    pub table_name: String,
    #[serde(flatten)]
    pub fields: TableRoleFields,
    pub cursor_id: i64,
    #[serde(with = "crate::datetime_text")]
    pub watermark: PrimitiveDateTime,
    pub delta_count: u64,
}

impl CheckpointRecord {
    #[must_use]
    pub fn new(run_type: RunType, table_name: &str, fields: TableRoleFields) -> Self {
        Self {
            run_type,
            table_name: table_name.to_string(),
            fields,
            cursor_id: INITIAL_CURSOR,
            watermark: INITIAL_WATERMARK,
            delta_count: 0,
        }
    }
}

/// Per-table progress records, one per table name.
///
/// Implementations must keep `cursor_id` and `watermark` monotone: `advance` never moves
/// either backwards.
pub trait CheckpointStore {
    /// # Errors
    /// Returns an error when the store cannot be read.
    fn find_by_table(&mut self, table: &str) -> Result<Option<CheckpointRecord>, SyncError>;

    /// Create the record with the initial cursor, or refresh only its role fields.
    ///
    /// # Errors
    /// Returns an error when the store cannot be written.
    fn upsert(
        &mut self,
        run_type: RunType,
        table: &str,
        fields: &TableRoleFields,
    ) -> Result<CheckpointRecord, SyncError>;

    /// # Errors
    /// Returns [`SyncError::MissingCheckpoint`] when the table has no record, or a store error.
    fn advance(
        &mut self,
        table: &str,
        cursor_id: i64,
        watermark: PrimitiveDateTime,
        delta_count: u64,
    ) -> Result<(), SyncError>;

    /// # Errors
    /// Returns an error when the store cannot be read.
    fn has_any_of_type(&mut self, run_type: RunType) -> Result<bool, SyncError>;

    /// All records ordered by table name.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    fn list(&mut self) -> Result<Vec<CheckpointRecord>, SyncError>;
}

impl<T: CheckpointStore + ?Sized> CheckpointStore for &mut T {
    fn find_by_table(&mut self, table: &str) -> Result<Option<CheckpointRecord>, SyncError> {
        (**self).find_by_table(table)
    }

    fn upsert(
        &mut self,
        run_type: RunType,
        table: &str,
        fields: &TableRoleFields,
    ) -> Result<CheckpointRecord, SyncError> {
        (**self).upsert(run_type, table, fields)
    }

    fn advance(
        &mut self,
        table: &str,
        cursor_id: i64,
        watermark: PrimitiveDateTime,
        delta_count: u64,
    ) -> Result<(), SyncError> {
        (**self).advance(table, cursor_id, watermark, delta_count)
    }

    fn has_any_of_type(&mut self, run_type: RunType) -> Result<bool, SyncError> {
        (**self).has_any_of_type(run_type)
    }

    fn list(&mut self) -> Result<Vec<CheckpointRecord>, SyncError> {
        (**self).list()
    }
}

/// Refuse `requested` when the store already marks this database with the other role.
///
/// # Errors
/// Returns [`SyncError::RoleViolation`] on a role clash, or the store's read error.
pub fn ensure_role<S: CheckpointStore + ?Sized>(
    store: &mut S,
    requested: RunType,
) -> Result<(), SyncError> {
    let found = requested.opposite();
    if store.has_any_of_type(found)? {
        return Err(SyncError::RoleViolation { requested, found });
    }
    Ok(())
}
