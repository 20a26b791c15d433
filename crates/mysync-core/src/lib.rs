use std::fmt::Display;
use std::path::PathBuf;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;

mod changelog;
mod checkpoint;
mod connection;
mod ddl;
mod filter;
mod naming;
mod schema;

pub use changelog::{ChangeLogEntry, ChangeOp};
pub use checkpoint::{
    ensure_role, CheckpointRecord, CheckpointStore, RunType, CONTROL_TABLE, INITIAL_CURSOR,
    INITIAL_WATERMARK,
};
pub use connection::{
    row_key, row_text, InsertOutcome, Row, RowFilter, SqlConnection, UpdateWindow,
};
pub use ddl::{
    classify_type, column_definition, quote_ident, render_default, synthesize_alter,
    synthesize_create, TypeClass,
};
pub use filter::TableFilter;
pub use naming::{
    is_backup_candidate, BackupFileName, RunStamp, BACKUP_PREFIX, CONSUMED_SUFFIX,
    PARTIAL_SUFFIX, SCHEME_PREFIX,
};
pub use schema::{derive_roles, ColumnDescriptor, KeyRole, Role, RoleOverride, TableRoleFields};

/// Textual layout of every timestamp the control store and change logs carry.
pub const DATETIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Whether an error aborts the run or only the entry that produced it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Severity {
    Fatal,
    Skippable,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(String),
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode a row of table {table}: {source}")]
    Encode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid schema snapshot {}: {reason}", path.display())]
    Snapshot { path: PathBuf, reason: String },
    #[error("backup file name does not follow backup.<table>.<stamp>.json: {0}")]
    MalformedFileName(String),
    #[error("{requested} refused: this database already holds {found} checkpoint records")]
    RoleViolation { requested: RunType, found: RunType },
    #[error("no checkpoint record for table {0}")]
    MissingCheckpoint(String),
    #[error("malformed change-log entry at line {line}: {reason}")]
    MalformedEntry { line: usize, reason: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("run cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn database(err: impl Display) -> Self {
        Self::Database(err.to_string())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::MalformedEntry { .. } => Severity::Skippable,
            _ => Severity::Fatal,
        }
    }
}

#[must_use]
pub fn format_datetime(value: PrimitiveDateTime) -> String {
    // The layout only contains numeric components, formatting cannot fail.
    value.format(DATETIME_FORMAT).unwrap_or_default()
}

/// Parse a `YYYY-MM-DD HH:MM:SS` timestamp, ignoring fractional seconds.
///
/// # Errors
/// Returns [`SyncError::Validation`] when the text is not a timestamp in that layout.
pub fn parse_datetime(value: &str) -> Result<PrimitiveDateTime, SyncError> {
    let trimmed = value.trim();
    let whole = trimmed.split('.').next().unwrap_or(trimmed);
    PrimitiveDateTime::parse(whole, DATETIME_FORMAT)
        .map_err(|err| SyncError::Validation(format!("invalid timestamp {value:?}: {err}")))
}

/// Serde adapter writing [`PrimitiveDateTime`] in [`DATETIME_FORMAT`].
pub mod datetime_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::PrimitiveDateTime;

    /// # Errors
    /// Propagates serializer failures.
    pub fn serialize<S: Serializer>(
        value: &PrimitiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_datetime(*value))
    }

    /// # Errors
    /// Fails when the input is not a timestamp in [`super::DATETIME_FORMAT`].
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<PrimitiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_datetime(&raw).map_err(serde::de::Error::custom)
    }
}
