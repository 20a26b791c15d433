use std::fmt::{Display, Formatter};

use time::format_description::FormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;

use crate::SyncError;

pub const BACKUP_PREFIX: &str = "backup";
pub const SCHEME_PREFIX: &str = "scheme";
pub const CONSUMED_SUFFIX: &str = ".ok";
pub const PARTIAL_SUFFIX: &str = ".partial";

const FILE_EXTENSION: &str = "json";
const STAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");

/// Run timestamp embedded in file names; sorts chronologically as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunStamp(pub PrimitiveDateTime);

impl RunStamp {
    /// # Errors
    /// Returns [`SyncError::MalformedFileName`] when `value` is not `YYYY-MM-DD_HH-MM-SS`.
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        PrimitiveDateTime::parse(value, STAMP_FORMAT)
            .map(Self)
            .map_err(|err| SyncError::MalformedFileName(format!("invalid run stamp {value:?}: {err}")))
    }
}

impl Display for RunStamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = self.0.format(STAMP_FORMAT).map_err(|_| std::fmt::Error)?;
        f.write_str(&text)
    }
}

/// `backup.<table>.<stamp>.json`, paired with `scheme.<table>.<stamp>.json`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupFileName {
    pub stamp: RunStamp,
    pub table: String,
}

impl BackupFileName {
    /// # Errors
    /// Returns [`SyncError::Validation`] when the table name would break the naming scheme.
    pub fn new(table: &str, stamp: RunStamp) -> Result<Self, SyncError> {
        if table.is_empty() || table.contains(['.', '/', '\\']) {
            return Err(SyncError::Validation(format!(
                "table name {table:?} cannot be used in a backup file name"
            )));
        }
        Ok(Self { stamp, table: table.to_string() })
    }

    /// # Errors
    /// Returns [`SyncError::MalformedFileName`] unless the name has exactly four dot-separated
    /// parts with the backup prefix, a table, a valid stamp and the `json` extension.
    pub fn parse(file_name: &str) -> Result<Self, SyncError> {
        let parts: Vec<&str> = file_name.split('.').collect();
        match parts.as_slice() {
            [BACKUP_PREFIX, table, stamp, FILE_EXTENSION] if !table.is_empty() => {
                let stamp = RunStamp::parse(stamp)?;
                Ok(Self { stamp, table: (*table).to_string() })
            }
            _ => Err(SyncError::MalformedFileName(file_name.to_string())),
        }
    }

    #[must_use]
    pub fn backup_file_name(&self) -> String {
        format!("{BACKUP_PREFIX}.{}.{}.{FILE_EXTENSION}", self.table, self.stamp)
    }

    #[must_use]
    pub fn schema_file_name(&self) -> String {
        format!("{SCHEME_PREFIX}.{}.{}.{FILE_EXTENSION}", self.table, self.stamp)
    }
}

/// Whether a directory entry matches the discovery glob `backup.*.json`.
#[must_use]
pub fn is_backup_candidate(file_name: &str) -> bool {
    file_name.len() > BACKUP_PREFIX.len() + FILE_EXTENSION.len() + 1
        && file_name.starts_with(&format!("{BACKUP_PREFIX}."))
        && file_name.ends_with(&format!(".{FILE_EXTENSION}"))
}
