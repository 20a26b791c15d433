use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::connection::Row;
use crate::SyncError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
}

impl ChangeOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

impl Display for ChangeOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured row operation: `op\tkey\ttimestamp\tjson` on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLogEntry {
    pub op: ChangeOp,
    pub key: i64,
    pub timestamp: String,
    pub payload: Row,
}

impl ChangeLogEntry {
    /// Encode the entry as one newline-terminated line.
    ///
    /// # Errors
    /// Returns the JSON error when the payload cannot be serialized.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let payload = serde_json::to_string(&self.payload)?;
        let timestamp = self.timestamp.replace(['\t', '\n', '\r'], " ");
        Ok(format!("{}\t{}\t{}\t{}\n", self.op, self.key, timestamp, payload))
    }

    /// Decode one line (without its terminator). `line_number` is 1-based and only used in
    /// errors.
    ///
    /// # Errors
    /// Returns [`SyncError::MalformedEntry`] when the line does not have four fields, names an
    /// unknown operation, carries a non-integer key, or holds a payload that is not a JSON object.
    pub fn parse_line(line: &str, line_number: usize) -> Result<Self, SyncError> {
        let malformed = |reason: String| SyncError::MalformedEntry { line: line_number, reason };

        let mut fields = line.splitn(4, '\t');
        let (Some(op), Some(key), Some(timestamp), Some(payload)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed("expected four tab-separated fields".to_string()));
        };

        let op = ChangeOp::parse(op).ok_or_else(|| malformed(format!("unknown operation {op:?}")))?;
        let key = key
            .trim()
            .parse::<i64>()
            .map_err(|err| malformed(format!("invalid key {key:?}: {err}")))?;
        let payload: Row = serde_json::from_str(payload)
            .map_err(|err| malformed(format!("invalid JSON payload: {err}")))?;

        Ok(Self { op, key, timestamp: timestamp.to_string(), payload })
    }
}
