use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::SyncError;

const PRIMARY_KEY_MARKER: &str = "PRI";

/// Key marker reported by column introspection; anything but `PRI` keeps its raw text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum KeyRole {
    Primary,
    Other(String),
}

impl From<String> for KeyRole {
    fn from(value: String) -> Self {
        if value == PRIMARY_KEY_MARKER {
            Self::Primary
        } else {
            Self::Other(value)
        }
    }
}

impl From<KeyRole> for String {
    fn from(value: KeyRole) -> Self {
        match value {
            KeyRole::Primary => PRIMARY_KEY_MARKER.to_string(),
            KeyRole::Other(raw) => raw,
        }
    }
}

/// One row of `DESCRIBE <table>`, serialized with the same keys the server reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub field: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(rename = "null", with = "yes_no")]
    pub nullable: bool,
    #[serde(rename = "key")]
    pub key_role: KeyRole,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub extra: String,
}

impl ColumnDescriptor {
    /// Lower-cased type name without length, precision or modifiers: `int(11) unsigned` is `int`.
    #[must_use]
    pub fn base_type(&self) -> String {
        let head = self.column_type.split('(').next().unwrap_or_default();
        head.split_whitespace().next().unwrap_or_default().to_ascii_lowercase()
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.key_role == KeyRole::Primary
    }

    #[must_use]
    pub fn is_timestamp(&self) -> bool {
        matches!(self.base_type().as_str(), "timestamp" | "datetime")
    }

    /// True when the server refreshes the column on every write.
    #[must_use]
    pub fn refreshes_on_update(&self) -> bool {
        let extra = self.extra.to_ascii_lowercase();
        extra.contains("on update") && is_current_time_sentinel(extra.rsplit("on update").next().unwrap_or_default())
    }

    #[must_use]
    pub fn defaults_to_current_time(&self) -> bool {
        is_current_time_sentinel(&self.default)
    }
}

fn is_current_time_sentinel(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    let name = normalized.split('(').next().unwrap_or_default();
    matches!(name, "current_timestamp" | "now" | "localtimestamp" | "localtime")
}

/// Identity and timestamp columns of one table; any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRoleFields {
    pub primary_key_field: Option<String>,
    pub create_time_field: Option<String>,
    pub update_time_field: Option<String>,
}

impl TableRoleFields {
    /// Replace heuristic results with the overrides configured for `table`.
    #[must_use]
    pub fn with_overrides(mut self, table: &str, overrides: &[RoleOverride]) -> Self {
        for item in overrides.iter().filter(|item| item.table == table) {
            let slot = match item.role {
                Role::Key => &mut self.primary_key_field,
                Role::Create => &mut self.create_time_field,
                Role::Update => &mut self.update_time_field,
            };
            *slot = item.column.clone();
        }
        self
    }
}

/// Classify the key, create-time and update-time columns of a table.
///
/// The first qualifying column wins each role. A column that refreshes on update is never
/// also taken as the create-time column.
#[must_use]
pub fn derive_roles(columns: &[ColumnDescriptor]) -> TableRoleFields {
    let mut roles = TableRoleFields::default();

    for column in columns {
        if column.is_primary() && roles.primary_key_field.is_none() {
            roles.primary_key_field = Some(column.field.clone());
        }

        if !column.is_timestamp() {
            continue;
        }

        if column.refreshes_on_update() {
            if roles.update_time_field.is_none() {
                roles.update_time_field = Some(column.field.clone());
            }
        } else if column.defaults_to_current_time() && roles.create_time_field.is_none() {
            roles.create_time_field = Some(column.field.clone());
        }
    }

    roles
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Key,
    Create,
    Update,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key => write!(f, "key"),
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// Explicit role assignment for tables the heuristic misreads, written `table:role=column`.
///
/// An empty column (`orders:update=`) clears the role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleOverride {
    pub table: String,
    pub role: Role,
    pub column: Option<String>,
}

impl RoleOverride {
    /// # Errors
    /// Returns [`SyncError::Validation`] when the text is not `table:role=column`.
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        let invalid = || {
            SyncError::Validation(format!(
                "role override must look like table:key|create|update=column, got {value:?}"
            ))
        };

        let (table, assignment) = value.split_once(':').ok_or_else(invalid)?;
        let (role, column) = assignment.split_once('=').ok_or_else(invalid)?;
        let role = match role.trim() {
            "key" => Role::Key,
            "create" => Role::Create,
            "update" => Role::Update,
            _ => return Err(invalid()),
        };
        let table = table.trim();
        if table.is_empty() {
            return Err(invalid());
        }
        let column = column.trim();

        Ok(Self {
            table: table.to_string(),
            role,
            column: (!column.is_empty()).then(|| column.to_string()),
        })
    }
}

mod yes_no {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "YES" } else { "NO" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "YES" => Ok(true),
            "NO" => Ok(false),
            other => Err(serde::de::Error::custom(format!("expected YES or NO, got {other:?}"))),
        }
    }
}
