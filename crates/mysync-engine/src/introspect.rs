use mysync_core::{
    derive_roles, ColumnDescriptor, RoleOverride, SqlConnection, SyncError, TableRoleFields,
};

const INTEGER_TYPES: &[&str] = &["tinyint", "smallint", "mediumint", "int", "integer", "bigint"];

/// Reads live column metadata and decides which columns drive the capture cursors.
#[derive(Debug, Clone, Default)]
pub struct SchemaIntrospector {
    overrides: Vec<RoleOverride>,
}

impl SchemaIntrospector {
    #[must_use]
    pub fn new(overrides: Vec<RoleOverride>) -> Self {
        Self { overrides }
    }

    /// # Errors
    /// Propagates the connection error, e.g. for a table that does not exist.
    pub fn describe<C: SqlConnection + ?Sized>(
        &self,
        conn: &mut C,
        table: &str,
    ) -> Result<Vec<ColumnDescriptor>, SyncError> {
        conn.describe(table)
    }

    /// Heuristic roles with any configured override applied on top.
    #[must_use]
    pub fn roles_for(&self, table: &str, columns: &[ColumnDescriptor]) -> TableRoleFields {
        derive_roles(columns).with_overrides(table, &self.overrides)
    }

    /// Why a table cannot be cursored, if it cannot.
    #[must_use]
    pub fn uncursorable_reason(
        columns: &[ColumnDescriptor],
        roles: &TableRoleFields,
    ) -> Option<String> {
        let Some(key_field) = roles.primary_key_field.as_deref() else {
            return Some("table has no primary key".to_string());
        };
        let Some(key_column) = columns.iter().find(|column| column.field == key_field) else {
            return Some(format!("key column {key_field} does not exist"));
        };
        if INTEGER_TYPES.contains(&key_column.base_type().as_str()) {
            None
        } else {
            Some(format!("key column {key_field} is {}, not an integer", key_column.column_type))
        }
    }
}
