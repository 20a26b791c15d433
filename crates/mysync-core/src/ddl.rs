use std::collections::BTreeMap;

use crate::schema::ColumnDescriptor;

const TABLE_OPTIONS: &str = "ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

/// How a column's stored default must be rendered in DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    TextLike,
    TimeLike,
    Other,
}

#[must_use]
pub fn classify_type(base_type: &str) -> TypeClass {
    match base_type {
        "char" | "varchar" | "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob"
        | "longblob" | "tinytext" | "text" | "mediumtext" | "longtext" | "enum" | "set" => {
            TypeClass::TextLike
        }
        "date" | "time" | "datetime" | "timestamp" | "year" => TypeClass::TimeLike,
        _ => TypeClass::Other,
    }
}

#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `DEFAULT ...` clause for a column, or `None` when it has no stored default.
///
/// Text-like defaults are always quoted. Time-like defaults are quoted only when they hold a
/// digit, so literal dates are quoted while `CURRENT_TIMESTAMP` stays a keyword.
#[must_use]
pub fn render_default(column: &ColumnDescriptor) -> Option<String> {
    if column.default.is_empty() {
        return None;
    }

    let value = &column.default;
    let rendered = match classify_type(&column.base_type()) {
        TypeClass::TextLike => quote_literal(value),
        TypeClass::TimeLike if value.chars().any(|ch| ch.is_ascii_digit()) => quote_literal(value),
        TypeClass::TimeLike | TypeClass::Other => value.clone(),
    };

    Some(format!("DEFAULT {rendered}"))
}

fn render_extra(extra: &str) -> String {
    extra
        .split_whitespace()
        .filter(|token| !token.eq_ignore_ascii_case("DEFAULT_GENERATED"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `name type nullability extra default` for one column.
#[must_use]
pub fn column_definition(column: &ColumnDescriptor) -> String {
    let mut parts = vec![
        quote_ident(&column.field),
        column.column_type.clone(),
        if column.nullable { "NULL".to_string() } else { "NOT NULL".to_string() },
    ];

    let extra = render_extra(&column.extra);
    if !extra.is_empty() {
        parts.push(extra);
    }
    if let Some(default) = render_default(column) {
        parts.push(default);
    }

    parts.join(" ")
}

/// Build the `CREATE TABLE` statement for a schema snapshot. Only the primary key is
/// declared; secondary indexes are never recreated.
#[must_use]
pub fn synthesize_create(table: &str, columns: &[ColumnDescriptor]) -> String {
    let mut definitions: Vec<String> = columns.iter().map(column_definition).collect();

    let key_columns: Vec<String> = columns
        .iter()
        .filter(|column| column.is_primary())
        .map(|column| quote_ident(&column.field))
        .collect();
    if !key_columns.is_empty() {
        definitions.push(format!("PRIMARY KEY ({})", key_columns.join(", ")));
    }

    format!("CREATE TABLE {} ({}) {TABLE_OPTIONS}", quote_ident(table), definitions.join(", "))
}

/// Additive statements that bring `old_columns` (live) up to `new_columns` (snapshot).
///
/// Columns missing from `new_columns` are left in place.
#[must_use]
pub fn synthesize_alter(
    table: &str,
    old_columns: &[ColumnDescriptor],
    new_columns: &[ColumnDescriptor],
) -> Vec<String> {
    let existing: BTreeMap<&str, &ColumnDescriptor> =
        old_columns.iter().map(|column| (column.field.as_str(), column)).collect();
    let table = quote_ident(table);

    new_columns
        .iter()
        .filter_map(|column| match existing.get(column.field.as_str()) {
            None => Some(format!("ALTER TABLE {table} ADD {}", column_definition(column))),
            Some(old)
                if old.column_type != column.column_type
                    || old.nullable != column.nullable
                    || old.default != column.default =>
            {
                Some(format!(
                    "ALTER TABLE {table} CHANGE {} {}",
                    quote_ident(&old.field),
                    column_definition(column)
                ))
            }
            Some(_) => None,
        })
        .collect()
}
