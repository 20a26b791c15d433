use mysql_async::consts::ColumnType;
use mysql_async::Value;
use mysync_core::{format_datetime, quote_ident, Row, RowFilter, SyncError};

/// MySQL server error for a duplicate key on insert.
pub(crate) const ER_DUP_ENTRY: u16 = 1062;

/// Key of the single-field object that carries bytes which are not valid UTF-8.
const HEX_TAG: &str = "hex";

/// `WHERE` clause and positional parameters for a capture filter.
pub(crate) fn where_clause(filter: &RowFilter) -> (String, Vec<Value>) {
    let key = quote_ident(&filter.key_field);
    let mut conditions = vec![format!("{key} > ?")];
    let mut params = vec![Value::Int(filter.key_after)];

    if let Some(through) = filter.key_through {
        conditions.push(format!("{key} <= ?"));
        params.push(Value::Int(through));
    }
    if let Some(window) = &filter.updated {
        let field = quote_ident(&window.field);
        conditions.push(format!("{field} > ?"));
        conditions.push(format!("{field} <= ?"));
        params.push(Value::from(format_datetime(window.after)));
        params.push(Value::from(format_datetime(window.until)));
    }

    (format!("WHERE {}", conditions.join(" AND ")), params)
}

pub(crate) fn count_statement(table: &str, filter: &RowFilter) -> (String, Vec<Value>) {
    let (clause, params) = where_clause(filter);
    (format!("SELECT COUNT(*) FROM {} {clause}", quote_ident(table)), params)
}

pub(crate) fn select_statement(table: &str, filter: &RowFilter, limit: usize) -> (String, Vec<Value>) {
    let (clause, params) = where_clause(filter);
    (
        format!(
            "SELECT * FROM {} {clause} ORDER BY {} ASC LIMIT {limit}",
            quote_ident(table),
            quote_ident(&filter.key_field)
        ),
        params,
    )
}

fn bind_values(table: &str, row: &Row) -> Result<Vec<Value>, SyncError> {
    row.iter()
        .map(|(field, value)| {
            json_to_value(value).map_err(|reason| {
                SyncError::Validation(format!("column {field} of {table}: {reason}"))
            })
        })
        .collect()
}

pub(crate) fn insert_statement(table: &str, row: &Row) -> Result<(String, Vec<Value>), SyncError> {
    let columns: Vec<String> = row.keys().map(|field| quote_ident(field)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok((
        format!("INSERT INTO {} ({}) VALUES ({placeholders})", quote_ident(table), columns.join(", ")),
        bind_values(table, row)?,
    ))
}

pub(crate) fn update_statement(
    table: &str,
    key_field: &str,
    key: i64,
    values: &Row,
) -> Result<(String, Vec<Value>), SyncError> {
    let assignments: Vec<String> =
        values.keys().map(|field| format!("{} = ?", quote_ident(field))).collect();
    let mut params = bind_values(table, values)?;
    params.push(Value::Int(key));
    Ok((
        format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(table),
            assignments.join(", "),
            quote_ident(key_field)
        ),
        params,
    ))
}

/// Bind value for one change-log cell. `{"hex": "..."}` decodes back to the raw bytes.
pub(crate) fn json_to_value(value: &serde_json::Value) -> Result<Value, String> {
    if let Some(bytes) = tagged_hex(value) {
        return hex::decode(bytes)
            .map(Value::Bytes)
            .map_err(|err| format!("invalid hex value: {err}"));
    }
    Ok(match value {
        serde_json::Value::Null => Value::NULL,
        serde_json::Value::Bool(flag) => Value::Int(i64::from(*flag)),
        serde_json::Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Value::Int(int)
            } else if let Some(uint) = number.as_u64() {
                Value::UInt(uint)
            } else {
                Value::Double(number.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(text) => Value::Bytes(text.as_bytes().to_vec()),
        other => Value::Bytes(other.to_string().into_bytes()),
    })
}

fn tagged_hex(value: &serde_json::Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get(HEX_TAG)?.as_str()
}

/// Text form of a column value, as the change log stores it; `NULL` stays `null`.
///
/// Bytes that are not valid UTF-8 (binary, blob and bit columns) are stored as
/// `{"hex": "..."}` so replay writes back exactly what was read.
pub(crate) fn value_to_json(value: &Value, column_type: ColumnType) -> serde_json::Value {
    let text = match value {
        Value::NULL => return serde_json::Value::Null,
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => {
                let mut tagged = serde_json::Map::new();
                tagged.insert(HEX_TAG.to_string(), serde_json::Value::String(hex::encode(bytes)));
                return serde_json::Value::Object(tagged);
            }
        },
        Value::Int(int) => int.to_string(),
        Value::UInt(uint) => uint.to_string(),
        Value::Float(float) => float.to_string(),
        Value::Double(double) => double.to_string(),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let date = format!("{year:04}-{month:02}-{day:02}");
            if column_type == ColumnType::MYSQL_TYPE_DATE {
                date
            } else {
                with_micros(format!("{date} {hour:02}:{minute:02}:{second:02}"), *micros)
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = u64::from(*days) * 24 + u64::from(*hours);
            let sign = if *negative { "-" } else { "" };
            with_micros(format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}"), *micros)
        }
    };
    serde_json::Value::String(text)
}

fn with_micros(text: String, micros: u32) -> String {
    if micros == 0 {
        text
    } else {
        format!("{text}.{micros:06}")
    }
}
