//! Versioned mapping from change events to sink rows.
//!
//! - sink table: `<schema>_<table>`
//! - partition key: the source primary key columns, in order
//! - metadata cells on every row: `_source_position`, `_idempotency_key`,
//!   `_deleted`, `_source_ts`, `_schema_version`
//! - v1: scalars map 1:1, JSON and arrays are stored as canonical JSON text
//! - v2: like v1, but JSON objects are flattened one level into
//!   `column.field` cells

use super::{CellValue, RowKey, RowMutation};
use crate::config::SUPPORTED_SCHEMA_VERSIONS;
use crate::event::{ChangeEvent, ColumnValue, Operation, SourceKey};
use crate::{Result, SinkError};
use std::collections::BTreeMap;

pub const COL_SOURCE_POSITION: &str = "_source_position";
pub const COL_IDEMPOTENCY_KEY: &str = "_idempotency_key";
pub const COL_DELETED: &str = "_deleted";
pub const COL_SOURCE_TS: &str = "_source_ts";
pub const COL_SCHEMA_VERSION: &str = "_schema_version";

const METADATA_COLUMNS: [&str; 5] = [
    COL_SOURCE_POSITION,
    COL_IDEMPOTENCY_KEY,
    COL_DELETED,
    COL_SOURCE_TS,
    COL_SCHEMA_VERSION,
];

fn rejected(msg: String) -> crate::Error {
    SinkError::Rejected(msg).into()
}

/// Sink table for a source key.
pub fn sink_table_name(key: &SourceKey) -> String {
    format!("{}_{}", key.schema_name(), key.table_name())
}

/// Build the conditional write for `event`.
///
/// Fails with `SinkError::Rejected` for unsupported schema versions, empty or
/// non-scalar keys, payloads missing a key column, and columns that collide
/// with metadata cells.
pub fn map_event(event: &ChangeEvent) -> Result<RowMutation> {
    let version = event.schema_version();
    if !SUPPORTED_SCHEMA_VERSIONS.contains(&version) {
        return Err(rejected(format!("unsupported schema version {}", version)));
    }

    let source_key = event.source_key();
    if source_key.columns.is_empty() {
        return Err(rejected(format!("empty key for {}", source_key.table)));
    }

    let mut key = Vec::with_capacity(source_key.columns.len());
    for column in &source_key.columns {
        if matches!(column.value, ColumnValue::Null) || column.value.is_nested() {
            return Err(rejected(format!(
                "key column {} of {} must be a non-null scalar",
                column.name, source_key.table
            )));
        }
        if event.operation() != Operation::Delete && !event.payload().contains_key(&column.name) {
            return Err(rejected(format!(
                "payload for {} is missing key column {}",
                source_key, column.name
            )));
        }
        key.push((column.name.clone(), scalar_cell(&column.value)));
    }

    let deleted = event.operation() == Operation::Delete;
    let mut cells = BTreeMap::new();
    if !deleted {
        for (name, value) in event.payload() {
            if source_key.columns.iter().any(|c| &c.name == name) {
                continue;
            }
            if METADATA_COLUMNS.contains(&name.as_str()) {
                return Err(rejected(format!("column {} collides with a metadata cell", name)));
            }
            map_column(version, name, value, &mut cells);
        }
    }

    Ok(RowMutation {
        table: sink_table_name(source_key),
        key: RowKey(key),
        cells,
        position: event.source_position(),
        idempotency_key: event.idempotency_key(),
        deleted,
        source_ts: event.source_timestamp(),
        schema_version: version,
    })
}

fn map_column(version: u32, name: &str, value: &ColumnValue, cells: &mut BTreeMap<String, CellValue>) {
    match (version, value) {
        (2, ColumnValue::Json(serde_json::Value::Object(fields))) => {
            for (field, inner) in fields {
                cells.insert(format!("{}.{}", name, field), json_cell(inner));
            }
        }
        _ => {
            cells.insert(name.to_string(), scalar_cell(value));
        }
    }
}

/// Cell for a column value; nested values become canonical JSON text.
fn scalar_cell(value: &ColumnValue) -> CellValue {
    match value {
        ColumnValue::Null => CellValue::Null,
        ColumnValue::Bool(b) => CellValue::Boolean(*b),
        ColumnValue::Int(i) => CellValue::BigInt(*i),
        ColumnValue::Float(f) => CellValue::Double(*f),
        ColumnValue::Text(s) => CellValue::Text(s.clone()),
        ColumnValue::Bytes(b) => CellValue::Blob(b.clone()),
        ColumnValue::Timestamp(ts) => CellValue::Timestamp(*ts),
        ColumnValue::Json(_) | ColumnValue::Array(_) => CellValue::Text(value.to_json().to_string()),
    }
}

/// Cell for one field of a flattened JSON object.
fn json_cell(value: &serde_json::Value) -> CellValue {
    use serde_json::Value;
    match value {
        Value::Null => CellValue::Null,
        Value::Bool(b) => CellValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => CellValue::BigInt(i),
            None => CellValue::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => CellValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => CellValue::Text(value.to_string()),
    }
}
