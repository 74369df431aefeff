//! Change event types and their wire form.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Position in the source change stream (a PostgreSQL LSN).
///
/// Strictly increasing per change within one source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePosition(pub u64);

impl SourcePosition {
    /// The position before any change.
    pub const ZERO: SourcePosition = SourcePosition(0);

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for SourcePosition {
    type Err = Error;

    /// Parse the textual `pg_lsn` form, e.g. `16/B374D848`.
    fn from_str(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::Serialization(format!("invalid LSN: {}", s)))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|e| Error::Serialization(format!("invalid LSN {}: {}", s, e)))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|e| Error::Serialization(format!("invalid LSN {}: {}", s, e)))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(Error::Serialization(format!("LSN out of range: {}", s)));
        }
        Ok(SourcePosition((hi << 32) | lo))
    }
}

/// Row-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => f.write_str("INSERT"),
            Operation::Update => f.write_str("UPDATE"),
            Operation::Delete => f.write_str("DELETE"),
        }
    }
}

/// Typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Array(Vec<ColumnValue>),
}

impl ColumnValue {
    /// Whether the value is a nested structure (object or array).
    pub fn is_nested(&self) -> bool {
        matches!(self, ColumnValue::Json(_) | ColumnValue::Array(_))
    }

    /// Canonical JSON rendering, used for nested values stored as text.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Bool(b) => Value::Bool(*b),
            ColumnValue::Int(i) => Value::from(*i),
            ColumnValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnValue::Text(s) => Value::String(s.clone()),
            ColumnValue::Bytes(b) => Value::String(hex_encode(b)),
            ColumnValue::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            ColumnValue::Json(v) => v.clone(),
            ColumnValue::Array(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
        }
    }

    /// Text used when the value is part of a key.
    fn key_text(&self) -> String {
        match self {
            ColumnValue::Null => "null".to_string(),
            ColumnValue::Bool(b) => b.to_string(),
            ColumnValue::Int(i) => i.to_string(),
            ColumnValue::Float(f) => f.to_string(),
            ColumnValue::Text(s) => s.clone(),
            ColumnValue::Bytes(b) => hex_encode(b),
            ColumnValue::Timestamp(ts) => ts.to_rfc3339(),
            ColumnValue::Json(_) | ColumnValue::Array(_) => self.to_json().to_string(),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// One component of a (possibly composite) primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyColumn {
    /// Column name
    pub name: String,
    /// Column value
    pub value: ColumnValue,
}

/// Identity of the logical row a change applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceKey {
    /// Qualified table name (`schema.table`)
    pub table: String,
    /// Primary key components in key order
    pub columns: Vec<KeyColumn>,
}

/// Backslash-escape the separators of a canonical key.
pub(crate) fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        if matches!(c, '\\' | ',' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl SourceKey {
    /// Create a key for a table.
    pub fn new(table: impl Into<String>, columns: Vec<KeyColumn>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    /// Shorthand for a single-column key.
    pub fn single(table: impl Into<String>, column: impl Into<String>, value: ColumnValue) -> Self {
        Self::new(
            table,
            vec![KeyColumn {
                name: column.into(),
                value,
            }],
        )
    }

    /// Canonical text form: `schema.table/col=val[,col=val...]`, with `\`,
    /// `,` and `=` inside names and values backslash-escaped.
    ///
    /// Stable across processes; hashed for partitioning.
    pub fn canonical(&self) -> String {
        let parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}={}", escape_key_part(&c.name), escape_key_part(&c.value.key_text())))
            .collect();
        format!("{}/{}", self.table, parts.join(","))
    }

    /// Schema part of the table name (`public` when unqualified).
    pub fn schema_name(&self) -> &str {
        self.table
            .split_once('.')
            .map(|(schema, _)| schema)
            .unwrap_or("public")
    }

    /// Table part of the table name.
    pub fn table_name(&self) -> &str {
        self.table
            .split_once('.')
            .map(|(_, table)| table)
            .unwrap_or(&self.table)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Deterministic identifier of one change to one row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key from a source key and position.
    pub fn derive(key: &SourceKey, position: SourcePosition) -> Self {
        Self(format!("{}@{}", key.canonical(), position))
    }

    /// Key as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdempotencyKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a record in the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionOffset {
    /// Partition number
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl PartitionOffset {
    /// Create a new partition offset.
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for PartitionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// An immutable row-level change captured from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    source_key: SourceKey,
    operation: Operation,
    payload: BTreeMap<String, ColumnValue>,
    source_position: SourcePosition,
    source_timestamp: DateTime<Utc>,
    schema_version: u32,
}

impl ChangeEvent {
    /// Create a new change event.
    pub fn new(
        source_key: SourceKey,
        operation: Operation,
        payload: BTreeMap<String, ColumnValue>,
        source_position: SourcePosition,
        source_timestamp: DateTime<Utc>,
        schema_version: u32,
    ) -> Self {
        Self {
            source_key,
            operation,
            payload,
            source_position,
            source_timestamp,
            schema_version,
        }
    }

    /// Identity of the changed row.
    pub fn source_key(&self) -> &SourceKey {
        &self.source_key
    }

    /// Row operation.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Column values (full row image, or key-only for deletes).
    pub fn payload(&self) -> &BTreeMap<String, ColumnValue> {
        &self.payload
    }

    /// Source position of this change.
    pub fn source_position(&self) -> SourcePosition {
        self.source_position
    }

    /// Commit time at the source.
    pub fn source_timestamp(&self) -> DateTime<Utc> {
        self.source_timestamp
    }

    /// Schema version used to pick the sink column mapping.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Idempotency key of this change.
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::derive(&self.source_key, self.source_position)
    }

    /// Serialize to the wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from the wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
