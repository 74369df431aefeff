//! wal2json (format-version 2) decoding.
//!
//! Each logical decoding row is one JSON object with an `action`:
//! `B`/`C` delimit a transaction, `I`/`U`/`D` are row changes, `M` is a
//! logical message and `T` a truncate. Row changes become [`RowChange`]s;
//! the capture adapter assigns their positions.

use crate::event::{ChangeEvent, ColumnValue, KeyColumn, Operation, SourceKey, SourcePosition};
use crate::{CaptureError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A decoded row change awaiting its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub key: SourceKey,
    pub operation: Operation,
    pub payload: BTreeMap<String, ColumnValue>,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
}

impl RowChange {
    /// Build the immutable event at `position`.
    pub fn into_event(self, position: SourcePosition) -> ChangeEvent {
        ChangeEvent::new(
            self.key,
            self.operation,
            self.payload,
            position,
            self.timestamp,
            self.schema_version,
        )
    }
}

/// Outcome of decoding one wal2json record.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Transaction start
    Begin,
    /// Row change; `autocommit` when seen outside `B`/`C`
    Change { change: RowChange, autocommit: bool },
    /// Transaction commit
    Commit,
    /// Heartbeat logical message
    Heartbeat,
    /// Ignored record
    Skip,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonRecord {
    action: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    columns: Vec<Wal2JsonColumn>,
    #[serde(default)]
    identity: Vec<Wal2JsonColumn>,
    #[serde(default)]
    pk: Vec<Wal2JsonColumn>,
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonColumn {
    name: String,
    #[serde(rename = "type", default)]
    type_name: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

/// Stateful decoder: remembers the open transaction's commit time.
pub struct Wal2JsonDecoder {
    heartbeat_prefix: String,
    schema_versions: BTreeMap<String, u32>,
    in_transaction: bool,
    transaction_ts: Option<DateTime<Utc>>,
}

impl Wal2JsonDecoder {
    /// Create a decoder.
    pub fn new(heartbeat_prefix: impl Into<String>, schema_versions: BTreeMap<String, u32>) -> Self {
        Self {
            heartbeat_prefix: heartbeat_prefix.into(),
            schema_versions,
            in_transaction: false,
            transaction_ts: None,
        }
    }

    /// Decode one record. A primary-key change yields two entries: a delete
    /// of the old key followed by the update of the new one.
    pub fn decode(&mut self, data: &str) -> Result<Vec<Decoded>> {
        let record: Wal2JsonRecord = serde_json::from_str(data)
            .map_err(|e| CaptureError::Decode(format!("invalid wal2json record: {}", e)))?;

        match record.action.as_str() {
            "B" => {
                self.in_transaction = true;
                self.transaction_ts = record.timestamp.as_deref().and_then(parse_pg_timestamptz);
                Ok(vec![Decoded::Begin])
            }
            "C" => {
                self.in_transaction = false;
                self.transaction_ts = None;
                Ok(vec![Decoded::Commit])
            }
            "I" | "U" | "D" => self.decode_row(record),
            "M" => {
                if record.prefix.as_deref() == Some(self.heartbeat_prefix.as_str()) {
                    Ok(vec![Decoded::Heartbeat])
                } else {
                    debug!(prefix = ?record.prefix, "Skipping logical message");
                    Ok(vec![Decoded::Skip])
                }
            }
            other => {
                warn!(
                    action = %other,
                    schema = ?record.schema,
                    table = ?record.table,
                    "Skipping unsupported wal2json action"
                );
                Ok(vec![Decoded::Skip])
            }
        }
    }

    fn decode_row(&self, record: Wal2JsonRecord) -> Result<Vec<Decoded>> {
        let schema = record.schema.clone().unwrap_or_else(|| "public".to_string());
        let table_name = record
            .table
            .clone()
            .ok_or_else(|| CaptureError::Decode("row change without table".into()))?;
        let table = format!("{}.{}", schema, table_name);

        let timestamp = self
            .transaction_ts
            .or_else(|| record.timestamp.as_deref().and_then(parse_pg_timestamptz))
            .unwrap_or_else(Utc::now);
        let schema_version = self.schema_versions.get(&table).copied().unwrap_or(1);
        let autocommit = !self.in_transaction;

        let row = decode_columns(&record.columns)?;
        let old = decode_columns(&record.identity)?;

        let key_names: Vec<String> = if !record.pk.is_empty() {
            record.pk.iter().map(|c| c.name.clone()).collect()
        } else {
            record.identity.iter().map(|c| c.name.clone()).collect()
        };
        if key_names.is_empty() {
            return Err(CaptureError::Decode(format!(
                "table {} has no primary key or replica identity",
                table
            ))
            .into());
        }

        let make = |operation, source: &BTreeMap<String, ColumnValue>, payload| -> Result<Decoded> {
            let key = build_key(&table, &key_names, source)?;
            Ok(Decoded::Change {
                change: RowChange {
                    key,
                    operation,
                    payload,
                    timestamp,
                    schema_version,
                },
                autocommit,
            })
        };

        match record.action.as_str() {
            "I" => Ok(vec![make(Operation::Insert, &row, row.clone())?]),
            "D" => {
                let key_payload = key_only(&key_names, &old);
                Ok(vec![make(Operation::Delete, &old, key_payload)?])
            }
            _ => {
                let update = make(Operation::Update, &row, row.clone())?;
                let key_changed = !old.is_empty()
                    && key_names
                        .iter()
                        .any(|k| old.contains_key(k) && old.get(k) != row.get(k));
                if key_changed {
                    let delete = make(Operation::Delete, &old, key_only(&key_names, &old))?;
                    Ok(vec![delete, update])
                } else {
                    Ok(vec![update])
                }
            }
        }
    }
}

fn build_key(
    table: &str,
    key_names: &[String],
    source: &BTreeMap<String, ColumnValue>,
) -> Result<SourceKey> {
    let mut columns = Vec::with_capacity(key_names.len());
    for name in key_names {
        let value = source.get(name).cloned().ok_or_else(|| {
            CaptureError::Decode(format!("key column {} missing for {}", name, table))
        })?;
        columns.push(KeyColumn {
            name: name.clone(),
            value,
        });
    }
    Ok(SourceKey::new(table, columns))
}

fn key_only(key_names: &[String], source: &BTreeMap<String, ColumnValue>) -> BTreeMap<String, ColumnValue> {
    key_names
        .iter()
        .filter_map(|k| source.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

fn decode_columns(columns: &[Wal2JsonColumn]) -> Result<BTreeMap<String, ColumnValue>> {
    columns
        .iter()
        .map(|c| {
            let value = match &c.value {
                Some(v) => convert_value(c.type_name.as_deref().unwrap_or(""), v)?,
                None => ColumnValue::Null,
            };
            Ok((c.name.clone(), value))
        })
        .collect()
}

/// Strip type modifiers: `character varying(255)` -> `character varying`.
fn base_type(type_name: &str) -> String {
    let mut out = String::with_capacity(type_name.len());
    let mut depth = 0;
    for ch in type_name.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase()
}

fn convert_value(type_name: &str, value: &serde_json::Value) -> Result<ColumnValue> {
    use serde_json::Value;

    if value.is_null() {
        return Ok(ColumnValue::Null);
    }

    let ty = base_type(type_name);
    if let Some(element) = ty.strip_suffix("[]") {
        let text = value
            .as_str()
            .ok_or_else(|| CaptureError::Decode(format!("array value is not text: {}", value)))?;
        let items = parse_pg_array(text)?
            .into_iter()
            .map(|item| match item {
                None => Ok(ColumnValue::Null),
                Some(s) => convert_value(element, &Value::String(s)),
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(ColumnValue::Array(items));
    }

    let decode_err = |what: &str| CaptureError::Decode(format!("invalid {} value: {}", what, value));

    let converted = match ty.as_str() {
        "boolean" | "bool" => match value {
            Value::Bool(b) => ColumnValue::Bool(*b),
            Value::String(s) => ColumnValue::Bool(matches!(s.as_str(), "t" | "true")),
            _ => return Err(decode_err("boolean").into()),
        },
        "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" | "oid" => match value {
            Value::Number(n) => ColumnValue::Int(n.as_i64().ok_or_else(|| decode_err("integer"))?),
            Value::String(s) => ColumnValue::Int(s.parse().map_err(|_| decode_err("integer"))?),
            _ => return Err(decode_err("integer").into()),
        },
        "real" | "double precision" | "float4" | "float8" => match value {
            Value::Number(n) => ColumnValue::Float(n.as_f64().ok_or_else(|| decode_err("float"))?),
            Value::String(s) => ColumnValue::Float(s.parse().map_err(|_| decode_err("float"))?),
            _ => return Err(decode_err("float").into()),
        },
        // Keep arbitrary precision intact.
        "numeric" | "decimal" | "money" => match value {
            Value::Number(n) => ColumnValue::Text(n.to_string()),
            Value::String(s) => ColumnValue::Text(s.clone()),
            _ => return Err(decode_err("numeric").into()),
        },
        "bytea" => {
            let s = value.as_str().ok_or_else(|| decode_err("bytea"))?;
            ColumnValue::Bytes(decode_hex(s).ok_or_else(|| decode_err("bytea"))?)
        }
        "timestamp with time zone" | "timestamptz" => {
            let s = value.as_str().ok_or_else(|| decode_err("timestamptz"))?;
            ColumnValue::Timestamp(parse_pg_timestamptz(s).ok_or_else(|| decode_err("timestamptz"))?)
        }
        "timestamp without time zone" | "timestamp" => {
            let s = value.as_str().ok_or_else(|| decode_err("timestamp"))?;
            let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|_| decode_err("timestamp"))?;
            ColumnValue::Timestamp(naive.and_utc())
        }
        "json" | "jsonb" => match value {
            Value::String(s) => ColumnValue::Json(
                serde_json::from_str(s).map_err(|_| decode_err("json"))?,
            ),
            other => ColumnValue::Json(other.clone()),
        },
        _ => match value {
            Value::Bool(b) => ColumnValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ColumnValue::Int(i),
                None => ColumnValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => ColumnValue::Text(s.clone()),
            other => ColumnValue::Json(other.clone()),
        },
    };
    Ok(converted)
}

/// Parse the `timestamptz` text form, e.g. `2024-03-01 12:00:00.123456+00`.
pub(crate) fn parse_pg_timestamptz(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let hex = s.strip_prefix("\\x").unwrap_or(s);
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

/// Parse a one-dimensional array literal such as `{1,2,"a b",NULL}`.
fn parse_pg_array(text: &str) -> Result<Vec<Option<String>>> {
    let inner = text
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| CaptureError::Decode(format!("invalid array literal: {}", text)))?;

    let mut items = Vec::new();
    if inner.is_empty() {
        return Ok(items);
    }

    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                quoted = !quoted;
                was_quoted = true;
            }
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' if !quoted => {
                items.push(finish_item(&mut current, was_quoted));
                was_quoted = false;
            }
            '{' if !quoted => {
                return Err(CaptureError::Decode("multi-dimensional arrays are not supported".into()).into());
            }
            _ => current.push(ch),
        }
    }
    items.push(finish_item(&mut current, was_quoted));
    Ok(items)
}

fn finish_item(current: &mut String, was_quoted: bool) -> Option<String> {
    let item = std::mem::take(current);
    if !was_quoted && item.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn decoder() -> Wal2JsonDecoder {
        let mut versions = BTreeMap::new();
        versions.insert("public.customers".to_string(), 2);
        Wal2JsonDecoder::new("sentinelsync.heartbeat", versions)
    }

    fn single_change(decoded: Vec<Decoded>) -> (RowChange, bool) {
        assert_eq!(decoded.len(), 1, "{:?}", decoded);
        match decoded.into_iter().next() {
            Some(Decoded::Change { change, autocommit }) => (change, autocommit),
            other => panic!("expected change, got {:?}", other),
        }
    }

    #[test]
    fn test_insert_inside_transaction() {
        let mut d = decoder();
        assert_eq!(
            d.decode(r#"{"action":"B","timestamp":"2024-03-01 12:00:00.5+00"}"#).unwrap(),
            vec![Decoded::Begin]
        );

        let (change, autocommit) = single_change(
            d.decode(
                r#"{"action":"I","schema":"public","table":"customers",
                    "columns":[{"name":"id","type":"integer","value":7},
                               {"name":"name","type":"character varying(64)","value":"Ada"},
                               {"name":"profile","type":"jsonb","value":"{\"city\":\"Oslo\"}"},
                               {"name":"tags","type":"text[]","value":"{a,\"b c\",NULL}"}],
                    "pk":[{"name":"id","type":"integer"}]}"#,
            )
            .unwrap(),
        );

        assert!(!autocommit);
        assert_eq!(change.operation, Operation::Insert);
        assert_eq!(change.key.canonical(), "public.customers/id=7");
        assert_eq!(change.schema_version, 2);
        assert_eq!(
            change.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::milliseconds(500)
        );
        assert_eq!(change.payload["name"], ColumnValue::Text("Ada".into()));
        assert_eq!(
            change.payload["profile"],
            ColumnValue::Json(serde_json::json!({"city": "Oslo"}))
        );
        assert_eq!(
            change.payload["tags"],
            ColumnValue::Array(vec![
                ColumnValue::Text("a".into()),
                ColumnValue::Text("b c".into()),
                ColumnValue::Null
            ])
        );

        assert_eq!(d.decode(r#"{"action":"C"}"#).unwrap(), vec![Decoded::Commit]);
    }

    #[test]
    fn test_delete_is_key_only() {
        let mut d = decoder();
        let (change, autocommit) = single_change(
            d.decode(
                r#"{"action":"D","schema":"sales","table":"lines",
                    "identity":[{"name":"order_id","type":"bigint","value":1},
                                {"name":"line","type":"smallint","value":2}]}"#,
            )
            .unwrap(),
        );
        assert!(autocommit);
        assert_eq!(change.operation, Operation::Delete);
        assert_eq!(change.key.canonical(), "sales.lines/order_id=1,line=2");
        assert_eq!(change.payload.len(), 2);
        assert_eq!(change.schema_version, 1);
    }

    #[test]
    fn test_primary_key_change_splits_into_delete_and_update() {
        let mut d = decoder();
        let decoded = d
            .decode(
                r#"{"action":"U","schema":"public","table":"t",
                    "columns":[{"name":"id","type":"integer","value":2},{"name":"v","type":"text","value":"x"}],
                    "identity":[{"name":"id","type":"integer","value":1}],
                    "pk":[{"name":"id","type":"integer"}]}"#,
            )
            .unwrap();
        assert_eq!(decoded.len(), 2);
        match (&decoded[0], &decoded[1]) {
            (Decoded::Change { change: del, .. }, Decoded::Change { change: upd, .. }) => {
                assert_eq!(del.operation, Operation::Delete);
                assert_eq!(del.key.canonical(), "public.t/id=1");
                assert_eq!(upd.operation, Operation::Update);
                assert_eq!(upd.key.canonical(), "public.t/id=2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_table_without_key_is_rejected() {
        let mut d = decoder();
        let err = d
            .decode(r#"{"action":"I","schema":"public","table":"logs","columns":[{"name":"msg","type":"text","value":"x"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("no primary key"));
    }

    #[test]
    fn test_heartbeat_and_other_messages() {
        let mut d = decoder();
        assert_eq!(
            d.decode(r#"{"action":"M","transactional":false,"prefix":"sentinelsync.heartbeat","content":"1"}"#)
                .unwrap(),
            vec![Decoded::Heartbeat]
        );
        assert_eq!(
            d.decode(r#"{"action":"M","transactional":true,"prefix":"app.audit","content":"x"}"#)
                .unwrap(),
            vec![Decoded::Skip]
        );
        assert_eq!(
            d.decode(r#"{"action":"T","schema":"public","table":"t"}"#).unwrap(),
            vec![Decoded::Skip]
        );
    }

    #[test]
    fn test_typed_values() {
        assert_eq!(
            convert_value("bytea", &serde_json::json!("\\x00ff")).unwrap(),
            ColumnValue::Bytes(vec![0, 255])
        );
        assert_eq!(
            convert_value("numeric(10,2)", &serde_json::json!(12.5)).unwrap(),
            ColumnValue::Text("12.5".into())
        );
        assert_eq!(
            convert_value("boolean", &serde_json::json!(true)).unwrap(),
            ColumnValue::Bool(true)
        );
        assert_eq!(
            convert_value("timestamp without time zone", &serde_json::json!("2024-01-02 03:04:05")).unwrap(),
            ColumnValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
        );
        assert!(convert_value("integer", &serde_json::json!("abc")).is_err());
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let mut d = decoder();
        assert!(d.decode("not json").is_err());
    }
}
