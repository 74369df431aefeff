//! Cassandra-compatible store using lightweight transactions.
//!
//! Tables are expected to exist with the sink layout: key columns as the
//! partition key, one column per data cell, and the metadata columns
//! (`_source_position bigint`, `_idempotency_key text`, `_deleted boolean`,
//! `_source_ts timestamp`, `_schema_version int`).
//!
//! A write is an `UPDATE ... IF _source_position < ?`. When the row does not
//! exist the condition cannot hold, so the write falls back to
//! `INSERT ... IF NOT EXISTS`; losing that race retries the update.
//!
//! Updates set every data column of the table, nulling the ones the mutation
//! does not carry. A tombstone therefore leaves no data cells behind, and a
//! later image that drops a cell clears it. Data columns are read from
//! `system_schema.columns` and cached per table.

use super::{
    CellValue, RowKey, RowMutation, StoreFactory, StoredRow, WideColumnStore, WriteOutcome, COL_DELETED,
    COL_IDEMPOTENCY_KEY, COL_SCHEMA_VERSION, COL_SOURCE_POSITION, COL_SOURCE_TS,
};
use crate::config::{CassandraConfig, Consistency};
use crate::event::{IdempotencyKey, SourcePosition};
use crate::{Error, Result, SinkError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use scylla::frame::response::result::CqlValue;
use scylla::frame::value::CqlTimestamp;
use scylla::query::Query;
use scylla::statement::SerialConsistency;
use scylla::transport::errors::{DbError, QueryError};
use scylla::{QueryResult, Session, SessionBuilder};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const MAX_CONDITIONAL_ROUNDS: usize = 3;

type Values = Vec<Option<CqlValue>>;

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn classify(err: QueryError) -> Error {
    match &err {
        QueryError::DbError(
            DbError::Invalid | DbError::SyntaxError | DbError::AlreadyExists { .. } | DbError::ConfigError,
            _,
        )
        | QueryError::BadQuery(_) => SinkError::Rejected(err.to_string()).into(),
        _ => SinkError::Unavailable(err.to_string()).into(),
    }
}

fn to_cql(value: &CellValue) -> Option<CqlValue> {
    match value {
        CellValue::Null => None,
        CellValue::Boolean(b) => Some(CqlValue::Boolean(*b)),
        CellValue::BigInt(i) => Some(CqlValue::BigInt(*i)),
        CellValue::Double(d) => Some(CqlValue::Double(*d)),
        CellValue::Text(s) => Some(CqlValue::Text(s.clone())),
        CellValue::Blob(b) => Some(CqlValue::Blob(b.clone())),
        CellValue::Timestamp(ts) => Some(CqlValue::Timestamp(CqlTimestamp(ts.timestamp_millis()))),
    }
}

fn from_cql(value: Option<CqlValue>) -> CellValue {
    match value {
        None => CellValue::Null,
        Some(CqlValue::Boolean(b)) => CellValue::Boolean(b),
        Some(CqlValue::BigInt(i)) => CellValue::BigInt(i),
        Some(CqlValue::Int(i)) => CellValue::BigInt(i64::from(i)),
        Some(CqlValue::SmallInt(i)) => CellValue::BigInt(i64::from(i)),
        Some(CqlValue::Double(d)) => CellValue::Double(d),
        Some(CqlValue::Float(f)) => CellValue::Double(f64::from(f)),
        Some(CqlValue::Text(s)) | Some(CqlValue::Ascii(s)) => CellValue::Text(s),
        Some(CqlValue::Blob(b)) => CellValue::Blob(b),
        Some(CqlValue::Timestamp(ts)) => CellValue::Timestamp(millis_to_utc(ts.0)),
        Some(other) => CellValue::Text(format!("{:?}", other)),
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

fn consistency(level: Consistency) -> scylla::statement::Consistency {
    match level {
        Consistency::One => scylla::statement::Consistency::One,
        Consistency::Quorum => scylla::statement::Consistency::Quorum,
        Consistency::LocalQuorum => scylla::statement::Consistency::LocalQuorum,
        Consistency::All => scylla::statement::Consistency::All,
    }
}

/// `[applied]` flag and first returned column of a conditional statement.
fn conditional_result(result: &QueryResult) -> Result<(bool, Option<CqlValue>)> {
    let row = result
        .rows
        .as_ref()
        .and_then(|rows| rows.first())
        .ok_or_else(|| SinkError::Unavailable("conditional write returned no rows".into()))?;

    let applied = match row.columns.first() {
        Some(Some(CqlValue::Boolean(b))) => *b,
        _ => {
            return Err(SinkError::Unavailable("conditional write returned no [applied] flag".into()).into());
        }
    };
    Ok((applied, row.columns.get(1).cloned().flatten()))
}

/// Non-key columns for a conditional update: the mutation's cells, a null
/// for every other data column of the table, then the metadata columns.
fn update_columns(mutation: &RowMutation, data_columns: &[String]) -> Vec<(String, Option<CqlValue>)> {
    let mut columns: Vec<(String, Option<CqlValue>)> = Vec::new();
    if !mutation.deleted {
        columns.extend(
            mutation
                .cells
                .iter()
                .map(|(name, value)| (name.clone(), to_cql(value))),
        );
    }
    for name in data_columns {
        let carried = !mutation.deleted && mutation.cells.contains_key(name);
        if !carried && !name.starts_with('_') {
            columns.push((name.clone(), None));
        }
    }
    columns.extend(metadata_columns(mutation));
    columns
}

fn metadata_columns(mutation: &RowMutation) -> [(String, Option<CqlValue>); 5] {
    [
        (
            COL_SOURCE_POSITION.to_string(),
            Some(CqlValue::BigInt(mutation.position.as_u64() as i64)),
        ),
        (
            COL_IDEMPOTENCY_KEY.to_string(),
            Some(CqlValue::Text(mutation.idempotency_key.to_string())),
        ),
        (COL_DELETED.to_string(), Some(CqlValue::Boolean(mutation.deleted))),
        (
            COL_SOURCE_TS.to_string(),
            Some(CqlValue::Timestamp(CqlTimestamp(mutation.source_ts.timestamp_millis()))),
        ),
        (
            COL_SCHEMA_VERSION.to_string(),
            Some(CqlValue::Int(mutation.schema_version as i32)),
        ),
    ]
}

/// Store backed by a Cassandra or ScyllaDB cluster.
pub struct CassandraStore {
    session: Session,
    keyspace: String,
    consistency: scylla::statement::Consistency,
    request_timeout: Duration,
    /// table -> regular (non-key) columns
    data_columns: DashMap<String, Vec<String>>,
}

impl CassandraStore {
    /// Connect and make sure the keyspace exists.
    pub async fn connect(config: &CassandraConfig) -> Result<Self> {
        let mut builder = SessionBuilder::new().known_nodes(config.contact_points());
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            builder = builder.user(user, password);
        }
        let session = builder
            .build()
            .await
            .map_err(|e| SinkError::Unavailable(format!("connect failed: {}", e)))?;

        let store = Self {
            session,
            keyspace: config.keyspace.clone(),
            consistency: consistency(config.consistency),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            data_columns: DashMap::new(),
        };

        let create = format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
            quote(&config.keyspace),
            config.replication_factor
        );
        store.execute(create, Vec::new()).await?;

        info!(
            hosts = ?config.hosts,
            keyspace = %config.keyspace,
            "Connected to sink cluster"
        );
        Ok(store)
    }

    fn statement(&self, cql: String) -> Query {
        let mut query = Query::new(cql);
        query.set_consistency(self.consistency);
        query.set_serial_consistency(Some(SerialConsistency::Serial));
        query.set_request_timeout(Some(self.request_timeout));
        query
    }

    async fn execute(&self, cql: String, values: Values) -> Result<QueryResult> {
        self.session
            .query(self.statement(cql), values)
            .await
            .map_err(classify)
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote(&self.keyspace), quote(table))
    }

    /// Regular columns of `table`, reloaded when a mutation carries a cell
    /// the cached list does not know.
    async fn table_columns(&self, mutation: &RowMutation) -> Result<Vec<String>> {
        if let Some(cached) = self.data_columns.get(&mutation.table) {
            if mutation.cells.keys().all(|name| cached.contains(name)) {
                return Ok(cached.value().clone());
            }
        }

        let result = self
            .execute(
                "SELECT column_name, kind FROM system_schema.columns WHERE keyspace_name = ? AND table_name = ?"
                    .to_string(),
                vec![
                    Some(CqlValue::Text(self.keyspace.clone())),
                    Some(CqlValue::Text(mutation.table.clone())),
                ],
            )
            .await?;
        let columns: Vec<String> = result
            .rows
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| match (row.columns.first(), row.columns.get(1)) {
                (Some(Some(CqlValue::Text(name))), Some(Some(CqlValue::Text(kind)))) if kind == "regular" => {
                    Some(name.clone())
                }
                _ => None,
            })
            .collect();

        debug!(table = %mutation.table, columns = columns.len(), "Loaded sink table columns");
        self.data_columns.insert(mutation.table.clone(), columns.clone());
        Ok(columns)
    }

    fn key_clause(key: &RowKey) -> (String, Values) {
        let clause = key
            .0
            .iter()
            .map(|(name, _)| format!("{} = ?", quote(name)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let values = key.0.iter().map(|(_, value)| to_cql(value)).collect();
        (clause, values)
    }

    async fn conditional_update(&self, mutation: &RowMutation) -> Result<(bool, Option<CqlValue>)> {
        let columns = update_columns(mutation, &self.table_columns(mutation).await?);
        let assignments = columns
            .iter()
            .map(|(name, _)| format!("{} = ?", quote(name)))
            .collect::<Vec<_>>()
            .join(", ");
        let (where_clause, key_values) = Self::key_clause(&mutation.key);

        let cql = format!(
            "UPDATE {} SET {} WHERE {} IF {} < ?",
            self.qualified(&mutation.table),
            assignments,
            where_clause,
            quote(COL_SOURCE_POSITION)
        );
        let mut values: Values = columns.into_iter().map(|(_, v)| v).collect();
        values.extend(key_values);
        values.push(Some(CqlValue::BigInt(mutation.position.as_u64() as i64)));

        let result = self.execute(cql, values).await?;
        conditional_result(&result)
    }

    async fn conditional_insert(&self, mutation: &RowMutation) -> Result<bool> {
        let mut names: Vec<String> = mutation.key.0.iter().map(|(n, _)| quote(n)).collect();
        let mut values: Values = mutation.key.0.iter().map(|(_, v)| to_cql(v)).collect();
        let cells = mutation
            .cells
            .iter()
            .filter(|_| !mutation.deleted)
            .map(|(name, value)| (name.clone(), to_cql(value)));
        for (name, value) in cells.chain(metadata_columns(mutation)) {
            names.push(quote(&name));
            values.push(value);
        }
        let placeholders = vec!["?"; names.len()].join(", ");

        let cql = format!(
            "INSERT INTO {} ({}) VALUES ({}) IF NOT EXISTS",
            self.qualified(&mutation.table),
            names.join(", "),
            placeholders
        );
        let result = self.execute(cql, values).await?;
        Ok(conditional_result(&result)?.0)
    }
}

#[async_trait]
impl WideColumnStore for CassandraStore {
    async fn write_if_newer(&self, mutation: &RowMutation) -> Result<WriteOutcome> {
        for _ in 0..MAX_CONDITIONAL_ROUNDS {
            match self.conditional_update(mutation).await? {
                (true, _) => return Ok(WriteOutcome::Applied),
                (false, Some(CqlValue::BigInt(stored))) => {
                    return Ok(WriteOutcome::Stale {
                        stored_position: SourcePosition(stored as u64),
                    });
                }
                (false, _) => {}
            }

            if self.conditional_insert(mutation).await? {
                return Ok(WriteOutcome::Applied);
            }
            debug!(
                table = %mutation.table,
                key = %mutation.key.canonical(),
                "Concurrent insert won, retrying conditional update"
            );
        }

        Err(SinkError::Unavailable(format!(
            "conditional write on {} {} did not settle",
            mutation.table,
            mutation.key.canonical()
        ))
        .into())
    }

    async fn read(&self, table: &str, key: &RowKey) -> Result<Option<StoredRow>> {
        let (where_clause, values) = Self::key_clause(key);
        let cql = format!("SELECT * FROM {} WHERE {}", self.qualified(table), where_clause);
        let result = self.execute(cql, values).await?;

        let names: Vec<String> = result.col_specs.iter().map(|spec| spec.name.clone()).collect();
        let Some(row) = result.rows.and_then(|rows| rows.into_iter().next()) else {
            return Ok(None);
        };

        let mut stored = StoredRow {
            cells: BTreeMap::new(),
            position: SourcePosition::ZERO,
            idempotency_key: IdempotencyKey::from(String::new()),
            deleted: false,
            source_ts: DateTime::<Utc>::default(),
            schema_version: 0,
        };
        for (name, value) in names.into_iter().zip(row.columns) {
            if key.0.iter().any(|(k, _)| k == &name) {
                continue;
            }
            match (name.as_str(), value) {
                (COL_SOURCE_POSITION, Some(CqlValue::BigInt(p))) => stored.position = SourcePosition(p as u64),
                (COL_IDEMPOTENCY_KEY, Some(CqlValue::Text(k))) => stored.idempotency_key = k.into(),
                (COL_DELETED, Some(CqlValue::Boolean(d))) => stored.deleted = d,
                (COL_SOURCE_TS, Some(CqlValue::Timestamp(ts))) => stored.source_ts = millis_to_utc(ts.0),
                (COL_SCHEMA_VERSION, Some(CqlValue::Int(v))) => stored.schema_version = v as u32,
                (other, value) if !other.starts_with('_') => {
                    let cell = from_cql(value);
                    if cell != CellValue::Null {
                        stored.cells.insert(name, cell);
                    }
                }
                _ => {}
            }
        }
        if stored.deleted {
            stored.cells.clear();
        }
        Ok(Some(stored))
    }

    async fn probe(&self) -> Result<()> {
        self.execute("SELECT release_version FROM system.local".to_string(), Vec::new())
            .await
            .map(|_| ())
    }
}

/// Opens one [`CassandraStore`] session per call.
#[derive(Debug, Clone)]
pub struct CassandraStoreFactory {
    config: CassandraConfig,
}

impl CassandraStoreFactory {
    pub fn new(config: CassandraConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreFactory for CassandraStoreFactory {
    async fn connect(&self) -> Result<Arc<dyn WideColumnStore>> {
        Ok(Arc::new(CassandraStore::connect(&self.config).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_are_quoted() {
        assert_eq!(quote("address.city"), "\"address.city\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_cell_conversion_round_trips_scalars() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        for cell in [
            CellValue::Boolean(true),
            CellValue::BigInt(-5),
            CellValue::Double(1.5),
            CellValue::Text("x".into()),
            CellValue::Blob(vec![1, 2]),
            CellValue::Timestamp(ts),
            CellValue::Null,
        ] {
            assert_eq!(from_cql(to_cql(&cell)), cell);
        }
    }

    fn mutation(deleted: bool, cells: &[(&str, &str)]) -> RowMutation {
        RowMutation {
            table: "public_users".into(),
            key: RowKey(vec![("id".into(), CellValue::BigInt(1))]),
            cells: cells
                .iter()
                .map(|(n, v)| (n.to_string(), CellValue::Text(v.to_string())))
                .collect(),
            position: SourcePosition(3),
            idempotency_key: IdempotencyKey::from("public.users/id=1@0/3".to_string()),
            deleted,
            source_ts: Utc::now(),
            schema_version: 1,
        }
    }

    fn names(columns: &[(String, Option<CqlValue>)]) -> Vec<&str> {
        columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[test]
    fn test_tombstone_nulls_every_data_column() {
        let table = vec!["name".to_string(), "email".to_string(), COL_DELETED.to_string()];
        let columns = update_columns(&mutation(true, &[]), &table);

        assert_eq!(
            names(&columns),
            vec![
                "name",
                "email",
                COL_SOURCE_POSITION,
                COL_IDEMPOTENCY_KEY,
                COL_DELETED,
                COL_SOURCE_TS,
                COL_SCHEMA_VERSION
            ]
        );
        assert!(columns[0].1.is_none());
        assert!(columns[1].1.is_none());
        assert_eq!(columns[4].1, Some(CqlValue::Boolean(true)));
    }

    #[test]
    fn test_image_clears_cells_it_no_longer_carries() {
        let table = vec![
            "name".to_string(),
            "address.city".to_string(),
            "address.zip".to_string(),
        ];
        let columns = update_columns(&mutation(false, &[("name", "a"), ("address.city", "Oslo")]), &table);

        let data: Vec<_> = columns.iter().filter(|(n, _)| !n.starts_with('_')).collect();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0], &("address.city".to_string(), Some(CqlValue::Text("Oslo".into()))));
        assert_eq!(data[1], &("name".to_string(), Some(CqlValue::Text("a".into()))));
        assert_eq!(data[2], &("address.zip".to_string(), None));
    }
}
