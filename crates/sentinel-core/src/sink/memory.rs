//! In-process wide-column store.
//!
//! Used by tests and local runs. The position comparison and the write happen
//! under one lock, matching the atomicity of a lightweight transaction.

use super::{RowKey, RowMutation, StoreFactory, StoredRow, WideColumnStore, WriteOutcome};
use crate::{Result, SinkError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    /// table -> canonical row key -> row
    tables: Mutex<HashMap<String, HashMap<String, StoredRow>>>,
    fail_next: AtomicU64,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

/// Wide-column store kept in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes with `SinkError::Unavailable`.
    pub fn fail_next_writes(&self, n: u64) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Toggle availability of the whole store, probes included.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of writes that changed a row.
    pub fn applied_writes(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Rows of a table, tombstones included.
    pub fn rows(&self, table: &str) -> Vec<(String, StoredRow)> {
        let tables = self.inner.tables.lock();
        let mut rows: Vec<(String, StoredRow)> = tables
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("store is down".into()).into());
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WideColumnStore for MemoryStore {
    async fn write_if_newer(&self, mutation: &RowMutation) -> Result<WriteOutcome> {
        self.check_available()?;
        if self.take_injected_failure() {
            return Err(SinkError::Unavailable("injected write failure".into()).into());
        }

        let mut tables = self.inner.tables.lock();
        let table = tables.entry(mutation.table.clone()).or_default();
        let key = mutation.key.canonical();

        if let Some(existing) = table.get(&key) {
            if existing.position >= mutation.position {
                return Ok(WriteOutcome::Stale {
                    stored_position: existing.position,
                });
            }
        }

        table.insert(
            key,
            StoredRow {
                cells: if mutation.deleted {
                    Default::default()
                } else {
                    mutation.cells.clone()
                },
                position: mutation.position,
                idempotency_key: mutation.idempotency_key.clone(),
                deleted: mutation.deleted,
                source_ts: mutation.source_ts,
                schema_version: mutation.schema_version,
            },
        );
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(WriteOutcome::Applied)
    }

    async fn read(&self, table: &str, key: &RowKey) -> Result<Option<StoredRow>> {
        self.check_available()?;
        let tables = self.inner.tables.lock();
        Ok(tables
            .get(table)
            .and_then(|t| t.get(&key.canonical()))
            .cloned())
    }

    async fn probe(&self) -> Result<()> {
        self.check_available()
    }
}

/// Every handle shares the same tables.
#[async_trait]
impl StoreFactory for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn WideColumnStore>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{IdempotencyKey, SourcePosition};
    use crate::sink::CellValue;
    use std::collections::BTreeMap;

    fn mutation(position: u64, deleted: bool) -> RowMutation {
        let mut cells = BTreeMap::new();
        if !deleted {
            cells.insert("name".to_string(), CellValue::Text(format!("v{}", position)));
        }
        RowMutation {
            table: "public_users".into(),
            key: RowKey(vec![("id".into(), CellValue::BigInt(1))]),
            cells,
            position: SourcePosition(position),
            idempotency_key: IdempotencyKey::from(format!("k@{}", position)),
            deleted,
            source_ts: chrono::Utc::now(),
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn test_conditional_write_rejects_older_and_equal_positions() {
        let store = MemoryStore::new();
        assert_eq!(store.write_if_newer(&mutation(20, false)).await.unwrap(), WriteOutcome::Applied);
        assert_eq!(
            store.write_if_newer(&mutation(20, false)).await.unwrap(),
            WriteOutcome::Stale {
                stored_position: SourcePosition(20)
            }
        );
        assert_eq!(
            store.write_if_newer(&mutation(10, false)).await.unwrap(),
            WriteOutcome::Stale {
                stored_position: SourcePosition(20)
            }
        );
        assert_eq!(store.applied_writes(), 1);

        let row = store
            .read("public_users", &mutation(0, false).key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.cells.get("name"), Some(&CellValue::Text("v20".into())));
    }

    #[tokio::test]
    async fn test_tombstone_clears_cells_and_blocks_older_insert() {
        let store = MemoryStore::new();
        store.write_if_newer(&mutation(10, false)).await.unwrap();
        store.write_if_newer(&mutation(30, true)).await.unwrap();

        let stale = store.write_if_newer(&mutation(20, false)).await.unwrap();
        assert!(matches!(stale, WriteOutcome::Stale { .. }));

        let row = store
            .read("public_users", &mutation(0, false).key)
            .await
            .unwrap()
            .unwrap();
        assert!(row.deleted);
        assert!(row.cells.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_and_outage() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.write_if_newer(&mutation(1, false)).await.is_err());
        assert!(store.write_if_newer(&mutation(1, false)).await.is_ok());

        store.set_available(false);
        assert!(store.probe().await.is_err());
        assert!(store.write_if_newer(&mutation(2, false)).await.is_err());
        store.set_available(true);
        assert!(store.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_connections_share_tables() {
        let store = MemoryStore::new();
        let first = store.connect().await.unwrap();
        let second = store.connect().await.unwrap();
        first.write_if_newer(&mutation(5, false)).await.unwrap();

        let row = second.read("public_users", &mutation(0, false).key).await.unwrap();
        assert_eq!(row.map(|r| r.position), Some(SourcePosition(5)));
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
