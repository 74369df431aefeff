//! In-process log for tests and local runs.

use super::{LogAppender, LogRecord, PartitionReader, ReaderFactory, StartOffset};
use crate::{ConsumerError, PublishError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct PartitionLog {
    /// Offset of `records[0]`
    low_watermark: i64,
    records: Vec<(Vec<u8>, Vec<u8>)>,
}

impl PartitionLog {
    fn high_watermark(&self) -> i64 {
        self.low_watermark + self.records.len() as i64
    }
}

struct MemoryLogState {
    partitions: Vec<PartitionLog>,
    /// Remaining appends to fail with a transient error
    failing_appends: u32,
    max_message_bytes: Option<usize>,
}

/// A partitioned, offset-addressed log held in memory.
///
/// Cloning shares the underlying log.
#[derive(Clone)]
pub struct MemoryLog {
    state: Arc<Mutex<MemoryLogState>>,
}

impl MemoryLog {
    /// Create a log with `partitions` empty partitions.
    pub fn new(partitions: i32) -> Self {
        let partitions = (0..partitions.max(1)).map(|_| PartitionLog::default()).collect();
        Self {
            state: Arc::new(Mutex::new(MemoryLogState {
                partitions,
                failing_appends: 0,
                max_message_bytes: None,
            })),
        }
    }

    /// Reject appends larger than `bytes`, like a broker's message size limit.
    pub fn with_max_message_bytes(self, bytes: usize) -> Self {
        self.state.lock().max_message_bytes = Some(bytes);
        self
    }

    /// Fail the next `count` appends with a transient error.
    pub fn fail_next_appends(&self, count: u32) {
        self.state.lock().failing_appends = count;
    }

    /// Drop every record of `partition` below `offset`, like retention.
    pub fn truncate_before(&self, partition: i32, offset: i64) {
        let mut state = self.state.lock();
        if let Some(log) = state.partitions.get_mut(partition as usize) {
            let count = (offset - log.low_watermark).clamp(0, log.records.len() as i64);
            log.records.drain(..count as usize);
            log.low_watermark += count;
        }
    }

    /// Retained records of `partition`, oldest first.
    pub fn records(&self, partition: i32) -> Vec<LogRecord> {
        let state = self.state.lock();
        state
            .partitions
            .get(partition as usize)
            .map(|log| {
                log.records
                    .iter()
                    .enumerate()
                    .map(|(i, (key, payload))| LogRecord {
                        offset: log.low_watermark + i as i64,
                        key: Some(key.clone()),
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Append a raw payload directly, bypassing any publisher.
    pub fn append_raw(&self, partition: i32, key: &[u8], payload: &[u8]) -> Option<i64> {
        let mut state = self.state.lock();
        let log = state.partitions.get_mut(partition as usize)?;
        let offset = log.high_watermark();
        log.records.push((key.to_vec(), payload.to_vec()));
        Some(offset)
    }

    /// Reader for `partition`.
    pub fn reader(&self, partition: i32) -> MemoryPartitionReader {
        MemoryPartitionReader {
            state: Arc::clone(&self.state),
            partition,
            next: None,
        }
    }
}

#[async_trait]
impl LogAppender for MemoryLog {
    fn partition_count(&self) -> i32 {
        self.state.lock().partitions.len() as i32
    }

    async fn append(&self, partition: i32, key: &[u8], payload: &[u8]) -> Result<i64> {
        let mut state = self.state.lock();
        if state.failing_appends > 0 {
            state.failing_appends -= 1;
            return Err(PublishError::Transient("log unavailable".into()).into());
        }
        if let Some(max) = state.max_message_bytes {
            if payload.len() > max {
                return Err(PublishError::Rejected(format!(
                    "message of {} bytes exceeds limit of {}",
                    payload.len(),
                    max
                ))
                .into());
            }
        }

        let log = state
            .partitions
            .get_mut(partition as usize)
            .ok_or_else(|| PublishError::Rejected(format!("unknown partition {}", partition)))?;
        let offset = log.high_watermark();
        log.records.push((key.to_vec(), payload.to_vec()));
        Ok(offset)
    }
}

#[async_trait]
impl ReaderFactory for MemoryLog {
    async fn partition_ids(&self) -> Result<Vec<i32>> {
        Ok((0..self.partition_count()).collect())
    }

    async fn open_reader(&self, partition: i32) -> Result<Box<dyn PartitionReader>> {
        if partition < 0 || partition >= self.partition_count() {
            return Err(ConsumerError::Assignment(format!("unknown partition {}", partition)).into());
        }
        Ok(Box::new(self.reader(partition)))
    }
}

/// Reader over one [`MemoryLog`] partition.
pub struct MemoryPartitionReader {
    state: Arc<Mutex<MemoryLogState>>,
    partition: i32,
    next: Option<i64>,
}

impl MemoryPartitionReader {
    fn try_read(&mut self) -> Result<Option<LogRecord>> {
        let next = self.next.ok_or(ConsumerError::InvalidState {
            partition: self.partition,
            state: "unassigned".into(),
        })?;

        let state = self.state.lock();
        let log = &state.partitions[self.partition as usize];
        if next < log.low_watermark {
            return Err(ConsumerError::PartitionFailed {
                partition: self.partition,
                reason: format!(
                    "offset {} below retained range starting at {}",
                    next, log.low_watermark
                ),
            }
            .into());
        }

        let index = (next - log.low_watermark) as usize;
        let record = log.records.get(index).map(|(key, payload)| LogRecord {
            offset: next,
            key: Some(key.clone()),
            payload: payload.clone(),
        });
        drop(state);

        if record.is_some() {
            self.next = Some(next + 1);
        }
        Ok(record)
    }
}

#[async_trait]
impl PartitionReader for MemoryPartitionReader {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn seek(&mut self, start: StartOffset) -> Result<()> {
        let state = self.state.lock();
        let log = &state.partitions[self.partition as usize];
        self.next = Some(match start {
            StartOffset::Earliest => log.low_watermark,
            StartOffset::Latest => log.high_watermark(),
            StartOffset::At(offset) => offset,
        });
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogRecord>> {
        if let Some(record) = self.try_read()? {
            return Ok(Some(record));
        }
        tokio::time::sleep(timeout.min(IDLE_POLL)).await;
        self.try_read()
    }

    async fn high_watermark(&mut self) -> Result<i64> {
        let state = self.state.lock();
        Ok(state.partitions[self.partition as usize].high_watermark())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, PublishError};

    #[tokio::test]
    async fn test_append_and_read_back() {
        let log = MemoryLog::new(2);
        assert_eq!(log.append(1, b"k", b"a").await.unwrap(), 0);
        assert_eq!(log.append(1, b"k", b"b").await.unwrap(), 1);

        let mut reader = log.reader(1);
        reader.seek(StartOffset::Earliest).await.unwrap();
        let first = reader.poll(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.payload, b"a");
        assert_eq!(reader.poll(Duration::ZERO).await.unwrap().unwrap().offset, 1);
        assert!(reader.poll(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(reader.high_watermark().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reading_truncated_offset_fails_partition() {
        let log = MemoryLog::new(1);
        for i in 0..5u8 {
            log.append(0, b"k", &[i]).await.unwrap();
        }
        log.truncate_before(0, 3);

        let mut reader = log.reader(0);
        reader.seek(StartOffset::At(1)).await.unwrap();
        let err = reader.poll(Duration::ZERO).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Consumer(ConsumerError::PartitionFailed { partition: 0, .. })
        ));

        reader.seek(StartOffset::Earliest).await.unwrap();
        assert_eq!(reader.poll(Duration::ZERO).await.unwrap().unwrap().offset, 3);
    }

    #[tokio::test]
    async fn test_injected_failures_and_size_limit() {
        let log = MemoryLog::new(1).with_max_message_bytes(4);
        log.fail_next_appends(1);
        let err = log.append(0, b"k", b"ok").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(log.append(0, b"k", b"ok").await.unwrap(), 0);

        let err = log.append(0, b"k", b"too large").await.unwrap_err();
        assert!(matches!(err, Error::Publish(PublishError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_latest_skips_existing_records() {
        let log = MemoryLog::new(1);
        log.append(0, b"k", b"old").await.unwrap();
        let mut reader = log.reader(0);
        reader.seek(StartOffset::Latest).await.unwrap();
        assert!(reader.poll(Duration::ZERO).await.unwrap().is_none());
        log.append(0, b"k", b"new").await.unwrap();
        assert_eq!(reader.poll(Duration::ZERO).await.unwrap().unwrap().payload, b"new");
    }
}
