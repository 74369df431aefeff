//! Capture adapter: source records in, ordered change events out.
//!
//! The adapter assigns every emitted item a strictly increasing position and
//! keeps an acknowledgement tracker so the source is only ever released up to
//! a transaction boundary whose items are all durable downstream.

use super::source::{ChangeSource, SourceRecord};
use super::wal2json::{Decoded, Wal2JsonDecoder};
use crate::config::CaptureConfig;
use crate::event::{ChangeEvent, SourcePosition};
use crate::{CaptureError, Result};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Item produced by the capture adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureItem {
    /// A row change
    Event(ChangeEvent),
    /// A heartbeat that travelled through the source stream
    Heartbeat(SourcePosition),
    /// A source record that could not be turned into an event
    Rejected {
        position: SourcePosition,
        raw: String,
        error: String,
    },
}

impl CaptureItem {
    /// Position assigned by the adapter.
    pub fn position(&self) -> SourcePosition {
        match self {
            CaptureItem::Event(event) => event.source_position(),
            CaptureItem::Heartbeat(position) => *position,
            CaptureItem::Rejected { position, .. } => *position,
        }
    }
}

#[derive(Debug)]
enum Pending {
    Item {
        position: SourcePosition,
        confirmed: bool,
    },
    Boundary {
        source_position: SourcePosition,
    },
}

/// Tracks which emitted positions are durable and which source positions
/// may therefore be released.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: VecDeque<Pending>,
    durable: Option<SourcePosition>,
    /// (durable emitted position when the boundary cleared, source position)
    ack_points: VecDeque<(SourcePosition, SourcePosition)>,
}

impl AckTracker {
    fn emitted(&mut self, position: SourcePosition) {
        self.pending.push_back(Pending::Item {
            position,
            confirmed: false,
        });
    }

    fn boundary(&mut self, source_position: SourcePosition) {
        self.pending.push_back(Pending::Boundary { source_position });
        self.drain();
    }

    /// Mark an emitted position durable.
    pub fn confirm(&mut self, position: SourcePosition) -> Result<()> {
        let found = self.pending.iter_mut().find_map(|p| match p {
            Pending::Item {
                position: pos,
                confirmed,
            } if *pos == position => Some(confirmed),
            _ => None,
        });

        match found {
            Some(confirmed) => *confirmed = true,
            None if self.durable.map_or(false, |d| position <= d) => return Ok(()),
            None => {
                return Err(CaptureError::AckAheadOfDurable {
                    requested: position.to_string(),
                    confirmed: self.durable.unwrap_or_default().to_string(),
                }
                .into())
            }
        }

        self.drain();
        Ok(())
    }

    fn drain(&mut self) {
        while let Some(front) = self.pending.front() {
            match *front {
                Pending::Item {
                    position,
                    confirmed: true,
                } => self.durable = Some(position),
                Pending::Item { .. } => break,
                Pending::Boundary { source_position } => self
                    .ack_points
                    .push_back((self.durable.unwrap_or_default(), source_position)),
            }
            self.pending.pop_front();
        }
    }

    /// Highest emitted position with every earlier item confirmed.
    pub fn durable(&self) -> Option<SourcePosition> {
        self.durable
    }

    /// Source position that may be released for an emitted `position`.
    fn take_ack_point(&mut self, position: SourcePosition) -> Option<SourcePosition> {
        let mut latest = None;
        while let Some(&(emitted, source)) = self.ack_points.front() {
            if emitted > position {
                break;
            }
            latest = Some(source);
            self.ack_points.pop_front();
        }
        latest
    }

    /// Items emitted but not yet confirmed.
    pub fn in_flight(&self) -> usize {
        self.pending
            .iter()
            .filter(|p| matches!(p, Pending::Item { confirmed: false, .. }))
            .count()
    }
}

/// Presents a [`ChangeSource`] as an ordered, restartable sequence of
/// [`CaptureItem`]s.
pub struct CaptureAdapter<S: ChangeSource> {
    source: S,
    decoder: Wal2JsonDecoder,
    tracker: AckTracker,
    buffered: VecDeque<CaptureItem>,
    last_position: SourcePosition,
    batch_size: usize,
    started: bool,
}

impl<S: ChangeSource> CaptureAdapter<S> {
    /// Create an adapter over `source`.
    pub fn new(source: S, config: &CaptureConfig, batch_size: usize) -> Self {
        Self {
            source,
            decoder: Wal2JsonDecoder::new(
                config.heartbeat_prefix.clone(),
                config.schema_versions.clone(),
            ),
            tracker: AckTracker::default(),
            buffered: VecDeque::new(),
            last_position: SourcePosition::ZERO,
            batch_size: batch_size.max(1),
            started: false,
        }
    }

    /// Start emitting items strictly after `resume` (or after the source's
    /// acknowledged position when `None`).
    ///
    /// Fails with `SourceUnavailable` if the source no longer retains `resume`.
    pub async fn start(&mut self, resume: Option<SourcePosition>) -> Result<()> {
        self.source.open(resume).await?;
        self.tracker = AckTracker::default();
        self.buffered.clear();
        self.last_position = resume.unwrap_or_else(|| self.source.confirmed_position());
        self.started = true;
        info!(resume = %self.last_position, "Capture started");
        Ok(())
    }

    /// Next item, or `None` when the source has nothing new right now.
    pub async fn next(&mut self) -> Result<Option<CaptureItem>> {
        if !self.started {
            return Err(CaptureError::NotStarted.into());
        }

        while self.buffered.is_empty() {
            let records = self.source.poll(self.batch_size).await?;
            if records.is_empty() {
                return Ok(None);
            }
            for record in records {
                self.ingest(record);
            }
        }
        Ok(self.buffered.pop_front())
    }

    fn assign_position(&mut self, reported: SourcePosition) -> SourcePosition {
        let next = SourcePosition(self.last_position.as_u64() + 1);
        let position = reported.max(next);
        self.last_position = position;
        position
    }

    fn ingest(&mut self, record: SourceRecord) {
        let decoded = match self.decoder.decode(&record.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(position = %record.position, error = %e, "Rejecting undecodable source record");
                let position = self.assign_position(record.position);
                self.tracker.emitted(position);
                self.buffered.push_back(CaptureItem::Rejected {
                    position,
                    raw: record.data,
                    error: e.to_string(),
                });
                return;
            }
        };

        for item in decoded {
            match item {
                Decoded::Change { change, autocommit } => {
                    let position = self.assign_position(record.position);
                    self.tracker.emitted(position);
                    self.buffered.push_back(CaptureItem::Event(change.into_event(position)));
                    if autocommit {
                        self.tracker.boundary(record.position);
                    }
                }
                Decoded::Heartbeat => {
                    let position = self.assign_position(record.position);
                    self.tracker.emitted(position);
                    self.buffered.push_back(CaptureItem::Heartbeat(position));
                    self.tracker.boundary(record.position);
                }
                Decoded::Commit => self.tracker.boundary(record.position),
                Decoded::Begin | Decoded::Skip => {}
            }
        }
    }

    /// Record that the item at `position` is durable downstream.
    pub fn confirm(&mut self, position: SourcePosition) -> Result<()> {
        self.tracker.confirm(position)
    }

    /// Release the source up to `position`.
    ///
    /// Refused with `AckAheadOfDurable` unless every item up to `position`
    /// has been confirmed.
    pub async fn acknowledge(&mut self, position: SourcePosition) -> Result<()> {
        let durable = self.tracker.durable();
        if durable.map_or(true, |d| position > d) {
            return Err(CaptureError::AckAheadOfDurable {
                requested: position.to_string(),
                confirmed: durable.unwrap_or_default().to_string(),
            }
            .into());
        }

        if let Some(source_position) = self.tracker.take_ack_point(position) {
            self.source.acknowledge(source_position).await?;
            debug!(position = %position, source_position = %source_position, "Source acknowledged");
        }
        Ok(())
    }

    /// Acknowledge everything confirmed so far. Returns the released
    /// emitted position, if any.
    pub async fn acknowledge_confirmed(&mut self) -> Result<Option<SourcePosition>> {
        match self.tracker.durable() {
            Some(durable) => {
                self.acknowledge(durable).await?;
                Ok(Some(durable))
            }
            None => Ok(None),
        }
    }

    /// Position last acknowledged to the source.
    pub fn confirmed_position(&self) -> SourcePosition {
        self.source.confirmed_position()
    }

    /// Items emitted but not yet confirmed.
    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::MemorySource;
    use crate::event::Operation;
    use crate::Error;
    use serde_json::json;

    fn insert(id: i64) -> serde_json::Value {
        json!({
            "action": "I", "schema": "public", "table": "users",
            "columns": [{"name": "id", "type": "integer", "value": id}],
            "pk": [{"name": "id", "type": "integer"}]
        })
    }

    fn adapter(source: MemorySource) -> CaptureAdapter<MemorySource> {
        CaptureAdapter::new(source, &CaptureConfig::default(), 100)
    }

    #[tokio::test]
    async fn test_emits_events_in_order() {
        let (source, handle) = MemorySource::new();
        let p1 = handle.push_json(insert(1));
        let p2 = handle.push_json(insert(2));

        let mut capture = adapter(source);
        capture.start(None).await.unwrap();

        let first = capture.next().await.unwrap().unwrap();
        let second = capture.next().await.unwrap().unwrap();
        assert_eq!(first.position(), p1);
        assert_eq!(second.position(), p2);
        match first {
            CaptureItem::Event(e) => assert_eq!(e.operation(), Operation::Insert),
            other => panic!("unexpected {:?}", other),
        }
        assert!(capture.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_ahead_of_durable_is_refused() {
        let (source, handle) = MemorySource::new();
        handle.push_json(insert(1));
        let p2 = handle.push_json(insert(2));

        let mut capture = adapter(source);
        capture.start(None).await.unwrap();
        let a = capture.next().await.unwrap().unwrap();
        capture.next().await.unwrap().unwrap();

        let err = capture.acknowledge(p2).await.unwrap_err();
        assert!(matches!(err, Error::Capture(CaptureError::AckAheadOfDurable { .. })));

        // Confirming out of order does not make the later position durable.
        capture.confirm(p2).unwrap();
        assert!(capture.acknowledge(p2).await.is_err());

        capture.confirm(a.position()).unwrap();
        capture.acknowledge(p2).await.unwrap();
        assert_eq!(handle.confirmed_position(), p2);
        assert_eq!(handle.retained(), 0);
    }

    #[tokio::test]
    async fn test_transaction_released_only_at_commit() {
        let (source, handle) = MemorySource::new();
        handle.push_json(json!({"action": "B"}));
        let p1 = handle.push_json(insert(1));
        let p2 = handle.push_json(insert(2));
        let commit = handle.push_json(json!({"action": "C"}));

        let mut capture = adapter(source);
        capture.start(None).await.unwrap();
        capture.next().await.unwrap().unwrap();
        capture.next().await.unwrap().unwrap();

        capture.confirm(p1).unwrap();
        capture.acknowledge(p1).await.unwrap();
        // Mid-transaction: nothing released yet.
        assert_eq!(handle.confirmed_position(), SourcePosition::ZERO);

        capture.confirm(p2).unwrap();
        assert_eq!(capture.acknowledge_confirmed().await.unwrap(), Some(p2));
        assert_eq!(handle.confirmed_position(), commit);
    }

    #[tokio::test]
    async fn test_restart_replays_unacknowledged() {
        let (source, handle) = MemorySource::new();
        let p1 = handle.push_json(insert(1));
        let p2 = handle.push_json(insert(2));

        let mut capture = adapter(source);
        capture.start(None).await.unwrap();
        capture.next().await.unwrap();
        capture.next().await.unwrap();
        capture.confirm(p1).unwrap();
        capture.acknowledge_confirmed().await.unwrap();

        capture.start(None).await.unwrap();
        let replayed = capture.next().await.unwrap().unwrap();
        assert_eq!(replayed.position(), p2);
    }

    #[tokio::test]
    async fn test_start_after_expired_position_fails() {
        let (source, handle) = MemorySource::new();
        let p1 = handle.push_json(insert(1));
        handle.push_json(insert(2));

        let mut capture = adapter(source);
        capture.start(None).await.unwrap();
        capture.next().await.unwrap();
        capture.confirm(p1).unwrap();
        capture.acknowledge_confirmed().await.unwrap();

        let err = capture.start(Some(SourcePosition::ZERO)).await.unwrap_err();
        assert!(matches!(err, Error::Capture(CaptureError::SourceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_heartbeats_and_rejections_are_surfaced() {
        let (source, handle) = MemorySource::new();
        let hb = handle.push_json(json!({
            "action": "M", "transactional": false,
            "prefix": "sentinelsync.heartbeat", "content": "x"
        }));
        let bad = handle.push_json(json!({
            "action": "I", "schema": "public", "table": "nokey",
            "columns": [{"name": "v", "type": "text", "value": "x"}]
        }));

        let mut capture = adapter(source);
        capture.start(None).await.unwrap();
        assert_eq!(capture.next().await.unwrap(), Some(CaptureItem::Heartbeat(hb)));
        match capture.next().await.unwrap() {
            Some(CaptureItem::Rejected { position, .. }) => assert_eq!(position, bad),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(capture.in_flight(), 2);
    }

    #[test]
    fn test_positions_stay_strictly_increasing() {
        let (source, _handle) = MemorySource::new();
        let mut capture = adapter(source);
        capture.last_position = SourcePosition(100);
        // An interleaved transaction reporting lower change positions.
        assert_eq!(capture.assign_position(SourcePosition(50)), SourcePosition(101));
        assert_eq!(capture.assign_position(SourcePosition(60)), SourcePosition(102));
        assert_eq!(capture.assign_position(SourcePosition(300)), SourcePosition(300));
    }

    #[tokio::test]
    async fn test_next_before_start_fails() {
        let (source, _handle) = MemorySource::new();
        let mut capture = adapter(source);
        assert!(capture.next().await.is_err());
    }
}
