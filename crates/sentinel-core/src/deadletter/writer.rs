//! Single writer task for the dead-letter store.

use super::record::{DeadLetterEntry, DeadLetterRecord};
use super::store::DeadLetterStore;
use crate::event::PartitionOffset;
use crate::publisher::Publisher;
use crate::{DeadLetterError, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

struct AppendRequest {
    record: DeadLetterRecord,
    response_tx: oneshot::Sender<Result<()>>,
}

/// Cloneable handle to the dead-letter writer task.
#[derive(Clone)]
pub struct DeadLetterWriter {
    tx: mpsc::Sender<AppendRequest>,
}

impl DeadLetterWriter {
    /// Start the writer task. It runs until every handle is dropped.
    pub fn spawn(mut store: DeadLetterStore) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AppendRequest>(CHANNEL_CAPACITY);

        let handle = tokio::task::spawn_blocking(move || {
            info!(path = %store.path().display(), "Dead-letter writer started");
            while let Some(request) = rx.blocking_recv() {
                let result = store.append(&DeadLetterEntry::Record(request.record.clone()));
                match &result {
                    Ok(()) => warn!(
                        id = %request.record.id,
                        stage = %request.record.stage,
                        error_class = %request.record.error_class,
                        attempts = request.record.attempts,
                        offset = ?request.record.offset,
                        "Event dead-lettered"
                    ),
                    Err(e) => error!(id = %request.record.id, error = %e, "Dead-letter append failed"),
                }
                // The requester may have given up; the record is still durable.
                let _ = request.response_tx.send(result);
            }
            info!("Dead-letter writer stopped");
        });

        (Self { tx }, handle)
    }

    /// Append a record; returns once it is durable.
    pub async fn write(&self, record: DeadLetterRecord) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AppendRequest { record, response_tx })
            .await
            .map_err(|_| DeadLetterError::WriterClosed)?;
        response_rx.await.map_err(|_| DeadLetterError::WriterClosed)?
    }
}

/// Publish a pending record's event again and mark the record requeued.
///
/// Records whose payload never decoded cannot be requeued.
pub async fn requeue(store: &mut DeadLetterStore, id: Uuid, publisher: &Publisher) -> Result<PartitionOffset> {
    let record = store.find_pending(id)?;
    let event = record.event().ok_or_else(|| DeadLetterError::NotRequeueable {
        id: id.to_string(),
        reason: "payload is not a decodable event".into(),
    })?;

    let at = publisher.publish(event).await?;
    store.mark_requeued(id, at)?;
    info!(id = %id, key = %event.source_key(), at = %at, "Dead-letter record republished");
    Ok(at)
}
