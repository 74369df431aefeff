//! Dead-letter inspection and requeue.

use anyhow::Result;
use sentinel_core::deadletter::{self, DeadLetterRecord, DeadLetterStore};
use sentinel_core::kafka::KafkaAppender;
use sentinel_core::publisher::Publisher;
use sentinel_core::Config;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Print dead-letter records, pending ones only unless `all` is set.
pub fn list(config: &Config, all: bool, json: bool) -> Result<()> {
    let store = DeadLetterStore::new(&config.dead_letter.path);
    let pending: HashSet<Uuid> = store.pending()?.iter().map(|r| r.id).collect();
    let records = if all {
        store.list()?
    } else {
        store.pending()?
    };

    if json {
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
        }
        return Ok(());
    }

    if records.is_empty() {
        println!("No dead-letter records in {}", config.dead_letter.path.display());
        return Ok(());
    }
    for record in &records {
        println!("{}", summary_line(record, pending.contains(&record.id)));
    }
    println!("\n{} record(s), {} pending", records.len(), pending.len());
    Ok(())
}

fn summary_line(record: &DeadLetterRecord, pending: bool) -> String {
    let subject = match record.event() {
        Some(event) => format!("{} @ {}", event.source_key(), event.source_position()),
        None => "<undecodable>".to_string(),
    };
    let at = record
        .offset
        .map(|o| o.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} [{}] {} stage={} class={} attempts={} offset={} failed_at={} :: {}",
        record.id,
        if pending { "pending" } else { "requeued" },
        subject,
        record.stage,
        record.error_class,
        record.attempts,
        at,
        record.failed_at.to_rfc3339(),
        record.last_error,
    )
}

/// Republish one record's event.
pub async fn requeue(config: &Config, id: Uuid) -> Result<()> {
    let mut store = DeadLetterStore::new(&config.dead_letter.path);
    // Fail before connecting when the record cannot be requeued
    let record = store.find_pending(id)?;
    if record.event().is_none() {
        anyhow::bail!("dead-letter record {} holds undecodable bytes and cannot be requeued", id);
    }

    let appender = KafkaAppender::connect(&config.kafka).await?;
    let publisher = Publisher::new(Arc::new(appender)).with_max_message_bytes(config.kafka.max_message_bytes);
    let at = deadletter::requeue(&mut store, id, &publisher).await?;
    println!("Requeued {} to partition {} offset {}", id, at.partition, at.offset);
    Ok(())
}
