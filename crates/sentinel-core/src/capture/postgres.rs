//! PostgreSQL logical decoding source (wal2json over the SQL interface).
//!
//! Changes are read with `pg_logical_slot_peek_changes`, which never consumes
//! them; the slot only moves forward through `pg_replication_slot_advance`
//! once the caller acknowledges. Peeking always starts at the slot's confirmed
//! position, so the source remembers how many rows it has already handed out
//! since the last acknowledgement and skips them.

use super::source::{ChangeSource, HeartbeatEmitter, SourceRecord};
use crate::config::PostgresConfig;
use crate::event::SourcePosition;
use crate::{CaptureError, Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

const OUTPUT_PLUGIN: &str = "wal2json";

/// A row handed out since the last acknowledgement.
#[derive(Debug, Clone, Copy)]
struct Handed {
    position: SourcePosition,
    /// Commit or non-transactional message: a safe acknowledgement point
    boundary: bool,
}

#[derive(Deserialize)]
struct ActionProbe {
    action: String,
    #[serde(default)]
    transactional: Option<bool>,
}

fn is_boundary(data: &str) -> bool {
    match serde_json::from_str::<ActionProbe>(data) {
        Ok(probe) => probe.action == "C" || (probe.action == "M" && probe.transactional == Some(false)),
        Err(_) => false,
    }
}

fn connection_error(e: sqlx::Error) -> Error {
    CaptureError::Connection(e.to_string()).into()
}

/// Change source backed by a wal2json logical replication slot.
pub struct PgLogicalSource {
    config: PostgresConfig,
    pool: PgPool,
    handed: VecDeque<Handed>,
    /// Rows still to skip because they precede the requested resume position
    skip_through: Option<SourcePosition>,
    confirmed: SourcePosition,
    table_filter: Option<String>,
    opened: bool,
}

impl PgLogicalSource {
    /// Connect to the source database.
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.connection_string())
            .await
            .map_err(connection_error)?;

        info!(
            host = %config.host,
            database = %config.database,
            slot = %config.replication_slot,
            "Connected to source database"
        );

        Ok(Self {
            config,
            pool,
            handed: VecDeque::new(),
            skip_through: None,
            confirmed: SourcePosition::ZERO,
            table_filter: None,
            opened: false,
        })
    }

    /// Heartbeat emitter sharing this source's connection pool.
    pub fn heartbeat_emitter(&self) -> PgHeartbeatEmitter {
        PgHeartbeatEmitter {
            pool: self.pool.clone(),
        }
    }

    async fn slot_confirmed_position(&self) -> Result<Option<SourcePosition>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
        )
        .bind(&self.config.replication_slot)
        .fetch_optional(&self.pool)
        .await
        .map_err(connection_error)?;

        match row {
            None => Ok(None),
            Some((None,)) => Ok(Some(SourcePosition::ZERO)),
            Some((Some(lsn),)) => Ok(Some(lsn.parse()?)),
        }
    }

    async fn ensure_slot(&self) -> Result<SourcePosition> {
        if let Some(position) = self.slot_confirmed_position().await? {
            return Ok(position);
        }

        if !self.config.create_slot {
            return Err(CaptureError::SourceUnavailable {
                position: SourcePosition::ZERO.to_string(),
                reason: format!("replication slot {} does not exist", self.config.replication_slot),
            }
            .into());
        }

        sqlx::query("SELECT pg_create_logical_replication_slot($1, $2)")
            .bind(&self.config.replication_slot)
            .bind(OUTPUT_PLUGIN)
            .execute(&self.pool)
            .await
            .map_err(connection_error)?;
        info!(slot = %self.config.replication_slot, "Created logical replication slot");

        Ok(self.slot_confirmed_position().await?.unwrap_or_default())
    }

    /// Tables of the configured publication, as a wal2json `add-tables` filter.
    async fn load_table_filter(&self) -> Result<Option<String>> {
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT schemaname || '.' || tablename FROM pg_publication_tables WHERE pubname = $1 ORDER BY 1",
        )
        .bind(&self.config.publication)
        .fetch_all(&self.pool)
        .await
        .map_err(connection_error)?;

        if tables.is_empty() {
            warn!(
                publication = %self.config.publication,
                "Publication missing or empty, capturing all tables"
            );
            return Ok(None);
        }
        Ok(Some(
            tables.into_iter().map(|(t,)| t).collect::<Vec<_>>().join(","),
        ))
    }
}

#[async_trait]
impl ChangeSource for PgLogicalSource {
    async fn open(&mut self, after: Option<SourcePosition>) -> Result<()> {
        let confirmed = self.ensure_slot().await?;
        if let Some(after) = after {
            if after < confirmed {
                return Err(CaptureError::SourceUnavailable {
                    position: after.to_string(),
                    reason: format!("slot {} already confirmed {}", self.config.replication_slot, confirmed),
                }
                .into());
            }
            self.skip_through = (after > confirmed).then_some(after);
        } else {
            self.skip_through = None;
        }

        self.table_filter = self.load_table_filter().await?;
        self.confirmed = confirmed;
        self.handed.clear();
        self.opened = true;

        info!(
            slot = %self.config.replication_slot,
            confirmed = %confirmed,
            "Logical decoding stream opened"
        );
        Ok(())
    }

    async fn poll(&mut self, max: usize) -> Result<Vec<SourceRecord>> {
        if !self.opened {
            return Err(CaptureError::NotStarted.into());
        }

        let already = self.handed.len();
        let limit = (already + max).min(i32::MAX as usize) as i32;

        let mut sql = String::from(
            "SELECT lsn::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2, \
             'format-version', '2', 'include-pk', '1', 'include-timestamp', '1', \
             'include-transaction', '1', 'include-types', '1'",
        );
        if self.table_filter.is_some() {
            sql.push_str(", 'add-tables', $3");
        }
        sql.push(')');

        let mut query = sqlx::query_as::<_, (String, String)>(&sql)
            .bind(&self.config.replication_slot)
            .bind(limit);
        if let Some(filter) = &self.table_filter {
            query = query.bind(filter);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(connection_error)?;

        let mut batch = Vec::new();
        for (lsn, data) in rows.into_iter().skip(already) {
            let position: SourcePosition = lsn.parse()?;
            let boundary = is_boundary(&data);
            self.handed.push_back(Handed { position, boundary });

            if let Some(skip) = self.skip_through {
                if boundary && position >= skip {
                    self.skip_through = None;
                }
                continue;
            }
            batch.push(SourceRecord { position, data });
        }

        debug!(records = batch.len(), "Polled logical decoding changes");
        Ok(batch)
    }

    async fn acknowledge(&mut self, position: SourcePosition) -> Result<()> {
        if position <= self.confirmed {
            return Ok(());
        }

        sqlx::query("SELECT pg_replication_slot_advance($1, $2::pg_lsn)")
            .bind(&self.config.replication_slot)
            .bind(position.to_string())
            .execute(&self.pool)
            .await
            .map_err(connection_error)?;

        // Drop handed-out rows covered by the new slot position.
        if let Some(last) = self
            .handed
            .iter()
            .rposition(|h| h.boundary && h.position <= position)
        {
            self.handed.drain(..=last);
        }
        self.confirmed = position;

        debug!(slot = %self.config.replication_slot, position = %position, "Slot advanced");
        Ok(())
    }

    fn confirmed_position(&self) -> SourcePosition {
        self.confirmed
    }
}

/// Emits heartbeats with `pg_logical_emit_message`.
#[derive(Clone)]
pub struct PgHeartbeatEmitter {
    pool: PgPool,
}

#[async_trait]
impl HeartbeatEmitter for PgHeartbeatEmitter {
    async fn emit(&self, prefix: &str, content: &str) -> Result<SourcePosition> {
        let (lsn,): (String,) =
            sqlx::query_as("SELECT pg_logical_emit_message(false, $1, $2)::text")
                .bind(prefix)
                .bind(content)
                .fetch_one(&self.pool)
                .await
                .map_err(connection_error)?;
        lsn.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_detection() {
        assert!(is_boundary(r#"{"action":"C"}"#));
        assert!(is_boundary(r#"{"action":"M","transactional":false,"prefix":"p","content":""}"#));
        assert!(!is_boundary(r#"{"action":"M","transactional":true,"prefix":"p","content":""}"#));
        assert!(!is_boundary(r#"{"action":"I","schema":"public","table":"t"}"#));
        assert!(!is_boundary("garbage"));
    }
}
