//! JSONL dead-letter file.

use super::record::{DeadLetterEntry, DeadLetterRecord};
use crate::event::PartitionOffset;
use crate::{DeadLetterError, Error, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

fn write_failed(context: &str, e: impl std::fmt::Display) -> Error {
    DeadLetterError::WriteFailed(format!("{}: {}", context, e)).into()
}

/// Append-only dead-letter file.
pub struct DeadLetterStore {
    path: PathBuf,
    file: Option<File>,
}

impl DeadLetterStore {
    /// Store at `path`. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| write_failed("Failed to create directory", e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| write_failed("Failed to open dead-letter file", e))?;
            self.drop_torn_tail(&file)?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| DeadLetterError::WriteFailed("dead-letter file not open".into()).into())
    }

    /// Cut a partial final line left by a crash mid-append.
    fn drop_torn_tail(&self, file: &File) -> Result<()> {
        let data = fs::read(&self.path)?;
        if data.is_empty() || data.ends_with(b"\n") {
            return Ok(());
        }
        let keep = data.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        warn!(
            path = %self.path.display(),
            dropped_bytes = data.len() - keep,
            "Truncating torn dead-letter entry"
        );
        file.set_len(keep as u64)
            .map_err(|e| write_failed("Failed to truncate torn entry", e))?;
        Ok(())
    }

    /// Append one entry and fsync it.
    pub fn append(&mut self, entry: &DeadLetterEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let file = self.file()?;
        file.write_all(&line)
            .map_err(|e| write_failed("Failed to write entry", e))?;
        file.sync_data()
            .map_err(|e| write_failed("Failed to sync entry", e))?;
        Ok(())
    }

    /// Every entry in file order. A torn final line is skipped.
    pub fn read_entries(&self) -> Result<Vec<DeadLetterEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;
        let last = lines.len().saturating_sub(1);
        let mut entries = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if index == last => {
                    warn!(path = %self.path.display(), error = %e, "Skipping torn final dead-letter line");
                }
                Err(e) => {
                    return Err(DeadLetterError::Corrupted {
                        line: index as u64 + 1,
                        message: e.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(entries)
    }

    /// Every record, oldest first.
    pub fn list(&self) -> Result<Vec<DeadLetterRecord>> {
        Ok(self
            .read_entries()?
            .into_iter()
            .filter_map(|e| match e {
                DeadLetterEntry::Record(record) => Some(record),
                DeadLetterEntry::Requeued { .. } => None,
            })
            .collect())
    }

    /// Records not yet requeued.
    pub fn pending(&self) -> Result<Vec<DeadLetterRecord>> {
        let entries = self.read_entries()?;
        let requeued: HashSet<Uuid> = entries
            .iter()
            .filter_map(|e| match e {
                DeadLetterEntry::Requeued { id, .. } => Some(*id),
                DeadLetterEntry::Record(_) => None,
            })
            .collect();

        Ok(entries
            .into_iter()
            .filter_map(|e| match e {
                DeadLetterEntry::Record(record) if !requeued.contains(&record.id) => Some(record),
                _ => None,
            })
            .collect())
    }

    /// Look up a pending record.
    pub fn find_pending(&self, id: Uuid) -> Result<DeadLetterRecord> {
        if let Some(record) = self.pending()?.into_iter().find(|r| r.id == id) {
            return Ok(record);
        }
        if self.list()?.iter().any(|r| r.id == id) {
            return Err(DeadLetterError::NotRequeueable {
                id: id.to_string(),
                reason: "already requeued".into(),
            }
            .into());
        }
        Err(DeadLetterError::NotFound(id.to_string()).into())
    }

    /// Append a marker so the record no longer lists as pending.
    pub fn mark_requeued(&mut self, id: Uuid, republished_at: PartitionOffset) -> Result<()> {
        self.append(&DeadLetterEntry::Requeued {
            id,
            republished_at,
            timestamp: Utc::now(),
        })?;
        debug!(id = %id, at = %republished_at, "Dead-letter record requeued");
        Ok(())
    }
}
