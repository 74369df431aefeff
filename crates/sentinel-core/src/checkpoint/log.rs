//! Append-only checkpoint log for one partition.

use super::entries::{CheckpointEntry, CommitKind};
use crate::config::CheckpointConfig;
use crate::event::SourcePosition;
use crate::{CheckpointError, Error, Result};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const FILE_PREFIX: &str = "checkpoint-";
const FILE_EXTENSION: &str = "jsonl";

fn write_failed(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Checkpoint(CheckpointError::WriteFailed(format!("{}: {}", context, e)))
}

fn file_name(sequence: u64) -> String {
    format!("{}{:020}.{}", FILE_PREFIX, sequence, FILE_EXTENSION)
}

/// Sequence number of a log file, or `None` for unrelated files.
fn file_sequence(path: &Path) -> Option<u64> {
    if path.extension().map_or(true, |ext| ext != FILE_EXTENSION) {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(FILE_PREFIX)?
        .parse()
        .ok()
}

/// Log files in `dir`, oldest first.
fn list_log_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files: Vec<(u64, PathBuf)> = fs::read_dir(dir)
        .map_err(|e| {
            Error::Checkpoint(CheckpointError::RecoveryFailed(format!(
                "Failed to read checkpoint directory {}: {}",
                dir.display(),
                e
            )))
        })?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            file_sequence(&path).map(|seq| (seq, path))
        })
        .collect();

    // Names carry a monotonic sequence; mtime is not reliable enough.
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

/// Append-only offset log owned by a single partition worker.
pub struct CheckpointLog {
    partition: i32,
    dir: PathBuf,
    config: CheckpointConfig,
    current_file: BufWriter<File>,
    current_path: PathBuf,
    sequence: u64,
    entries_since_checkpoint: u64,
    last_checkpoint_time: Instant,
    committed_offset: Option<i64>,
}

impl CheckpointLog {
    /// Open the log for `partition` under `config.dir`, starting a new file.
    ///
    /// Existing files are kept; [`read_all_entries`](Self::read_all_entries)
    /// and [`RecoveryState`](super::RecoveryState) read them back.
    pub fn open(config: &CheckpointConfig, partition: i32) -> Result<Self> {
        let dir = config.partition_dir(partition);
        fs::create_dir_all(&dir)
            .map_err(|e| write_failed("Failed to create checkpoint directory", e))?;

        let existing = list_log_files(&dir)?;
        let sequence = existing.last().map(|(seq, _)| seq + 1).unwrap_or(0);
        let committed_offset = Self::committed_offset_in(&Self::read_entries_in(&dir)?);

        let current_path = dir.join(file_name(sequence));
        let file = Self::create_file(&current_path)?;

        info!(
            partition = partition,
            path = %current_path.display(),
            committed_offset = ?committed_offset,
            "Checkpoint log opened"
        );

        Ok(Self {
            partition,
            dir,
            config: config.clone(),
            current_file: BufWriter::new(file),
            current_path,
            sequence,
            entries_since_checkpoint: 0,
            last_checkpoint_time: Instant::now(),
            committed_offset,
        })
    }

    fn create_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| write_failed("Failed to open checkpoint file", e))
    }

    fn committed_offset_in(entries: &[CheckpointEntry]) -> Option<i64> {
        entries.iter().filter_map(|e| e.committed_offset()).max()
    }

    /// Record that the event at `offset` is done. Durable on return.
    pub fn commit(
        &mut self,
        offset: i64,
        source_position: Option<SourcePosition>,
        kind: CommitKind,
    ) -> Result<()> {
        self.append(CheckpointEntry::OffsetCommitted {
            partition: self.partition,
            offset,
            source_position,
            kind,
            timestamp: Utc::now(),
        })
    }

    /// Record an unrecoverable partition failure.
    pub fn record_failure(&mut self, offset: Option<i64>, reason: &str) -> Result<()> {
        self.append(CheckpointEntry::PartitionFailed {
            partition: self.partition,
            offset,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Append an entry and fsync it.
    pub fn append(&mut self, entry: CheckpointEntry) -> Result<()> {
        if let Some(offset) = entry.committed_offset() {
            self.committed_offset = Some(self.committed_offset.map_or(offset, |o| o.max(offset)));
        }
        self.write_entry(&entry)?;
        self.entries_since_checkpoint += 1;

        let should_checkpoint = self.entries_since_checkpoint
            >= self.config.snapshot_interval_entries as u64
            || self.last_checkpoint_time.elapsed().as_secs() >= self.config.snapshot_interval_seconds;
        if should_checkpoint {
            self.create_checkpoint()?;
        }
        Ok(())
    }

    fn write_entry(&mut self, entry: &CheckpointEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        writeln!(self.current_file, "{}", json)
            .map_err(|e| write_failed("Failed to write entry", e))?;
        self.current_file
            .flush()
            .map_err(|e| write_failed("Failed to flush entry", e))?;
        self.current_file
            .get_ref()
            .sync_data()
            .map_err(|e| write_failed("Failed to fsync entry", e))?;
        Ok(())
    }

    /// Rotate to a new file that opens with a checkpoint entry, then drop
    /// the oldest files beyond `max_log_files`.
    fn create_checkpoint(&mut self) -> Result<()> {
        let checkpoint_id = Uuid::new_v4().to_string();
        let entries = self.entries_since_checkpoint;

        self.rotate_log_file()?;
        self.write_entry(&CheckpointEntry::Checkpoint {
            checkpoint_id: checkpoint_id.clone(),
            partition: self.partition,
            committed_offset: self.committed_offset,
            entries_since_last: entries,
            timestamp: Utc::now(),
        })?;

        self.entries_since_checkpoint = 0;
        self.last_checkpoint_time = Instant::now();
        self.cleanup_old_files()?;

        info!(
            partition = self.partition,
            checkpoint_id = %checkpoint_id,
            entries = entries,
            committed_offset = ?self.committed_offset,
            "Checkpoint created"
        );
        Ok(())
    }

    fn rotate_log_file(&mut self) -> Result<()> {
        self.current_file
            .flush()
            .map_err(|e| write_failed("Failed to flush before rotation", e))?;
        self.current_file
            .get_ref()
            .sync_all()
            .map_err(|e| write_failed("Failed to fsync before rotation", e))?;

        let sequence = self.sequence + 1;
        let new_path = self.dir.join(file_name(sequence));
        let new_file = Self::create_file(&new_path)?;

        let old_path = std::mem::replace(&mut self.current_path, new_path);
        self.current_file = BufWriter::new(new_file);
        self.sequence = sequence;

        debug!(
            partition = self.partition,
            old_path = %old_path.display(),
            "Checkpoint log rotated to new file"
        );
        Ok(())
    }

    fn cleanup_old_files(&self) -> Result<()> {
        let files = list_log_files(&self.dir)?;
        let excess = files.len().saturating_sub(self.config.max_log_files.max(1));

        for (_, path) in files.into_iter().take(excess) {
            if path == self.current_path {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed old checkpoint file"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove old checkpoint file"),
            }
        }
        Ok(())
    }

    /// Read every entry of this partition's log, oldest first.
    pub fn read_all_entries(&self) -> Result<Vec<CheckpointEntry>> {
        Self::read_entries_in(&self.dir)
    }

    /// Read every entry from a partition directory without opening it for
    /// writing.
    ///
    /// A torn final line (crash mid-append) is skipped. Every run starts a new
    /// file, so only the last line of a file can be torn; damage anywhere else
    /// is reported as corruption.
    pub fn read_entries_in(dir: &Path) -> Result<Vec<CheckpointEntry>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();

        for (_, path) in list_log_files(dir)? {
            let file = File::open(&path).map_err(|e| {
                Error::Checkpoint(CheckpointError::RecoveryFailed(format!(
                    "Failed to open {}: {}",
                    path.display(),
                    e
                )))
            })?;
            let lines: Vec<String> = BufReader::new(file)
                .lines()
                .collect::<std::io::Result<_>>()
                .map_err(|e| {
                    Error::Checkpoint(CheckpointError::Corrupted {
                        position: 0,
                        message: format!("{}: {}", path.display(), e),
                    })
                })?;
            let last_line = lines.len().saturating_sub(1);

            for (line_num, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CheckpointEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) if line_num == last_line => {
                        warn!(
                            path = %path.display(),
                            line = line_num,
                            error = %e,
                            "Skipping torn final checkpoint entry"
                        );
                    }
                    Err(e) => {
                        return Err(Error::Checkpoint(CheckpointError::Corrupted {
                            position: line_num as u64,
                            message: format!("{}: JSON parse error: {}", path.display(), e),
                        }))
                    }
                }
            }
        }

        debug!(dir = %dir.display(), entries = entries.len(), "Read checkpoint entries");
        Ok(entries)
    }

    /// Highest committed offset, including entries from earlier runs.
    pub fn committed_offset(&self) -> Option<i64> {
        self.committed_offset
    }

    /// Partition this log belongs to.
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Get the path to the current log file.
    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    /// Directory holding this partition's files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get the number of entries since last checkpoint.
    pub fn entries_since_checkpoint(&self) -> u64 {
        self.entries_since_checkpoint
    }

    /// Force a checkpoint immediately.
    ///
    /// Used during graceful shutdown.
    pub fn force_checkpoint(&mut self) -> Result<()> {
        if self.entries_since_checkpoint == 0 {
            debug!(partition = self.partition, "No entries to checkpoint, skipping");
            return Ok(());
        }
        info!(
            partition = self.partition,
            entries = self.entries_since_checkpoint,
            "Forcing checkpoint for graceful shutdown"
        );
        self.create_checkpoint()
    }

    /// Sync all pending writes to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.current_file
            .flush()
            .map_err(|e| write_failed("Failed to flush", e))?;
        self.current_file
            .get_ref()
            .sync_all()
            .map_err(|e| write_failed("Failed to sync", e))?;
        Ok(())
    }
}
