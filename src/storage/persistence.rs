//! Journal-backed store: JSON-lines journal plus periodic MessagePack snapshots.

use super::{FleetStore, StoreEntry, StoreTables, batch_failures};
use crate::core::{
    FleetError, OperationChunk, OperationRecord, OperationStatus, OperationUpdate, Result,
    ServerStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const SNAPSHOT_FORMAT_VERSION: u16 = 1;

// ============================================================================
// On-disk records
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    seq: u64,
    ts_unix_ms: i64,
    entry: StoreEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    format_version: u16,
    last_seq: u64,
    tables: StoreTables,
}

// ============================================================================
// Journal Store
// ============================================================================

struct JournalInner {
    tables: StoreTables,
    journal: File,
    /// Bytes of complete journal lines.
    journal_len: u64,
    /// Set when a failed append could not be rolled back.
    torn_tail: bool,
    next_seq: u64,
    since_snapshot: usize,
}

pub struct JournalStore {
    journal_path: PathBuf,
    snapshot_path: PathBuf,
    compact_every: usize,
    inner: Mutex<JournalInner>,
}

impl JournalStore {
    /// Opens (or creates) the journal at `path`, replaying the latest snapshot
    /// and every journal record written after it.
    pub async fn open(path: impl AsRef<Path>, compact_every: usize) -> Result<Self> {
        let journal_path = path.as_ref().to_path_buf();
        let snapshot_path = journal_path.with_extension("snapshot");
        if let Some(parent) = journal_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut tables = StoreTables::default();
        let mut last_seq = 0u64;
        if let Some(snapshot) = read_snapshot(&snapshot_path).await? {
            if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
                return Err(FleetError::Store(format!(
                    "unsupported snapshot format version {}",
                    snapshot.format_version
                )));
            }
            tables = snapshot.tables;
            last_seq = snapshot.last_seq;
        }

        let mut max_seq = last_seq;
        for record in read_journal(&journal_path, last_seq).await? {
            max_seq = max_seq.max(record.seq);
            if let Err(err) = tables.apply(record.entry) {
                warn!(seq = record.seq, error = %err, "skipping journal record during replay");
            }
        }

        let journal_len = repair_torn_tail(&journal_path).await?;
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .await?;

        debug!(
            path = %journal_path.display(),
            operations = tables.operation_count(),
            "journal store opened"
        );

        Ok(Self {
            journal_path,
            snapshot_path,
            compact_every: compact_every.max(1),
            inner: Mutex::new(JournalInner {
                tables,
                journal,
                journal_len,
                torn_tail: false,
                next_seq: max_seq.saturating_add(1),
                since_snapshot: 0,
            }),
        })
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    async fn write(&self, entry: StoreEntry) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.tables.check(&entry)?;

        let record = JournalRecord {
            seq: inner.next_seq,
            ts_unix_ms: Utc::now().timestamp_millis(),
            entry,
        };
        let mut line = Vec::new();
        if inner.torn_tail {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, &record)?;
        line.push(b'\n');
        if let Err(err) = append_line(&mut inner.journal, &line).await {
            let keep = inner.journal_len;
            if let Err(trim_err) = inner.journal.set_len(keep).await {
                warn!(error = %trim_err, "failed to roll back partial journal write");
                inner.torn_tail = true;
            }
            return Err(err);
        }

        if inner.torn_tail {
            inner.torn_tail = false;
            inner.journal_len = match inner.journal.metadata().await {
                Ok(metadata) => metadata.len(),
                Err(_) => inner.journal_len + line.len() as u64,
            };
        } else {
            inner.journal_len += line.len() as u64;
        }
        inner.next_seq += 1;
        inner.since_snapshot += 1;
        inner.tables.apply(record.entry)?;

        if inner.since_snapshot >= self.compact_every {
            if let Err(err) = self.compact(&mut inner).await {
                warn!(error = %err, "journal compaction failed; journal keeps growing");
            }
        }
        Ok(())
    }

    /// Writes a snapshot of every table and truncates the journal.
    pub async fn compact_now(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.compact(&mut inner).await
    }

    async fn compact(&self, inner: &mut JournalInner) -> Result<()> {
        let snapshot = SnapshotFile {
            format_version: SNAPSHOT_FORMAT_VERSION,
            last_seq: inner.next_seq.saturating_sub(1),
            tables: inner.tables.clone(),
        };
        let bytes = rmp_serde::to_vec_named(&snapshot)
            .map_err(|err| FleetError::Serialization(format!("encode snapshot: {}", err)))?;
        atomic_write(&self.snapshot_path, &bytes).await?;

        inner.journal = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.journal_path)
            .await?;
        inner.journal_len = 0;
        inner.torn_tail = false;
        inner.since_snapshot = 0;
        debug!(last_seq = snapshot.last_seq, "journal compacted");
        Ok(())
    }
}

async fn append_line(journal: &mut File, line: &[u8]) -> Result<()> {
    journal.write_all(line).await?;
    journal.flush().await?;
    Ok(())
}

/// Cuts a partial last line left by a crash so new appends start on a fresh
/// line. Returns the journal length afterwards.
async fn repair_torn_tail(path: &Path) -> Result<u64> {
    if !fs::try_exists(path).await? {
        return Ok(0);
    }
    let bytes = fs::read(path).await?;
    if bytes.last().is_none_or(|last| *last == b'\n') {
        return Ok(bytes.len() as u64);
    }

    let keep = bytes
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0) as u64;
    warn!(
        path = %path.display(),
        dropped_bytes = bytes.len() as u64 - keep,
        "truncating torn journal tail"
    );
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep).await?;
    file.sync_all().await?;
    Ok(keep)
}

async fn read_snapshot(path: &Path) -> Result<Option<SnapshotFile>> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }
    let bytes = fs::read(path).await?;
    let snapshot = rmp_serde::from_slice::<SnapshotFile>(&bytes)
        .map_err(|err| FleetError::Serialization(format!("decode snapshot: {}", err)))?;
    Ok(Some(snapshot))
}

async fn read_journal(path: &Path, greater_than_seq: u64) -> Result<Vec<JournalRecord>> {
    if !fs::try_exists(path).await? {
        return Ok(Vec::new());
    }

    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(&line) {
            Ok(record) if record.seq > greater_than_seq => records.push(record),
            Ok(_) => {}
            // A torn final line after a crash is expected; anything else is still skipped.
            Err(err) => warn!(error = %err, "unreadable journal line skipped"),
        }
    }

    records.sort_by(|a, b| a.seq.cmp(&b.seq));
    Ok(records)
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await.map_err(|err| {
        FleetError::Io(format!("failed to write temp file '{}': {}", tmp.display(), err))
    })?;
    fs::rename(&tmp, path).await.map_err(|err| {
        FleetError::Io(format!(
            "failed to rename temp file '{}' -> '{}': {}",
            tmp.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}

#[async_trait]
impl FleetStore for JournalStore {
    async fn upsert_status(&self, status: &ServerStatus) -> Result<()> {
        self.write(StoreEntry::UpsertStatus {
            status: status.clone(),
        })
        .await
    }

    async fn upsert_statuses(&self, batch: &[ServerStatus]) -> Vec<(String, FleetError)> {
        let entry = StoreEntry::UpsertStatuses {
            statuses: batch.to_vec(),
        };
        match self.write(entry).await {
            Ok(()) => Vec::new(),
            Err(err) => batch_failures(batch, err),
        }
    }

    async fn load_statuses(&self) -> Result<Vec<ServerStatus>> {
        Ok(self.inner.lock().await.tables.statuses())
    }

    async fn insert_operation(&self, record: &OperationRecord) -> Result<()> {
        self.write(StoreEntry::InsertOperation {
            record: record.clone(),
        })
        .await
    }

    async fn update_operation_status(&self, id: &str, update: &OperationUpdate) -> Result<()> {
        self.write(StoreEntry::UpdateOperation {
            id: id.to_string(),
            update: update.clone(),
        })
        .await
    }

    async fn insert_chunk(&self, chunk: &OperationChunk) -> Result<()> {
        self.write(StoreEntry::InsertChunk {
            chunk: chunk.clone(),
        })
        .await
    }

    async fn recent_operations(&self, limit: usize) -> Result<Vec<OperationRecord>> {
        Ok(self.inner.lock().await.tables.recent(limit))
    }

    async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>> {
        Ok(self.inner.lock().await.tables.operation(id))
    }

    async fn chunks_for(&self, operation_id: &str) -> Result<Vec<OperationChunk>> {
        Ok(self.inner.lock().await.tables.chunks(operation_id))
    }

    async fn operation_history(&self, id: &str) -> Result<Vec<OperationStatus>> {
        Ok(self.inner.lock().await.tables.history(id))
    }
}
