//! Persistence for server-status snapshots and the operation audit trail.
//!
//! Writes are best-effort from the point of view of the watcher: callers log
//! store failures and keep their in-memory state authoritative.

pub mod memory;
pub mod persistence;

pub use memory::MemoryStore;
pub use persistence::JournalStore;

use crate::core::{
    FleetError, OperationChunk, OperationRecord, OperationStatus, OperationUpdate, Result,
    ServerStatus,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Store capability used by the monitor and the executor.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn upsert_status(&self, status: &ServerStatus) -> Result<()>;

    /// Writes a batch of statuses, returning the names that could not be written.
    ///
    /// Stores that can write the whole batch as one entry override this.
    async fn upsert_statuses(&self, batch: &[ServerStatus]) -> Vec<(String, FleetError)> {
        let mut failures = Vec::new();
        for status in batch {
            if let Err(err) = self.upsert_status(status).await {
                failures.push((status.name.clone(), err));
            }
        }
        failures
    }

    async fn load_statuses(&self) -> Result<Vec<ServerStatus>>;

    async fn insert_operation(&self, record: &OperationRecord) -> Result<()>;

    async fn update_operation_status(&self, id: &str, update: &OperationUpdate) -> Result<()>;

    async fn insert_chunk(&self, chunk: &OperationChunk) -> Result<()>;

    /// Most recently created operations first.
    async fn recent_operations(&self, limit: usize) -> Result<Vec<OperationRecord>>;

    async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>>;

    async fn chunks_for(&self, operation_id: &str) -> Result<Vec<OperationChunk>>;

    /// Every status the operation has been written with, oldest first.
    async fn operation_history(&self, id: &str) -> Result<Vec<OperationStatus>>;
}

/// Every name in `batch`, paired with the error that rejected the batch.
pub(crate) fn batch_failures(
    batch: &[ServerStatus],
    err: FleetError,
) -> Vec<(String, FleetError)> {
    batch
        .iter()
        .map(|status| (status.name.clone(), err.clone()))
        .collect()
}

// ============================================================================
// Store Entries
// ============================================================================

/// A single mutation, as journaled on disk and applied in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreEntry {
    UpsertStatus { status: ServerStatus },
    UpsertStatuses { statuses: Vec<ServerStatus> },
    InsertOperation { record: OperationRecord },
    UpdateOperation { id: String, update: OperationUpdate },
    InsertChunk { chunk: OperationChunk },
}

/// In-memory tables shared by both store implementations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreTables {
    statuses: BTreeMap<String, ServerStatus>,
    operations: HashMap<String, OperationRecord>,
    /// Operation ids in insertion order.
    order: Vec<String>,
    chunks: HashMap<String, Vec<OperationChunk>>,
    history: HashMap<String, Vec<OperationStatus>>,
}

impl StoreTables {
    /// Checks that `entry` can be applied without mutating anything.
    pub fn check(&self, entry: &StoreEntry) -> Result<()> {
        match entry {
            StoreEntry::UpsertStatus { .. } | StoreEntry::UpsertStatuses { .. } => Ok(()),
            StoreEntry::InsertOperation { record } => {
                if self.operations.contains_key(&record.id) {
                    return Err(FleetError::Store(format!(
                        "operation '{}' already exists",
                        record.id
                    )));
                }
                Ok(())
            }
            StoreEntry::UpdateOperation { id, update } => {
                let current = self
                    .operations
                    .get(id)
                    .ok_or_else(|| FleetError::Store(format!("operation '{}' not found", id)))?;
                if current.status.is_terminal() {
                    return Err(FleetError::Store(format!(
                        "operation '{}' is already {}",
                        id, current.status
                    )));
                }
                if update.attempt < current.attempt {
                    return Err(FleetError::Store(format!(
                        "operation '{}': attempt went backwards ({} -> {})",
                        id, current.attempt, update.attempt
                    )));
                }
                Ok(())
            }
            StoreEntry::InsertChunk { chunk } => {
                if !self.operations.contains_key(&chunk.operation_id) {
                    return Err(FleetError::Store(format!(
                        "chunk '{}' references unknown operation '{}'",
                        chunk.id, chunk.operation_id
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn apply(&mut self, entry: StoreEntry) -> Result<()> {
        self.check(&entry)?;
        match entry {
            StoreEntry::UpsertStatus { status } => {
                self.statuses.insert(status.name.clone(), status);
            }
            StoreEntry::UpsertStatuses { statuses } => {
                for status in statuses {
                    self.statuses.insert(status.name.clone(), status);
                }
            }
            StoreEntry::InsertOperation { record } => {
                self.history.insert(record.id.clone(), vec![record.status]);
                self.order.push(record.id.clone());
                self.operations.insert(record.id.clone(), record);
            }
            StoreEntry::UpdateOperation { id, update } => {
                if let Some(record) = self.operations.get_mut(&id) {
                    record.apply(&update);
                }
                self.history.entry(id).or_default().push(update.status);
            }
            StoreEntry::InsertChunk { chunk } => {
                self.chunks
                    .entry(chunk.operation_id.clone())
                    .or_default()
                    .push(chunk);
            }
        }
        Ok(())
    }

    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.statuses.values().cloned().collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<OperationRecord> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.operations.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn operation(&self, id: &str) -> Option<OperationRecord> {
        self.operations.get(id).cloned()
    }

    pub fn chunks(&self, operation_id: &str) -> Vec<OperationChunk> {
        let mut chunks = self.chunks.get(operation_id).cloned().unwrap_or_default();
        chunks.sort_by(|a, b| (a.attempt, a.chunk_index).cmp(&(b.attempt, b.chunk_index)));
        chunks
    }

    pub fn history(&self, id: &str) -> Vec<OperationStatus> {
        self.history.get(id).cloned().unwrap_or_default()
    }

    pub fn operation_count(&self) -> usize {
        self.order.len()
    }
}
