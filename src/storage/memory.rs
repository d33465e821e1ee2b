use super::{FleetStore, StoreEntry, StoreTables, batch_failures};
use crate::core::{
    FleetError, OperationChunk, OperationRecord, OperationStatus, OperationUpdate, Result, ServerStatus,
};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Process-local store. Writes are serialized behind one lock, so two
/// writers can never race on the terminal state of the same operation.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<StoreTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn write(&self, entry: StoreEntry) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.apply(entry)
    }

    pub async fn operation_count(&self) -> usize {
        self.tables.read().await.operation_count()
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
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
        Ok(self.tables.read().await.statuses())
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
        Ok(self.tables.read().await.recent(limit))
    }

    async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>> {
        Ok(self.tables.read().await.operation(id))
    }

    async fn chunks_for(&self, operation_id: &str) -> Result<Vec<OperationChunk>> {
        Ok(self.tables.read().await.chunks(operation_id))
    }

    async fn operation_history(&self, id: &str) -> Result<Vec<OperationStatus>> {
        Ok(self.tables.read().await.history(id))
    }
}
