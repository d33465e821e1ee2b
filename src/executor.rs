//! Operation executor: bounded retry with exponential backoff, optional
//! sequential chunking, and a persisted lifecycle for every execution.

use crate::collaborators::Invoker;
use crate::core::{
    ChunkStatus, FleetError, OperationChunk, OperationRecord, OperationStatus, OperationUpdate,
    Result, Target,
};
use crate::registry::FleetRegistry;
use crate::storage::FleetStore;
use crate::strategy::ChunkPlan;
use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

// ============================================================================
// Operation log
// ============================================================================

/// Bounded in-memory copy of the newest operation records.
///
/// Kept current on every transition, so it stays correct when the store is
/// unavailable.
pub struct OperationLog {
    capacity: usize,
    entries: Mutex<VecDeque<OperationRecord>>,
}

impl OperationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn upsert(&self, record: &OperationRecord) {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.iter_mut().find(|r| r.id == record.id) {
            *existing = record.clone();
            return;
        }
        entries.push_back(record.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> Vec<OperationRecord> {
        self.entries
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<OperationRecord> {
        self.entries.lock().await.iter().find(|r| r.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct OperationExecutor {
    registry: Arc<FleetRegistry>,
    invoker: Arc<dyn Invoker>,
    store: Arc<dyn FleetStore>,
    log: OperationLog,
    chunk_pause: Duration,
}

impl OperationExecutor {
    pub fn new(
        registry: Arc<FleetRegistry>,
        invoker: Arc<dyn Invoker>,
        store: Arc<dyn FleetStore>,
        recent_capacity: usize,
        chunk_pause: Duration,
    ) -> Self {
        Self {
            registry,
            invoker,
            store,
            log: OperationLog::new(recent_capacity),
            chunk_pause,
        }
    }

    /// Runs `operation` on `target_name` until it succeeds or the target's
    /// attempt budget is spent.
    ///
    /// Fails with `UnknownTarget` or `InvalidPayload` before any record is
    /// created, `Exhausted`
    /// after the last attempt, or `TargetRemoved` when the target left the
    /// registry between attempts.
    pub async fn execute(&self, target_name: &str, operation: &str, payload: Value) -> Result<Value> {
        let target = self
            .registry
            .target(target_name)
            .await
            .ok_or_else(|| FleetError::UnknownTarget(target_name.to_string()))?;
        let plan = target.plan_for(operation).cloned();
        if let Some(plan) = &plan {
            plan.split.split(&payload)?;
        }
        let max_attempts = target.retry.max_attempts;

        let mut record =
            OperationRecord::new(&target.name, operation, payload.clone(), max_attempts);
        record.chunked = plan.is_some();
        self.log.upsert(&record).await;
        if let Err(err) = self.store.insert_operation(&record).await {
            warn!(operation_id = %record.id, error = %err, "failed to persist operation record");
        }
        debug!(
            operation_id = %record.id,
            target_name = %target.name,
            operation,
            chunked = record.chunked,
            "operation created"
        );

        let mut attempt = 1;
        loop {
            if attempt > 1 && !self.registry.is_current(&target.name, target.epoch).await {
                warn!(
                    operation_id = %record.id,
                    target_name = %target.name,
                    "target removed during retry, abandoning operation"
                );
                self.transition(&mut record, OperationStatus::Failed, None, Some("target removed".to_string()))
                    .await;
                return Err(FleetError::TargetRemoved(target.name.clone()));
            }

            record.attempt = attempt;
            self.transition(&mut record, OperationStatus::InProgress, None, None)
                .await;

            let outcome = match &plan {
                Some(plan) => self.run_chunked(&target, operation, &payload, plan, &record.id, attempt).await,
                None => self.attempt_once(&target, operation, &payload).await,
            };

            match outcome {
                Ok(value) => {
                    self.transition(&mut record, OperationStatus::Completed, Some(value.clone()), None)
                        .await;
                    info!(
                        operation_id = %record.id,
                        target_name = %target.name,
                        operation,
                        attempt,
                        "operation completed"
                    );
                    return Ok(value);
                }
                Err(err) => {
                    let message = failure_message(&err);
                    if attempt >= max_attempts {
                        self.transition(&mut record, OperationStatus::Failed, None, Some(message.clone()))
                            .await;
                        warn!(
                            operation_id = %record.id,
                            target_name = %target.name,
                            operation,
                            attempts = attempt,
                            error = %message,
                            "operation exhausted its attempts"
                        );
                        return Err(FleetError::Exhausted {
                            target: target.name.clone(),
                            operation: operation.to_string(),
                            attempts: attempt,
                            last_error: message,
                        });
                    }

                    let delay = target.retry.delay_after(attempt);
                    self.transition(&mut record, OperationStatus::Retrying, None, Some(message.clone()))
                        .await;
                    warn!(
                        operation_id = %record.id,
                        target_name = %target.name,
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "attempt failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt_once(&self, target: &Target, operation: &str, payload: &Value) -> Result<Value> {
        match timeout(target.attempt_timeout, self.invoker.invoke(target, operation, payload)).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::AttemptFailure(format!(
                "attempt timed out after {}ms",
                target.attempt_timeout.as_millis()
            ))),
        }
    }

    /// One attempt of a chunked operation: every chunk in order, then merge.
    async fn run_chunked(
        &self,
        target: &Target,
        operation: &str,
        payload: &Value,
        plan: &ChunkPlan,
        operation_id: &str,
        attempt: u32,
    ) -> Result<Value> {
        let pieces = plan.split.split(payload)?;
        let total = pieces.len();
        let mut results: Vec<Option<Value>> = Vec::with_capacity(total);
        let mut failed = 0;

        for (index, piece) in pieces.enumerate() {
            if index > 0 && !self.chunk_pause.is_zero() {
                sleep(self.chunk_pause).await;
            }

            let mut chunk = OperationChunk::new(operation_id, attempt, index, piece);
            let outcome = self.attempt_once(target, operation, &chunk.payload).await;
            match outcome {
                Ok(value) => {
                    chunk.status = ChunkStatus::Completed;
                    chunk.result = Some(value.clone());
                    self.persist_chunk(&chunk).await;
                    results.push(Some(value));
                }
                Err(err) => {
                    let message = failure_message(&err);
                    chunk.status = ChunkStatus::Failed;
                    chunk.error = Some(message.clone());
                    self.persist_chunk(&chunk).await;

                    if index == 0 || plan.failure.aborts_on_failure() {
                        return Err(FleetError::ChunkFailure { index, error: message });
                    }
                    debug!(
                        operation_id,
                        chunk_index = index,
                        error = %message,
                        "chunk failed, merging as null"
                    );
                    failed += 1;
                    results.push(None);
                }
            }
        }

        plan.failure.check(total, failed)?;
        plan.merge.merge(&results)
    }

    async fn persist_chunk(&self, chunk: &OperationChunk) {
        if let Err(err) = self.store.insert_chunk(chunk).await {
            warn!(chunk_id = %chunk.id, error = %err, "failed to persist operation chunk");
        }
    }

    /// Moves `record` to `status`. The in-memory record and log are updated
    /// first; the store write is best-effort.
    async fn transition(
        &self,
        record: &mut OperationRecord,
        status: OperationStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        debug_assert!(
            record.status.can_transition_to(status),
            "invalid transition {} -> {}",
            record.status,
            status
        );
        let update = OperationUpdate {
            status,
            attempt: record.attempt,
            result,
            error,
            updated_at: Utc::now(),
        };
        record.apply(&update);
        self.log.upsert(record).await;
        if let Err(err) = self.store.update_operation_status(&record.id, &update).await {
            warn!(
                operation_id = %record.id,
                status = status.as_str(),
                error = %err,
                "failed to persist operation transition"
            );
        }
    }

    /// Newest first. Reads the store and falls back to the in-memory log when
    /// the store is unavailable.
    pub async fn recent_operations(&self, limit: usize) -> Vec<OperationRecord> {
        match self.store.recent_operations(limit).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "store unavailable, serving recent operations from memory");
                self.log.recent(limit).await
            }
        }
    }

    pub async fn operation(&self, id: &str) -> Option<OperationRecord> {
        match self.store.get_operation(id).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => self.log.get(id).await,
            Err(err) => {
                warn!(operation_id = id, error = %err, "store unavailable, reading operation from memory");
                self.log.get(id).await
            }
        }
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }
}

/// Error text recorded on the operation, without the variant prefix for
/// plain attempt failures.
fn failure_message(err: &FleetError) -> String {
    match err {
        FleetError::AttemptFailure(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_evicts_oldest_and_replaces_by_id() {
        let log = OperationLog::new(2);
        let first = OperationRecord::new("db", "a", json!({}), 3);
        let mut second = OperationRecord::new("db", "b", json!({}), 3);
        let third = OperationRecord::new("db", "c", json!({}), 3);

        log.upsert(&first).await;
        log.upsert(&second).await;
        second.status = OperationStatus::InProgress;
        log.upsert(&second).await;
        assert_eq!(log.len().await, 2);
        assert_eq!(log.get(&second.id).await.unwrap().status, OperationStatus::InProgress);

        log.upsert(&third).await;
        let recent: Vec<String> = log.recent(10).await.into_iter().map(|r| r.operation).collect();
        assert_eq!(recent, vec!["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_failure_message_strips_attempt_prefix() {
        assert_eq!(failure_message(&FleetError::AttemptFailure("timeout".into())), "timeout");
        assert_eq!(
            failure_message(&FleetError::ChunkFailure { index: 0, error: "x".into() }),
            "Chunk 0 failed: x"
        );
    }
}
