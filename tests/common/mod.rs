#![allow(dead_code)]

use async_trait::async_trait;
use fleetwatch::{
    FleetError, FleetStore, Invoker, LivenessProbe, OperationChunk, OperationRecord,
    OperationStatus, OperationUpdate, Result, ServerStatus, Target,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};

// ============================================================================
// Probe
// ============================================================================

#[derive(Debug, Clone)]
pub enum ProbeStep {
    Alive(Duration),
    Fail(&'static str),
    Hang(Duration),
}

/// Probe with per-target queued outcomes. Targets with an empty queue answer
/// `Alive` immediately.
#[derive(Default)]
pub struct ScriptedProbe {
    scripts: Mutex<HashMap<String, VecDeque<ProbeStep>>>,
    fallback: Mutex<HashMap<String, ProbeStep>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, target: &str, step: ProbeStep) {
        self.scripts
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .push_back(step);
    }

    /// Outcome used once the target's queue is empty.
    pub fn always(&self, target: &str, step: ProbeStep) {
        self.fallback
            .lock()
            .unwrap()
            .insert(target.to_string(), step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, target: &str) -> ProbeStep {
        if let Some(step) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(target)
            .and_then(VecDeque::pop_front)
        {
            return step;
        }
        self.fallback
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or(ProbeStep::Alive(Duration::ZERO))
    }
}

#[async_trait]
impl LivenessProbe for ScriptedProbe {
    async fn probe(&self, target: &Target) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step(&target.name);

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let outcome = match step {
            ProbeStep::Alive(delay) => {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                Ok(())
            }
            ProbeStep::Fail(message) => Err(FleetError::AttemptFailure(message.to_string())),
            ProbeStep::Hang(delay) => {
                sleep(delay).await;
                Ok(())
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

// ============================================================================
// Invoker
// ============================================================================

#[derive(Debug, Clone)]
pub struct InvokeCall {
    pub target: String,
    pub operation: String,
    pub payload: Value,
    pub at: Instant,
}

/// Invoker replaying queued replies per operation name. An empty queue fails.
#[derive(Default)]
pub struct ScriptedInvoker {
    replies: Mutex<HashMap<String, VecDeque<std::result::Result<Value, String>>>>,
    responder: Mutex<Option<Box<dyn Fn(&Value) -> std::result::Result<Value, String> + Send>>>,
    calls: Mutex<Vec<InvokeCall>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&self, operation: &str, value: Value) {
        self.push(operation, Ok(value));
    }

    pub fn fail(&self, operation: &str, message: &str) {
        self.push(operation, Err(message.to_string()));
    }

    pub fn fail_times(&self, operation: &str, times: usize, message: &str) {
        for _ in 0..times {
            self.fail(operation, message);
        }
    }

    /// Computes replies from the payload once the queue is empty.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Value) -> std::result::Result<Value, String> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    fn push(&self, operation: &str, reply: std::result::Result<Value, String>) {
        self.replies
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<InvokeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(&self, target: &Target, operation: &str, payload: &Value) -> Result<Value> {
        self.calls.lock().unwrap().push(InvokeCall {
            target: target.name.clone(),
            operation: operation.to_string(),
            payload: payload.clone(),
            at: Instant::now(),
        });

        let queued = self
            .replies
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        let reply = match queued {
            Some(reply) => reply,
            None => match self.responder.lock().unwrap().as_ref() {
                Some(responder) => responder(payload),
                None => Err(format!("no scripted reply for {}", operation)),
            },
        };
        reply.map_err(FleetError::AttemptFailure)
    }
}

// ============================================================================
// Store
// ============================================================================

/// Store whose every call fails, as during a persistence outage.
#[derive(Default)]
pub struct FailingStore {
    writes: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempted_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn outage<T>(&self) -> Result<T> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(FleetError::Store("store offline".to_string()))
    }
}

#[async_trait]
impl FleetStore for FailingStore {
    async fn upsert_status(&self, _status: &ServerStatus) -> Result<()> {
        self.outage()
    }

    async fn load_statuses(&self) -> Result<Vec<ServerStatus>> {
        Err(FleetError::Store("store offline".to_string()))
    }

    async fn insert_operation(&self, _record: &OperationRecord) -> Result<()> {
        self.outage()
    }

    async fn update_operation_status(&self, _id: &str, _update: &OperationUpdate) -> Result<()> {
        self.outage()
    }

    async fn insert_chunk(&self, _chunk: &OperationChunk) -> Result<()> {
        self.outage()
    }

    async fn recent_operations(&self, _limit: usize) -> Result<Vec<OperationRecord>> {
        Err(FleetError::Store("store offline".to_string()))
    }

    async fn get_operation(&self, _id: &str) -> Result<Option<OperationRecord>> {
        Err(FleetError::Store("store offline".to_string()))
    }

    async fn chunks_for(&self, _operation_id: &str) -> Result<Vec<OperationChunk>> {
        Err(FleetError::Store("store offline".to_string()))
    }

    async fn operation_history(&self, _id: &str) -> Result<Vec<OperationStatus>> {
        Err(FleetError::Store("store offline".to_string()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// True when `history` walks `pending -> in_progress -> (retrying -> in_progress)* -> terminal`,
/// allowing `retrying -> failed` for removed targets.
pub fn is_valid_lifecycle(history: &[OperationStatus]) -> bool {
    if history.first() != Some(&OperationStatus::Pending) {
        return false;
    }
    if !history.last().map(OperationStatus::is_terminal).unwrap_or(false) {
        return false;
    }
    history
        .windows(2)
        .all(|pair| pair[0].can_transition_to(pair[1]))
}
