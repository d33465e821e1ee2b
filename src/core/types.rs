use crate::strategy::ChunkPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Targets
// ============================================================================

/// How a target is reached. The core hands this to the probe and invoker
/// collaborators without looking inside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationDescriptor {
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_header: Option<String>,
    },
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        work_dir: Option<String>,
    },
}

impl fmt::Display for InvocationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { url, .. } => write!(f, "{}", url),
            Self::Process { command, args, .. } => {
                write!(f, "{}", command)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
        }
    }
}

/// Per-target retry and backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Sleep taken after `failed_attempt` (1-based) fails:
    /// `min(base * multiplier^(failed_attempt - 1), max_delay)`.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let raw = base_ms * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// A monitored endpoint as held by the registry.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub descriptor: InvocationDescriptor,
    pub health_check_interval: Duration,
    pub timeout_threshold: Duration,
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
    pub critical_operations: HashSet<String>,
    /// Chunking plans for critical operations, resolved at registration.
    pub plans: HashMap<String, ChunkPlan>,
    /// Registration generation. A target re-added under the same name gets a
    /// new epoch so stale probe results and retries can be told apart.
    pub epoch: u64,
}

impl Target {
    pub fn is_critical(&self, operation: &str) -> bool {
        self.critical_operations.contains(operation)
    }

    pub fn plan_for(&self, operation: &str) -> Option<&ChunkPlan> {
        if !self.is_critical(operation) {
            return None;
        }
        self.plans.get(operation)
    }

    /// Compares everything except the registration epoch.
    pub fn same_definition(&self, other: &Target) -> bool {
        self.name == other.name
            && self.descriptor == other.descriptor
            && self.health_check_interval == other.health_check_interval
            && self.timeout_threshold == other.timeout_threshold
            && self.attempt_timeout == other.attempt_timeout
            && self.retry == other.retry
            && self.critical_operations == other.critical_operations
            && self.plans == other.plans
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health snapshot for one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerStatus {
    pub name: String,
    pub status: HealthState,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

impl ServerStatus {
    /// Status for a target that has not been probed yet.
    pub fn unassessed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthState::Down,
            last_check: None,
            last_success: None,
            consecutive_failures: 0,
            response_time_ms: None,
            error: None,
        }
    }

    pub fn record_success(&mut self, elapsed: Duration, threshold: Duration, at: DateTime<Utc>) {
        self.status = if elapsed > threshold {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        self.consecutive_failures = 0;
        self.response_time_ms = Some(elapsed.as_millis() as u64);
        self.error = None;
        self.last_success = Some(at);
        self.last_check = Some(at);
    }

    pub fn record_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = HealthState::Down;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.error = Some(error.into());
        self.last_check = Some(at);
    }

    pub fn is_down(&self) -> bool {
        self.status == HealthState::Down
    }
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Retrying,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Edges of `pending -> in_progress -> (retrying -> in_progress)* -> completed | failed`.
    /// `retrying -> failed` covers a target that disappears during backoff.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Retrying)
                | (Retrying, InProgress)
                | (Retrying, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit and lifecycle record for one client-requested execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationRecord {
    pub id: String,
    pub target: String,
    pub operation: String,
    pub status: OperationStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub chunked: bool,
}

impl OperationRecord {
    pub fn new(
        target: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_operation_id(),
            target: target.into(),
            operation: operation.into(),
            status: OperationStatus::Pending,
            attempt: 1,
            max_attempts,
            created_at: now,
            updated_at: now,
            payload,
            result: None,
            error: None,
            chunked: false,
        }
    }
}

/// Field changes written on every lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationUpdate {
    pub status: OperationStatus,
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OperationRecord {
    pub fn apply(&mut self, update: &OperationUpdate) {
        self.status = update.status;
        self.attempt = update.attempt;
        self.result = update.result.clone();
        self.error = update.error.clone();
        self.updated_at = update.updated_at;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Completed,
    Failed,
}

/// One sequential sub-call of a chunked operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationChunk {
    pub id: String,
    pub operation_id: String,
    pub attempt: u32,
    pub chunk_index: usize,
    pub status: ChunkStatus,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl OperationChunk {
    pub fn new(operation_id: &str, attempt: u32, chunk_index: usize, payload: serde_json::Value) -> Self {
        Self {
            id: format!("{}-a{}-c{}", operation_id, attempt, chunk_index),
            operation_id: operation_id.to_string(),
            attempt,
            chunk_index,
            status: ChunkStatus::Pending,
            payload,
            result: None,
            error: None,
        }
    }
}

pub fn new_operation_id() -> String {
    format!("op_{}", uuid::Uuid::new_v4().simple())
}
