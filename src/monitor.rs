//! Health monitor: probes targets in parallel and folds the outcomes into
//! each target's status state machine.

use crate::collaborators::LivenessProbe;
use crate::core::{FleetError, HealthState, ServerStatus, Target};
use crate::registry::FleetRegistry;
use crate::signals::{FleetSignal, SignalSender, emit};
use crate::storage::FleetStore;
use crate::worker::WorkerHandle;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

/// Result of one probe, before it is applied to a status.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Alive { elapsed: Duration },
    Failed { error: String },
}

/// Counts from one monitor cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub probed: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub down: usize,
    /// Outcomes dropped because the target was removed or re-registered mid-probe.
    pub discarded: usize,
    pub persist_failures: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Warning,
}

/// Fleet-wide rollup of target statuses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetHealth {
    pub overall: OverallHealth,
    pub healthy: usize,
    pub degraded: usize,
    pub down: usize,
    pub total: usize,
}

impl FleetHealth {
    pub fn from_statuses(statuses: &[ServerStatus]) -> Self {
        let count = |state: HealthState| statuses.iter().filter(|s| s.status == state).count();
        let healthy = count(HealthState::Healthy);
        let degraded = count(HealthState::Degraded);
        let down = count(HealthState::Down);

        let overall = if down > 0 {
            OverallHealth::Degraded
        } else if degraded > 0 {
            OverallHealth::Warning
        } else {
            OverallHealth::Healthy
        };

        Self {
            overall,
            healthy,
            degraded,
            down,
            total: statuses.len(),
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<FleetRegistry>,
    probe: Arc<dyn LivenessProbe>,
    store: Arc<dyn FleetStore>,
    signals: SignalSender,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<FleetRegistry>,
        probe: Arc<dyn LivenessProbe>,
        store: Arc<dyn FleetStore>,
        signals: SignalSender,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            probe,
            store,
            signals,
            probe_timeout,
        }
    }

    /// Probes every registered target.
    pub async fn run_cycle(&self) -> CycleReport {
        let targets = self.registry.snapshot().await.all_targets();
        self.probe_targets(targets).await
    }

    /// Probes only targets whose own check interval has elapsed.
    pub async fn run_due_cycle(&self) -> CycleReport {
        let targets = self.registry.snapshot().await.due_targets(Utc::now());
        if targets.is_empty() {
            return CycleReport::default();
        }
        self.probe_targets(targets).await
    }

    async fn probe_targets(&self, targets: Vec<Arc<Target>>) -> CycleReport {
        let outcomes = join_all(targets.iter().map(|target| self.probe_one(target))).await;

        let mut report = CycleReport {
            probed: targets.len(),
            ..CycleReport::default()
        };
        for (target, outcome) in targets.iter().zip(outcomes) {
            if !self.apply_outcome(target, outcome).await {
                report.discarded += 1;
            }
        }

        let statuses = self.registry.statuses().await;
        let failures = self.store.upsert_statuses(&statuses).await;
        for (name, err) in &failures {
            warn!(target_name = %name, error = %err, "failed to persist server status");
        }
        report.persist_failures = failures.len();

        for status in &statuses {
            match status.status {
                HealthState::Healthy => report.healthy += 1,
                HealthState::Degraded => report.degraded += 1,
                HealthState::Down => report.down += 1,
            }
        }
        log_health_summary(&statuses);
        report
    }

    async fn probe_one(&self, target: &Target) -> ProbeOutcome {
        let started = Instant::now();
        match timeout(self.probe_timeout, self.probe.probe(target)).await {
            Ok(Ok(())) => ProbeOutcome::Alive {
                elapsed: started.elapsed(),
            },
            Ok(Err(err)) => ProbeOutcome::Failed {
                error: probe_error_message(err),
            },
            Err(_) => ProbeOutcome::Failed {
                error: format!("probe timed out after {}ms", self.probe_timeout.as_millis()),
            },
        }
    }

    /// Returns false when the outcome was stale and discarded.
    async fn apply_outcome(&self, target: &Target, outcome: ProbeOutcome) -> bool {
        let now = Utc::now();
        let threshold = target.timeout_threshold;
        let outcome_for_update = outcome.clone();
        let applied = self
            .registry
            .update_status(&target.name, target.epoch, move |status| match outcome_for_update {
                ProbeOutcome::Alive { elapsed } => status.record_success(elapsed, threshold, now),
                ProbeOutcome::Failed { error } => status.record_failure(error, now),
            })
            .await;

        let Some((before, after)) = applied else {
            debug!(target_name = %target.name, "discarding probe result for removed target");
            return false;
        };

        let limit = target.retry.max_attempts;
        match outcome {
            ProbeOutcome::Alive { .. } => {
                if before.consecutive_failures > 0 {
                    info!(
                        target_name = %target.name,
                        status = after.status.as_str(),
                        "target recovered"
                    );
                    emit(
                        &self.signals,
                        FleetSignal::TargetRecovered {
                            name: target.name.clone(),
                        },
                    );
                }
            }
            ProbeOutcome::Failed { ref error } => {
                debug!(
                    target_name = %target.name,
                    failures = after.consecutive_failures,
                    error = %error,
                    "probe failed"
                );
                if after.consecutive_failures >= limit {
                    warn!(
                        target_name = %target.name,
                        failures = after.consecutive_failures,
                        limit,
                        "target exceeded its failure limit"
                    );
                    if before.consecutive_failures < limit {
                        emit(
                            &self.signals,
                            FleetSignal::TargetDown {
                                name: target.name.clone(),
                                consecutive_failures: after.consecutive_failures,
                            },
                        );
                    }
                }
            }
        }
        true
    }

    /// Runs `run_due_cycle` every `tick` until stopped.
    pub fn spawn(self: Arc<Self>, tick: Duration) -> WorkerHandle {
        let tick = tick.max(Duration::from_millis(10));
        WorkerHandle::spawn("health-monitor", move |mut stop_rx| async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = sleep(tick) => {
                        self.run_due_cycle().await;
                    }
                }
            }
        })
    }
}

fn probe_error_message(err: FleetError) -> String {
    match err {
        FleetError::AttemptFailure(message) => message,
        other => other.to_string(),
    }
}

fn log_health_summary(statuses: &[ServerStatus]) {
    let health = FleetHealth::from_statuses(statuses);
    info!(
        "health: {} healthy, {} degraded, {} down",
        health.healthy, health.degraded, health.down
    );

    let down: Vec<String> = statuses
        .iter()
        .filter(|s| s.is_down() && s.consecutive_failures > 0)
        .map(|s| format!("{} ({} failures)", s.name, s.consecutive_failures))
        .collect();
    if !down.is_empty() {
        warn!("down targets: {}", down.join(", "));
    }
}
