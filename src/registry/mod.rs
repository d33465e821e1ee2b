//! Target registry: the live set of targets and their health statuses.
//!
//! Targets and statuses sit behind one lock so a reconciliation removing a
//! name and a status lookup for that name are mutually exclusive. Readers take
//! cheap structural-sharing snapshots and never see a half-applied reconcile.

pub mod reconciler;

pub use reconciler::{ConfigReconciler, spawn_source_poller};

use crate::config::{TargetConfig, WatcherConfig};
use crate::core::{FleetError, Result, ServerStatus, Target};
use crate::strategy::PlanTable;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

/// Result of one reconciliation, by target name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Subset of `unchanged` whose definition was swapped; status is kept.
    pub replaced: Vec<String>,
}

impl ReconcileDiff {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.replaced.is_empty()
    }
}

/// Immutable view of the registry at one instant.
#[derive(Debug, Clone, Default)]
pub struct FleetSnapshot {
    pub targets: im::HashMap<String, Arc<Target>>,
    pub statuses: im::HashMap<String, ServerStatus>,
}

impl FleetSnapshot {
    /// Targets whose own check interval has elapsed, plus never-checked ones.
    pub fn due_targets(&self, now: DateTime<Utc>) -> Vec<Arc<Target>> {
        let mut due: Vec<Arc<Target>> = self
            .targets
            .values()
            .filter(|target| {
                let last_check = self
                    .statuses
                    .get(&target.name)
                    .and_then(|status| status.last_check);
                match last_check {
                    None => true,
                    Some(last) => now
                        .signed_duration_since(last)
                        .to_std()
                        .map(|elapsed| elapsed >= target.health_check_interval)
                        .unwrap_or(false),
                }
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.name.cmp(&b.name));
        due
    }

    pub fn all_targets(&self) -> Vec<Arc<Target>> {
        let mut targets: Vec<Arc<Target>> = self.targets.values().cloned().collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        targets
    }
}

pub struct FleetRegistry {
    state: RwLock<FleetSnapshot>,
    defaults: WatcherConfig,
    plans: PlanTable,
    next_epoch: AtomicU64,
}

impl FleetRegistry {
    pub fn new(defaults: WatcherConfig) -> Self {
        let plans =
            PlanTable::builtin(defaults.chunking.chunk_size, defaults.chunking.max_chunks);
        Self::with_plans(defaults, plans)
    }

    pub fn with_plans(defaults: WatcherConfig, plans: PlanTable) -> Self {
        Self {
            state: RwLock::new(FleetSnapshot::default()),
            defaults,
            plans,
            next_epoch: AtomicU64::new(1),
        }
    }

    /// Replaces the registry contents with `configs`, diffing by name.
    ///
    /// The whole list is validated first; an invalid list leaves the registry
    /// untouched. Added targets start `down` with zero failures, removed
    /// targets lose their status, unchanged targets keep theirs.
    pub async fn reconcile(&self, configs: &[TargetConfig]) -> Result<ReconcileDiff> {
        let mut seen = HashSet::new();
        for config in configs {
            config.validate()?;
            if !seen.insert(config.name.as_str()) {
                return Err(FleetError::Config(format!(
                    "duplicate target name '{}'",
                    config.name
                )));
            }
        }

        let mut state = self.state.write().await;
        let mut next = state.clone();
        let mut diff = ReconcileDiff::default();

        let incoming: HashSet<&str> = configs.iter().map(|c| c.name.as_str()).collect();
        let mut existing: Vec<String> = state.targets.keys().cloned().collect();
        existing.sort();
        for name in existing {
            if !incoming.contains(name.as_str()) {
                next.targets.remove(&name);
                next.statuses.remove(&name);
                info!(target_name = %name, "target removed from registry");
                diff.removed.push(name);
            }
        }

        for config in configs {
            match state.targets.get(&config.name) {
                Some(current) => {
                    let candidate = config.resolve(&self.defaults, &self.plans, current.epoch);
                    if !candidate.same_definition(current) {
                        info!(target_name = %config.name, "target definition replaced");
                        next.targets.insert(config.name.clone(), Arc::new(candidate));
                        diff.replaced.push(config.name.clone());
                    }
                    diff.unchanged.push(config.name.clone());
                }
                None => {
                    let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                    let target = config.resolve(&self.defaults, &self.plans, epoch);
                    next.targets.insert(config.name.clone(), Arc::new(target));
                    next.statuses
                        .insert(config.name.clone(), ServerStatus::unassessed(&config.name));
                    info!(target_name = %config.name, epoch, "target added to registry");
                    diff.added.push(config.name.clone());
                }
            }
        }

        *state = next;
        Ok(diff)
    }

    pub async fn snapshot(&self) -> FleetSnapshot {
        self.state.read().await.clone()
    }

    pub async fn target(&self, name: &str) -> Option<Arc<Target>> {
        self.state.read().await.targets.get(name).cloned()
    }

    /// Target plus its status, read under one lock.
    pub async fn target_with_status(&self, name: &str) -> Option<(Arc<Target>, ServerStatus)> {
        let state = self.state.read().await;
        let target = state.targets.get(name)?.clone();
        let status = state.statuses.get(name)?.clone();
        Some((target, status))
    }

    /// True while `name` is registered under the same registration epoch.
    pub async fn is_current(&self, name: &str, epoch: u64) -> bool {
        self.state
            .read()
            .await
            .targets
            .get(name)
            .map(|target| target.epoch == epoch)
            .unwrap_or(false)
    }

    pub async fn status(&self, name: &str) -> Option<ServerStatus> {
        self.state.read().await.statuses.get(name).cloned()
    }

    /// All statuses ordered by name.
    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let state = self.state.read().await;
        let mut statuses: Vec<ServerStatus> = state.statuses.values().cloned().collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.targets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copies persisted statuses onto registered targets that have not been
    /// probed yet. Returns how many were restored.
    pub async fn restore_statuses(&self, persisted: Vec<ServerStatus>) -> usize {
        let mut state = self.state.write().await;
        let mut restored = 0;
        for status in persisted {
            let Some(current) = state.statuses.get_mut(&status.name) else {
                continue;
            };
            if current.last_check.is_none() {
                *current = status;
                restored += 1;
            }
        }
        restored
    }

    /// Applies `update` to a status if the target is still registered under
    /// `epoch`. Returns the status before and after the change.
    pub async fn update_status<F>(
        &self,
        name: &str,
        epoch: u64,
        update: F,
    ) -> Option<(ServerStatus, ServerStatus)>
    where
        F: FnOnce(&mut ServerStatus),
    {
        let mut state = self.state.write().await;
        let current_epoch = state.targets.get(name)?.epoch;
        if current_epoch != epoch {
            return None;
        }
        let status = state.statuses.get_mut(name)?;
        let before = status.clone();
        update(status);
        Some((before, status.clone()))
    }
}
