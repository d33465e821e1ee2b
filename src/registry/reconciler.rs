use super::{FleetRegistry, ReconcileDiff};
use crate::collaborators::TargetSource;
use crate::config::TargetConfig;
use crate::core::Result;
use crate::signals::{FleetSignal, SignalSender, emit};
use crate::worker::WorkerHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Applies target lists to the registry and announces the result.
pub struct ConfigReconciler {
    registry: Arc<FleetRegistry>,
    signals: SignalSender,
}

impl ConfigReconciler {
    pub fn new(registry: Arc<FleetRegistry>, signals: SignalSender) -> Self {
        Self { registry, signals }
    }

    pub async fn reconcile(&self, configs: &[TargetConfig]) -> Result<ReconcileDiff> {
        let diff = self.registry.reconcile(configs).await?;
        if diff.is_noop() {
            debug!(targets = diff.unchanged.len(), "reconcile: no changes");
        } else {
            info!(
                added = ?diff.added,
                removed = ?diff.removed,
                replaced = ?diff.replaced,
                unchanged = diff.unchanged.len(),
                "reconciled target list"
            );
        }
        if !diff.added.is_empty() || !diff.removed.is_empty() {
            emit(
                &self.signals,
                FleetSignal::Reconciled {
                    added: diff.added.clone(),
                    removed: diff.removed.clone(),
                },
            );
        }
        Ok(diff)
    }

    /// Consumes target lists from `rx` until stopped or the channel closes.
    pub fn spawn_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Vec<TargetConfig>>,
    ) -> WorkerHandle {
        WorkerHandle::spawn("reconciler", move |mut stop_rx| async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    next = rx.recv() => {
                        let Some(configs) = next else { break };
                        if let Err(err) = self.reconcile(&configs).await {
                            warn!(error = %err, "rejected target list, registry unchanged");
                        }
                    }
                }
            }
        })
    }
}

/// Polls `source` and forwards the list whenever its content changes.
///
/// Load failures are logged and the previous list stays in force.
pub fn spawn_source_poller(
    source: Arc<dyn TargetSource>,
    tx: mpsc::Sender<Vec<TargetConfig>>,
    poll_interval: Duration,
    last_seen: Option<Vec<TargetConfig>>,
) -> WorkerHandle {
    let poll_interval = poll_interval.max(Duration::from_millis(10));
    WorkerHandle::spawn("target-source-poller", move |mut stop_rx| async move {
        let mut last_seen = last_seen;
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = sleep(poll_interval) => {
                    match source.load().await {
                        Ok(configs) => {
                            if last_seen.as_ref() == Some(&configs) {
                                continue;
                            }
                            last_seen = Some(configs.clone());
                            if tx.send(configs).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to load target list");
                        }
                    }
                }
            }
        }
    })
}
