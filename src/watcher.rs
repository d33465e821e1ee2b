//! The `FleetWatcher` facade wires the registry, monitor, executor and
//! reconciler together and owns their background workers.

use crate::collaborators::{DescriptorProbe, HttpInvoker, Invoker, LivenessProbe, TargetSource};
use crate::config::{TargetConfig, WatcherConfig};
use crate::core::{
    FleetError, OperationChunk, OperationRecord, OperationStatus, Result, ServerStatus,
};
use crate::executor::OperationExecutor;
use crate::fallback::FallbackOrchestrator;
use crate::monitor::{CycleReport, FleetHealth, HealthMonitor};
use crate::registry::{ConfigReconciler, FleetRegistry, ReconcileDiff, spawn_source_poller};
use crate::signals::{FleetSignal, SignalSender, signal_channel};
use crate::storage::{FleetStore, MemoryStore};
use crate::strategy::PlanTable;
use crate::worker::WorkerHandle;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{info, warn};

const SIGNAL_CAPACITY: usize = 256;
const SYNC_CHANNEL_CAPACITY: usize = 8;

pub struct FleetWatcherBuilder {
    config: WatcherConfig,
    plans: Option<PlanTable>,
    probe: Option<Arc<dyn LivenessProbe>>,
    invoker: Option<Arc<dyn Invoker>>,
    store: Option<Arc<dyn FleetStore>>,
    source: Option<Arc<dyn TargetSource>>,
}

impl FleetWatcherBuilder {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            plans: None,
            probe: None,
            invoker: None,
            store: None,
            source: None,
        }
    }

    /// Operation name -> chunk plan table used at registration time.
    pub fn plans(mut self, plans: PlanTable) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn store(mut self, store: Arc<dyn FleetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn source(mut self, source: Arc<dyn TargetSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> Result<FleetWatcher> {
        self.config.validate()?;
        let config = self.config;

        let plans = self.plans.unwrap_or_else(|| {
            PlanTable::builtin(config.chunking.chunk_size, config.chunking.max_chunks)
        });
        let probe: Arc<dyn LivenessProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(DescriptorProbe::default()),
        };
        let invoker: Arc<dyn Invoker> = match self.invoker {
            Some(invoker) => invoker,
            None => Arc::new(HttpInvoker::new()),
        };
        let store: Arc<dyn FleetStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };

        let signals = signal_channel(SIGNAL_CAPACITY);
        let registry = Arc::new(FleetRegistry::with_plans(config.clone(), plans));
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            probe,
            store.clone(),
            signals.clone(),
            config.probe_deadline(),
        ));
        let executor = Arc::new(OperationExecutor::new(
            registry.clone(),
            invoker.clone(),
            store.clone(),
            config.operations.recent_capacity,
            config.chunk_pause_duration(),
        ));
        let fallback = FallbackOrchestrator::new(registry.clone(), executor.clone(), invoker);
        let reconciler = Arc::new(ConfigReconciler::new(registry.clone(), signals.clone()));

        Ok(FleetWatcher {
            config,
            registry,
            monitor,
            executor,
            fallback,
            reconciler,
            store,
            source: self.source,
            signals,
            workers: Mutex::new(Vec::new()),
        })
    }
}

pub struct FleetWatcher {
    config: WatcherConfig,
    registry: Arc<FleetRegistry>,
    monitor: Arc<HealthMonitor>,
    executor: Arc<OperationExecutor>,
    fallback: FallbackOrchestrator,
    reconciler: Arc<ConfigReconciler>,
    store: Arc<dyn FleetStore>,
    source: Option<Arc<dyn TargetSource>>,
    signals: SignalSender,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl FleetWatcher {
    pub fn builder(config: WatcherConfig) -> FleetWatcherBuilder {
        FleetWatcherBuilder::new(config)
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub async fn status(&self, target_name: &str) -> Result<ServerStatus> {
        self.registry
            .status(target_name)
            .await
            .ok_or_else(|| FleetError::UnknownTarget(target_name.to_string()))
    }

    /// Every status, ordered by target name.
    pub async fn statuses(&self) -> Vec<ServerStatus> {
        self.registry.statuses().await
    }

    pub async fn health(&self) -> FleetHealth {
        FleetHealth::from_statuses(&self.registry.statuses().await)
    }

    /// Probes every registered target once.
    pub async fn run_health_cycle(&self) -> CycleReport {
        self.monitor.run_cycle().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetSignal> {
        self.signals.subscribe()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Supervised execution with direct-call fallback for non-critical operations.
    pub async fn execute(&self, target_name: &str, operation: &str, payload: Value) -> Result<Value> {
        self.fallback.run(target_name, operation, payload).await
    }

    /// Supervised execution only.
    pub async fn execute_supervised(
        &self,
        target_name: &str,
        operation: &str,
        payload: Value,
    ) -> Result<Value> {
        self.executor.execute(target_name, operation, payload).await
    }

    pub async fn recent_operations(&self, limit: usize) -> Vec<OperationRecord> {
        self.executor.recent_operations(limit).await
    }

    pub async fn operation(&self, id: &str) -> Option<OperationRecord> {
        self.executor.operation(id).await
    }

    pub async fn operation_history(&self, id: &str) -> Result<Vec<OperationStatus>> {
        self.store.operation_history(id).await
    }

    pub async fn operation_chunks(&self, id: &str) -> Result<Vec<OperationChunk>> {
        self.store.chunks_for(id).await
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    pub async fn reconcile(&self, targets: &[TargetConfig]) -> Result<ReconcileDiff> {
        self.reconciler.reconcile(targets).await
    }

    /// Loads the configured source once and reconciles against it.
    pub async fn sync_from_source(&self) -> Result<Option<ReconcileDiff>> {
        let Some(source) = &self.source else {
            return Ok(None);
        };
        let targets = source.load().await?;
        self.reconcile(&targets).await.map(Some)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Performs the initial sync and spawns the background workers.
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Err(FleetError::Worker("watcher already started".into()));
        }

        let mut initial = None;
        if let Some(source) = &self.source {
            match source.load().await {
                Ok(targets) => {
                    if let Err(err) = self.reconcile(&targets).await {
                        warn!(error = %err, "initial target list rejected");
                    } else {
                        initial = Some(targets);
                    }
                }
                Err(err) => warn!(error = %err, "failed to load initial target list"),
            }
        }

        match self.store.load_statuses().await {
            Ok(persisted) => {
                let restored = self.registry.restore_statuses(persisted).await;
                if restored > 0 {
                    info!(restored, "restored persisted target statuses");
                }
            }
            Err(err) => warn!(error = %err, "failed to load persisted statuses"),
        }

        workers.push(self.monitor.clone().spawn(self.config.monitor_tick()));

        if let Some(source) = &self.source {
            if self.config.auto_sync.enabled {
                let (tx, rx) = mpsc::channel(SYNC_CHANNEL_CAPACITY);
                workers.push(self.reconciler.clone().spawn_worker(rx));
                workers.push(spawn_source_poller(
                    source.clone(),
                    tx,
                    Duration::from_millis(self.config.auto_sync.poll_interval_ms),
                    initial,
                ));
            }
        }

        info!(
            targets = self.registry.len().await,
            workers = workers.len(),
            "fleet watcher started"
        );
        Ok(())
    }

    /// Stops every worker and waits for them to finish.
    pub async fn stop(&self) -> Result<()> {
        let workers: Vec<WorkerHandle> = self.workers.lock().await.drain(..).collect();
        let mut first_error = None;
        for worker in workers {
            let name = worker.name();
            if let Err(err) = worker.stop().await {
                warn!(worker = name, error = %err, "worker did not stop cleanly");
                first_error.get_or_insert(err);
            }
        }
        info!("fleet watcher stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn is_running(&self) -> bool {
        !self.workers.lock().await.is_empty()
    }
}
