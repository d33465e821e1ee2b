// ============================================================================
// Fleetwatch Library
// ============================================================================

//! Supervisory watcher for a fleet of operation targets.
//!
//! The watcher keeps a live health model of every registered target, runs
//! client operations against them with bounded retry and optional chunking,
//! records an audit trail of every execution, and reconciles its target set
//! against an external configuration source at runtime.
//!
//! # Examples
//!
//! ```no_run
//! use fleetwatch::{FleetWatcher, TargetConfig, WatcherConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> fleetwatch::Result<()> {
//! let watcher = FleetWatcher::builder(WatcherConfig::default()).build()?;
//! watcher
//!     .reconcile(&[TargetConfig::http("search-api", "http://localhost:8080").critical("search_clients")])
//!     .await?;
//!
//! watcher.run_health_cycle().await;
//! println!("{:?}", watcher.status("search-api").await?);
//!
//! let result = watcher.execute("search-api", "lookup_weather", json!({"city": "Lisbon"})).await?;
//! println!("{}", result);
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod core;
pub mod executor;
pub mod fallback;
pub mod monitor;
pub mod registry;
pub mod signals;
pub mod storage;
pub mod strategy;
pub mod watcher;
pub mod worker;

// Re-export main types for convenience
pub use core::{
    ChunkStatus, FleetError, HealthState, InvocationDescriptor, OperationChunk, OperationRecord,
    OperationStatus, OperationUpdate, Result, RetryPolicy, ServerStatus, Target,
};
pub use config::{TargetConfig, WatcherConfig, parse_targets};
pub use watcher::{FleetWatcher, FleetWatcherBuilder};

pub use collaborators::{
    DescriptorProbe, HttpInvoker, HttpProbe, Invoker, JsonFileSource, LivenessProbe,
    ProcessProbe, TargetSource,
};
pub use executor::{OperationExecutor, OperationLog};
pub use fallback::FallbackOrchestrator;
pub use monitor::{CycleReport, FleetHealth, HealthMonitor, OverallHealth, ProbeOutcome};
pub use registry::{ConfigReconciler, FleetRegistry, FleetSnapshot, ReconcileDiff};
pub use signals::FleetSignal;
pub use storage::{FleetStore, JournalStore, MemoryStore};
pub use strategy::{ChunkFailurePolicy, ChunkPlan, MergeStrategy, PlanTable, SplitStrategy};
