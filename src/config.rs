use crate::core::{FleetError, InvocationDescriptor, Result, RetryPolicy, Target};
use crate::strategy::{ChunkPlan, PlanTable};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Watcher configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Journal file backing the durable store.
    pub path: PathBuf,
    /// Compact the journal into a snapshot after this many appended records.
    pub compact_every: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./watcher.journal"),
            compact_every: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Monitor tick in milliseconds.
    pub interval_ms: u64,
    /// Deadline for a single probe in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_ms: 5_000,
        }
    }
}

/// Fleet-wide retry defaults; targets may override each field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    /// Deadline for one attempt against a target.
    pub attempt_timeout_ms: u64,
    /// Number of operation records kept in memory.
    pub recent_capacity: usize,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 30_000,
            recent_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    /// Upper bound on the pages one paged request may be split into.
    pub max_chunks: usize,
    /// Fixed pause between sequential chunks.
    pub chunk_pause_ms: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            max_chunks: crate::strategy::default_max_chunks(),
            chunk_pause_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSyncConfig {
    pub enabled: bool,
    /// JSON file holding the list of target definitions.
    pub targets_path: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            targets_path: None,
            poll_interval_ms: 2_000,
        }
    }
}

/// Top-level watcher configuration.
///
/// # Examples
///
/// ```
/// use fleetwatch::WatcherConfig;
/// use std::time::Duration;
///
/// let config = WatcherConfig::new()
///     .health_interval(Duration::from_secs(5))
///     .base_delay(Duration::from_millis(200));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WatcherConfig {
    pub database: DatabaseConfig,
    pub health_check: HealthCheckConfig,
    pub recovery: RecoveryConfig,
    pub operations: OperationsConfig,
    pub chunking: ChunkingConfig,
    pub logging: LoggingConfig,
    pub auto_sync: AutoSyncConfig,
}

impl WatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| FleetError::Config(format!("invalid watcher config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            FleetError::Config(format!("failed to read '{}': {}", path.display(), err))
        })?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_check.interval_ms == 0 {
            return Err(FleetError::Config("health_check.interval_ms must be > 0".into()));
        }
        if self.health_check.timeout_ms == 0 {
            return Err(FleetError::Config("health_check.timeout_ms must be > 0".into()));
        }
        if self.recovery.max_retries == 0 {
            return Err(FleetError::Config("recovery.max_retries must be >= 1".into()));
        }
        if self.recovery.max_delay_ms < self.recovery.base_delay_ms {
            return Err(FleetError::Config(
                "recovery.max_delay_ms must be >= recovery.base_delay_ms".into(),
            ));
        }
        if self.chunking.chunk_size == 0 {
            return Err(FleetError::Config("chunking.chunk_size must be > 0".into()));
        }
        if self.chunking.max_chunks == 0 {
            return Err(FleetError::Config("chunking.max_chunks must be > 0".into()));
        }
        Ok(())
    }

    /// Set the monitor tick
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_check.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the per-probe deadline
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.health_check.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.recovery.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.recovery.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.recovery.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.operations.attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunking.chunk_size = size;
        self
    }

    pub fn max_chunks(mut self, max_chunks: usize) -> Self {
        self.chunking.max_chunks = max_chunks;
        self
    }

    pub fn chunk_pause(mut self, pause: Duration) -> Self {
        self.chunking.chunk_pause_ms = pause.as_millis() as u64;
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database.path = path.into();
        self
    }

    pub fn targets_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.auto_sync.targets_path = Some(path.into());
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync.enabled = enabled;
        self
    }

    pub fn probe_deadline(&self) -> Duration {
        Duration::from_millis(self.health_check.timeout_ms)
    }

    pub fn monitor_tick(&self) -> Duration {
        Duration::from_millis(self.health_check.interval_ms)
    }

    pub fn chunk_pause_duration(&self) -> Duration {
        Duration::from_millis(self.chunking.chunk_pause_ms)
    }
}

// ============================================================================
// Target configuration (normalized records from the external source)
// ============================================================================

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_timeout_threshold_ms() -> u64 {
    15_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub name: String,
    pub descriptor: InvocationDescriptor,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_timeout_threshold_ms")]
    pub timeout_threshold_ms: u64,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub critical_operations: Vec<String>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,
    /// Plan overrides for critical operations.
    #[serde(default)]
    pub chunking: HashMap<String, ChunkPlan>,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, descriptor: InvocationDescriptor) -> Self {
        Self {
            name: name.into(),
            descriptor,
            health_check_interval_ms: default_health_check_interval_ms(),
            timeout_threshold_ms: default_timeout_threshold_ms(),
            max_retries: None,
            backoff_multiplier: default_backoff_multiplier(),
            critical_operations: Vec::new(),
            base_delay_ms: None,
            max_delay_ms: None,
            attempt_timeout_ms: None,
            chunking: HashMap::new(),
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            InvocationDescriptor::Http {
                url: url.into(),
                auth_header: None,
            },
        )
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn timeout_threshold(mut self, threshold: Duration) -> Self {
        self.timeout_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn critical(mut self, operation: impl Into<String>) -> Self {
        self.critical_operations.push(operation.into());
        self
    }

    pub fn chunk_plan(mut self, operation: impl Into<String>, plan: ChunkPlan) -> Self {
        self.chunking.insert(operation.into(), plan);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FleetError::Config("target name must not be empty".into()));
        }
        if self.max_retries == Some(0) {
            return Err(FleetError::Config(format!(
                "target '{}': max_retries must be >= 1",
                self.name
            )));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(FleetError::Config(format!(
                "target '{}': backoff_multiplier must be >= 1",
                self.name
            )));
        }
        Ok(())
    }

    /// Resolves this record against fleet defaults into a registry [`Target`].
    pub fn resolve(&self, defaults: &WatcherConfig, plans: &PlanTable, epoch: u64) -> Target {
        let base_delay_ms = self.base_delay_ms.unwrap_or(defaults.recovery.base_delay_ms);
        let max_delay_ms = self
            .max_delay_ms
            .unwrap_or(defaults.recovery.max_delay_ms)
            .max(base_delay_ms);

        let critical_operations: HashSet<String> =
            self.critical_operations.iter().cloned().collect();
        let resolved_plans = critical_operations
            .iter()
            .map(|operation| {
                let plan = self
                    .chunking
                    .get(operation)
                    .cloned()
                    .unwrap_or_else(|| plans.resolve(operation));
                (operation.clone(), plan)
            })
            .collect();

        Target {
            name: self.name.clone(),
            descriptor: self.descriptor.clone(),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            timeout_threshold: Duration::from_millis(self.timeout_threshold_ms),
            attempt_timeout: Duration::from_millis(
                self.attempt_timeout_ms
                    .unwrap_or(defaults.operations.attempt_timeout_ms),
            ),
            retry: RetryPolicy {
                max_attempts: self.max_retries.unwrap_or(defaults.recovery.max_retries).max(1),
                base_delay: Duration::from_millis(base_delay_ms),
                backoff_multiplier: self.backoff_multiplier,
                max_delay: Duration::from_millis(max_delay_ms),
            },
            critical_operations,
            plans: resolved_plans,
            epoch,
        }
    }
}

/// Parses a JSON array of target definitions.
pub fn parse_targets(raw: &str) -> Result<Vec<TargetConfig>> {
    let targets: Vec<TargetConfig> = serde_json::from_str(raw)
        .map_err(|err| FleetError::Config(format!("invalid target list: {}", err)))?;
    for target in &targets {
        target.validate()?;
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SplitStrategy;

    #[test]
    fn test_defaults_follow_recovery_section() {
        let config = WatcherConfig::from_json("{}").unwrap();
        assert_eq!(config.recovery.max_retries, 3);
        assert_eq!(config.recovery.base_delay_ms, 1_000);
        assert_eq!(config.recovery.max_delay_ms, 30_000);
        assert_eq!(config.health_check.interval_ms, 10_000);
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = WatcherConfig::new()
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_max_chunks() {
        assert_eq!(WatcherConfig::default().chunking.max_chunks, 50);
        let config = WatcherConfig::new().max_chunks(0);
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));
    }

    #[test]
    fn test_target_inherits_fleet_defaults() {
        let defaults = WatcherConfig::new().max_retries(4).base_delay(Duration::from_millis(250));
        let target = TargetConfig::http("db", "http://db.local")
            .critical("search_clients")
            .resolve(&defaults, &PlanTable::builtin(10, 50), 7);

        assert_eq!(target.retry.max_attempts, 4);
        assert_eq!(target.retry.base_delay, Duration::from_millis(250));
        assert_eq!(target.epoch, 7);
        assert!(matches!(
            target.plan_for("search_clients").map(|plan| &plan.split),
            Some(SplitStrategy::Paged { .. })
        ));
        assert!(target.plan_for("create_client").is_none());
    }

    #[test]
    fn test_parse_targets_rejects_bad_multiplier() {
        let raw = r#"[{"name":"db","descriptor":{"kind":"http","url":"http://db"},"backoff_multiplier":0.5}]"#;
        assert!(parse_targets(raw).is_err());

        let ok = r#"[{"name":"db","descriptor":{"kind":"http","url":"http://db"},"critical_operations":["q"]}]"#;
        let targets = parse_targets(ok).unwrap();
        assert_eq!(targets[0].critical_operations, vec!["q".to_string()]);
        assert_eq!(targets[0].backoff_multiplier, 2.0);
    }
}
