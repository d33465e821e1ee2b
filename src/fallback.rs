//! Client-facing entry point: the supervised path first, then an unretried
//! direct call for non-critical operations.

use crate::collaborators::Invoker;
use crate::core::{FleetError, Result};
use crate::executor::OperationExecutor;
use crate::registry::FleetRegistry;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, warn};

pub const DATA_SOURCE_FIELD: &str = "dataSource";
pub const DIRECT_FALLBACK: &str = "direct_fallback";

pub struct FallbackOrchestrator {
    registry: Arc<FleetRegistry>,
    executor: Arc<OperationExecutor>,
    invoker: Arc<dyn Invoker>,
}

impl FallbackOrchestrator {
    pub fn new(
        registry: Arc<FleetRegistry>,
        executor: Arc<OperationExecutor>,
        invoker: Arc<dyn Invoker>,
    ) -> Self {
        Self {
            registry,
            executor,
            invoker,
        }
    }

    pub async fn run(&self, target_name: &str, operation: &str, payload: Value) -> Result<Value> {
        if let Some(status) = self.registry.status(target_name).await {
            if status.is_down() && status.consecutive_failures > 0 {
                warn!(
                    target_name,
                    operation,
                    failures = status.consecutive_failures,
                    "target currently reports down"
                );
            }
        }

        let supervised_error = match self
            .executor
            .execute(target_name, operation, payload.clone())
            .await
        {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !should_fallback(&supervised_error) {
            return Err(supervised_error);
        }
        let Some(target) = self.registry.target(target_name).await else {
            return Err(supervised_error);
        };
        if target.is_critical(operation) {
            info!(target_name, operation, "critical operation failed, no fallback");
            return Err(supervised_error);
        }

        warn!(
            target_name,
            operation,
            error = %supervised_error,
            "supervised path failed, trying direct call"
        );
        let direct = match timeout(
            target.attempt_timeout,
            self.invoker.invoke(&target, operation, &payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FleetError::AttemptFailure(format!(
                "direct call timed out after {}ms",
                target.attempt_timeout.as_millis()
            ))),
        };

        match direct {
            Ok(value) => {
                info!(target_name, operation, "served degraded result from direct call");
                Ok(mark_degraded(value))
            }
            Err(direct_error) => Err(FleetError::FallbackFailed {
                operation: operation.to_string(),
                supervised: supervised_error.to_string(),
                direct: direct_error.to_string(),
            }),
        }
    }
}

/// Whether a supervised failure leaves a target to call directly.
pub fn should_fallback(err: &FleetError) -> bool {
    !matches!(
        err,
        FleetError::UnknownTarget(_)
            | FleetError::TargetRemoved(_)
            | FleetError::InvalidPayload(_)
    )
}

/// Tags a direct-call result so callers can tell it skipped supervision.
pub fn mark_degraded(value: Value) -> Value {
    let mut object = match value {
        Value::Object(object) => object,
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("result".to_string(), other);
            wrapped
        }
    };
    object.insert(DATA_SOURCE_FIELD.to_string(), Value::from(DIRECT_FALLBACK));
    object.insert("degraded".to_string(), Value::Bool(true));
    Value::Object(object)
}
