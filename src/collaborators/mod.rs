//! Seams to the outside world: liveness probes, invokers and target sources.
//!
//! The watcher core only talks to these traits; the concrete wrapped APIs live
//! behind an [`Invoker`].

pub mod http;
pub mod process;

pub use http::{HttpInvoker, HttpProbe};
pub use process::ProcessProbe;

use crate::config::{TargetConfig, parse_targets};
use crate::core::{InvocationDescriptor, Result, Target};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

/// Decides whether a target is alive. Elapsed time and the deadline are
/// handled by the health monitor.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, target: &Target) -> Result<()>;
}

/// Performs the actual remote call for an operation.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, target: &Target, operation: &str, payload: &Value) -> Result<Value>;
}

/// Supplies the current, already-normalized target list.
#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn load(&self) -> Result<Vec<TargetConfig>>;
}

/// Routes each probe to the implementation matching the descriptor kind.
pub struct DescriptorProbe {
    http: HttpProbe,
    process: ProcessProbe,
}

impl DescriptorProbe {
    pub fn new(http: HttpProbe, process: ProcessProbe) -> Self {
        Self { http, process }
    }
}

impl Default for DescriptorProbe {
    fn default() -> Self {
        Self::new(HttpProbe::new(), ProcessProbe::new())
    }
}

#[async_trait]
impl LivenessProbe for DescriptorProbe {
    async fn probe(&self, target: &Target) -> Result<()> {
        match target.descriptor {
            InvocationDescriptor::Http { .. } => self.http.probe(target).await,
            InvocationDescriptor::Process { .. } => self.process.probe(target).await,
        }
    }
}

/// Reads a JSON array of [`TargetConfig`] records from disk.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TargetSource for JsonFileSource {
    async fn load(&self) -> Result<Vec<TargetConfig>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        parse_targets(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_json_file_source_reads_targets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name":"search-api","descriptor":{{"kind":"http","url":"http://localhost:9"}},"timeout_threshold_ms":25}}]"#
        )
        .unwrap();

        let targets = JsonFileSource::new(file.path()).load().await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "search-api");
        assert_eq!(targets[0].timeout_threshold_ms, 25);
    }

    #[tokio::test]
    async fn test_json_file_source_missing_file_is_an_error() {
        let source = JsonFileSource::new("/definitely/not/here/targets.json");
        assert!(source.load().await.is_err());
    }
}
