use super::LivenessProbe;
use crate::core::{FleetError, InvocationDescriptor, Result, Target};
use async_trait::async_trait;
use tokio::process::Command;

/// Treats a target as alive while a process whose command line matches its
/// descriptor is running (`pgrep -f`).
#[derive(Debug, Clone)]
pub struct ProcessProbe {
    program: String,
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            program: "pgrep".to_string(),
        }
    }

    /// Use a different `pgrep`-compatible binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Extended-regex pattern matching the descriptor's full command line.
pub fn command_pattern(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*")
}

#[async_trait]
impl LivenessProbe for ProcessProbe {
    async fn probe(&self, target: &Target) -> Result<()> {
        let InvocationDescriptor::Process { command, args, .. } = &target.descriptor else {
            return Err(FleetError::AttemptFailure(format!(
                "target '{}' has no process descriptor",
                target.name
            )));
        };

        let output = Command::new(&self.program)
            .arg("-f")
            .arg(command_pattern(command, args))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| FleetError::AttemptFailure(format!("{} failed: {}", self.program, err)))?;

        let running = output.status.success()
            && !String::from_utf8_lossy(&output.stdout).trim().is_empty();
        if running {
            Ok(())
        } else {
            Err(FleetError::AttemptFailure("process not running".to_string()))
        }
    }
}
