//! External command execution.
//!
//! OVS, `ip` and `iptables` are driven as command-line tools. Everything
//! goes through [`CommandRunner`] so tests can record invocations instead
//! of touching the host.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use crate::error::{AgentError, AgentResult};

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning stdout. A non-zero exit is an
    /// error carrying stderr.
    async fn run(&self, program: &str, args: &[String]) -> AgentResult<String>;
}

/// Runs commands on the local host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> AgentResult<String> {
        trace!(%program, args = %args.join(" "), "exec");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| AgentError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(AgentError::Command {
                program: program.to_string(),
                args: args.join(" "),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Owned argument list from string slices.
pub(crate) fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
