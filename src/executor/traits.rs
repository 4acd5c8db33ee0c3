use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{ExecOutput, SshError};

/// Discrete remote command execution, the way every pipeline command talks
/// to the target. `SshSession` is the production implementation; tests use
/// a scripted stand-in.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Execute with the default 30 s limit.
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        self.exec_with_timeout(command, super::ssh::DEFAULT_EXEC_TIMEOUT)
            .await
    }

    /// Execute with a per-call limit (image pulls and installs override the
    /// default generously).
    async fn exec_with_timeout(
        &self,
        command: &str,
        limit: Duration,
    ) -> Result<ExecOutput, SshError>;

    /// Execute and forward stdout lines as they arrive, for long commands
    /// whose output doubles as progress (`docker pull`). The default
    /// delivers the lines after completion, which is good enough for
    /// scripted test executors.
    async fn exec_streamed(
        &self,
        command: &str,
        limit: Duration,
        lines: mpsc::Sender<String>,
    ) -> Result<ExecOutput, SshError> {
        let output = self.exec_with_timeout(command, limit).await?;
        if let Ok(all) = output.stdout_lines() {
            for line in all {
                if lines.send(line).await.is_err() {
                    break;
                }
            }
        }
        Ok(output)
    }
}
