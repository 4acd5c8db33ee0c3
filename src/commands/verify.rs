use super::as_root;
use crate::pipeline::{Command, CommandContext, CommandResult, ErrorKind, ProgressEvent};
use async_trait::async_trait;
use std::time::Duration;

/// Confirms the deployment actually serves: the container must be listed
/// as running and the HTTP endpoint on the mapped port must answer with a
/// 2xx/3xx from the target's loopback.
pub struct VerifyCommand;

fn http_code_ok(code: &str) -> bool {
    matches!(code.parse::<u16>(), Ok(c) if (200..400).contains(&c))
}

#[async_trait]
impl Command for VerifyCommand {
    fn id(&self) -> &str {
        "verify"
    }

    fn display_name(&self) -> &str {
        "Verify deployment"
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> CommandResult {
        let Some(request) = ctx.deployment_request() else {
            return CommandResult::failure(
                ErrorKind::Config,
                "no deployment request in context",
                false,
            );
        };
        let exec = ctx.exec();

        ctx.progress
            .emit(ProgressEvent::info(self.id(), 0, "checking container state"))
            .await;
        let ps = format!(
            "docker ps --filter name=^{}$ --format '{{{{.Names}}}}'",
            request.container_name
        );
        match exec.exec(&as_root(&ps)).await {
            Ok(out) if out.is_success() && out.contains(&request.container_name) => {}
            Ok(out) => {
                return CommandResult::failure(
                    ErrorKind::RemoteExec,
                    format!(
                        "container '{}' is not running: {}",
                        request.container_name,
                        out.stderr_tail(3)
                    ),
                    true,
                )
            }
            Err(e) => return CommandResult::from_ssh_error(&e),
        }

        ctx.progress
            .emit(ProgressEvent::info(self.id(), 0, "probing http endpoint"))
            .await;
        let probe = format!(
            "curl -sS -o /dev/null -w \"%{{http_code}}\" http://127.0.0.1:{}/",
            request.port
        );
        match exec.exec(&probe).await {
            Ok(out) if out.is_success() && http_code_ok(&out.stdout_trimmed()) => {
                tracing::info!(session = %ctx.session_id, container = %request.container_name,
                    "deployment verified");
                CommandResult::Success
            }
            Ok(out) => CommandResult::failure(
                ErrorKind::RemoteExec,
                format!(
                    "http probe on port {} answered '{}'",
                    request.port,
                    out.stdout_trimmed()
                ),
                true,
            ),
            Err(e) => CommandResult::from_ssh_error(&e),
        }
    }
}
