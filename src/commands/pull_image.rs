use super::{as_root, PULL_TIMEOUT};
use crate::pipeline::{Command, CommandContext, CommandResult, ErrorKind, ProgressEvent, RateGate};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// `docker pull` with the registry's layer chatter forwarded as progress
/// messages, paced so a busy pull does not flood the client queue.
pub struct PullImageCommand;

#[async_trait]
impl Command for PullImageCommand {
    fn id(&self) -> &str {
        "pull_image"
    }

    fn display_name(&self) -> &str {
        "Pull container image"
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(180)
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
        let progress = ctx.progress.clone();
        let stage = self.id().to_string();
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);

        let forwarder = tokio::spawn(async move {
            let mut gate = RateGate::new(10);
            while let Some(line) = line_rx.recv().await {
                if gate.ready() {
                    progress.emit(ProgressEvent::info(&stage, 0, line)).await;
                }
            }
        });

        let command = as_root(&format!("docker pull {}", request.image));
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                forwarder.abort();
                return CommandResult::cancelled();
            }
            r = exec.exec_streamed(&command, PULL_TIMEOUT, line_tx) => r,
        };
        let _ = forwarder.await;

        match result {
            Ok(out) if out.is_success() => {
                tracing::info!(session = %ctx.session_id, image = %request.image, "image pulled");
                CommandResult::Success
            }
            Ok(out) => CommandResult::failure(
                ErrorKind::RemoteExec,
                format!("docker pull {} failed: {}", request.image, out.stderr_tail(5)),
                true,
            ),
            Err(e) => CommandResult::from_ssh_error(&e),
        }
    }
}
