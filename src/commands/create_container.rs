use super::as_root;
use crate::pipeline::{Command, CommandContext, CommandResult, ErrorKind, ProgressEvent};
use async_trait::async_trait;
use std::time::Duration;

const CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Creates the application container: data directory on the host, then
/// `docker run` with the agreed port/volume/restart wiring.
pub struct CreateContainerCommand;

#[async_trait]
impl Command for CreateContainerCommand {
    fn id(&self) -> &str {
        "create_container"
    }

    fn display_name(&self) -> &str {
        "Create application container"
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(30)
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
            .emit(ProgressEvent::info(self.id(), 0, "preparing data directory"))
            .await;
        match exec
            .exec(&as_root(&format!("mkdir -p {}", request.data_path)))
            .await
        {
            Ok(out) if out.is_success() => {}
            Ok(out) => {
                return CommandResult::failure(
                    ErrorKind::RemoteExec,
                    format!(
                        "could not create data directory {}: {}",
                        request.data_path,
                        out.stderr_tail(3)
                    ),
                    false,
                )
            }
            Err(e) => return CommandResult::from_ssh_error(&e),
        }

        ctx.progress
            .emit(ProgressEvent::info(self.id(), 0, "starting container"))
            .await;
        let run = format!(
            "docker run -d --name {name} -p {port}:8000 -v {data}:/home/node/app/data \
             --restart unless-stopped {image}",
            name = request.container_name,
            port = request.port,
            data = request.data_path,
            image = request.image
        );
        match exec.exec_with_timeout(&as_root(&run), CREATE_TIMEOUT).await {
            Ok(out) if out.is_success() => {
                tracing::info!(session = %ctx.session_id, container = %request.container_name,
                    "container created");
                CommandResult::Success
            }
            Ok(out) => CommandResult::failure(
                ErrorKind::RemoteExec,
                format!(
                    "docker run for '{}' failed: {}",
                    request.container_name,
                    out.stderr_tail(5)
                ),
                false,
            ),
            Err(e) => CommandResult::from_ssh_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::ScriptedExec;
    use crate::pipeline::context::{DeploymentRequest, DEPLOYMENT_REQUEST};
    use crate::pipeline::ProgressSink;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx_with(exec: Arc<ScriptedExec>) -> CommandContext {
        let mut ctx = CommandContext::new(
            "s1".to_string(),
            exec,
            ProgressSink::disabled(),
            CancellationToken::new(),
        );
        ctx.set(
            DEPLOYMENT_REQUEST,
            &DeploymentRequest {
                container_name: "app".to_string(),
                image: "example/app:latest".to_string(),
                port: 8000,
                data_path: "/opt/app".to_string(),
                username: None,
                password: None,
            },
        );
        ctx
    }

    #[tokio::test]
    async fn run_command_carries_the_contract_wiring() {
        let exec = Arc::new(ScriptedExec::new());
        exec.on("mkdir -p /opt/app", "", 0).await;
        exec.on("docker run", "abcdef123456", 0).await;

        let mut ctx = ctx_with(exec.clone());
        assert!(matches!(
            CreateContainerCommand.execute(&mut ctx).await,
            CommandResult::Success
        ));

        let run = exec
            .executed()
            .await
            .into_iter()
            .find(|c| c.contains("docker run"))
            .unwrap();
        assert!(run.contains("--name app"));
        assert!(run.contains("-p 8000:8000"));
        assert!(run.contains("-v /opt/app:/home/node/app/data"));
        assert!(run.contains("--restart unless-stopped"));
        assert!(run.contains("example/app:latest"));
    }

    #[tokio::test]
    async fn name_conflict_is_not_retried_blindly() {
        let exec = Arc::new(ScriptedExec::new());
        exec.on("mkdir -p", "", 0).await;
        exec.on("docker run", "", 125).await;

        let mut ctx = ctx_with(exec);
        match CreateContainerCommand.execute(&mut ctx).await {
            CommandResult::Failure { retryable, .. } => assert!(!retryable),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
