use super::terminal::{OpenTerminalBody, TerminalInputBody, TerminalResizeBody, TerminalService};
use crate::broker::{
    DestinationHandler, HandlerError, InboundMessage, MessageBroker, Role, SessionSender,
};
use crate::executor::{ConnectParams, Credential};
use crate::orchestrator::{DeploymentOrchestrator, OrchestratorError};
use crate::pipeline::context::DeploymentRequest;
use crate::pipeline::{ConfirmAction, PipelineMode};
use crate::session::SessionRegistry;
use crate::transfer::{DataTransferService, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, HandlerError> {
    serde_json::from_slice(body)
        .map_err(|e| HandlerError::bad_request(format!("malformed request body: {}", e)))
}

fn require_admin(role: Role) -> Result<(), HandlerError> {
    if role == Role::Admin {
        Ok(())
    } else {
        Err(HandlerError::new(
            "forbidden",
            "this operation requires an admin connection",
        ))
    }
}

// --- terminal ---------------------------------------------------------

pub struct TerminalOpenHandler(pub Arc<TerminalService>);

#[async_trait]
impl DestinationHandler for TerminalOpenHandler {
    async fn handle(&self, msg: InboundMessage) -> Result<(), HandlerError> {
        let body: OpenTerminalBody = parse_body(&msg.body)?;
        self.0.open(&msg.session_id, body).await
    }
}

pub struct TerminalInputHandler(pub Arc<TerminalService>);

#[async_trait]
impl DestinationHandler for TerminalInputHandler {
    async fn handle(&self, msg: InboundMessage) -> Result<(), HandlerError> {
        let body: TerminalInputBody = parse_body(&msg.body)?;
        self.0.input(&msg.session_id, body).await
    }
}

pub struct TerminalResizeHandler(pub Arc<TerminalService>);

#[async_trait]
impl DestinationHandler for TerminalResizeHandler {
    async fn handle(&self, msg: InboundMessage) -> Result<(), HandlerError> {
        let body: TerminalResizeBody = parse_body(&msg.body)?;
        self.0.resize(&msg.session_id, body).await
    }
}

// --- deployment -------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPipelineBody {
    task_name: String,
    #[serde(default)]
    mode: Option<String>,
    request: StartRequest,
}

/// SSH target and deployment parameters travel together in the start
/// request; `port` is the container's published port, `sshPort` the SSH
/// one (22 when absent).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    host: String,
    #[serde(default = "default_ssh_port")]
    ssh_port: u16,
    user: String,
    credential: String,
    #[serde(default)]
    container_name: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    data_path: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn parse_mode(mode: Option<&str>) -> Result<PipelineMode, HandlerError> {
    match mode {
        None | Some("trust") => Ok(PipelineMode::Trust),
        Some("confirmation") => Ok(PipelineMode::Confirmation),
        Some(other) => Err(HandlerError::bad_request(format!(
            "unknown pipeline mode '{}'",
            other
        ))),
    }
}

pub struct DeploymentStartHandler {
    pub terminal: Arc<TerminalService>,
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub broker: Arc<MessageBroker>,
}

#[async_trait]
impl DestinationHandler for DeploymentStartHandler {
    async fn handle(&self, msg: InboundMessage) -> Result<(), HandlerError> {
        require_admin(msg.role)?;
        let body: StartPipelineBody = parse_body(&msg.body)?;
        let mode = parse_mode(body.mode.as_deref())?;

        let params = ConnectParams {
            host: body.request.host.clone(),
            port: body.request.ssh_port,
            user: body.request.user.clone(),
            credential: Credential::from_secret(&body.request.credential),
        };
        let session = self.terminal.ensure_session(&msg.session_id, &params).await?;

        let deployment = body.request.container_name.as_ref().map(|name| {
            DeploymentRequest {
                container_name: name.clone(),
                image: body
                    .request
                    .image
                    .clone()
                    .unwrap_or_else(|| "ghcr.io/sillytavern/sillytavern:latest".to_string()),
                port: body.request.port.unwrap_or(8000),
                data_path: body
                    .request
                    .data_path
                    .clone()
                    .unwrap_or_else(|| format!("/opt/{}/data", name)),
                username: body.request.username.clone(),
                password: body.request.password.clone(),
            }
        });

        let cancel = self
            .broker
            .session_token(&msg.session_id)
            .ok_or_else(|| HandlerError::new("no-session", "channel is gone"))?;

        self.orchestrator
            .start_pipeline(
                &msg.session_id,
                &body.task_name,
                mode,
                body.request.host.clone(),
                deployment,
                session,
                &cancel,
            )
            .await
            .map_err(|e| match e {
                OrchestratorError::UnknownTask(_) => HandlerError::new("unknown-task", e.to_string()),
                OrchestratorError::Busy => HandlerError::new("busy", e.to_string()),
            })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmBody {
    step_id: String,
    action: String,
    #[serde(default)]
    #[allow(dead_code)]
    reason: Option<String>,
}

pub struct DeploymentConfirmHandler(pub Arc<DeploymentOrchestrator>);

#[async_trait]
impl DestinationHandler for DeploymentConfirmHandler {
    async fn handle(&self, msg: InboundMessage) -> Result<(), HandlerError> {
        let body: ConfirmBody = parse_body(&msg.body)?;
        let action = match body.action.as_str() {
            "confirm" => ConfirmAction::Confirm,
            "skip" => ConfirmAction::Skip,
            "cancel" => ConfirmAction::Cancel,
            other => {
                return Err(HandlerError::bad_request(format!(
                    "unknown confirmation action '{}'",
                    other
                )))
            }
        };
        self.0.handle_confirmation(&msg.session_id, &body.step_id, action);
        Ok(())
    }
}

pub struct DeploymentCancelHandler(pub Arc<DeploymentOrchestrator>);

#[async_trait]
impl DestinationHandler for DeploymentCancelHandler {
    async fn handle(&self, msg: InboundMessage) -> Result<(), HandlerError> {
        self.0.cancel(&msg.session_id);
        Ok(())
    }
}

pub struct DeploymentStatusHandler {
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub broker: Arc<MessageBroker>,
}

#[async_trait]
impl DestinationHandler for DeploymentStatusHandler {
    async fn handle(&self, msg: InboundMessage) -> Result<(), HandlerError> {
        let state = self.orchestrator.status(&msg.session_id).await;
        let payload = match state {
            Some(state) => serde_json::to_value(&state).unwrap_or_default(),
            None => json!({"status": "idle"}),
        };
        self.broker
            .send_to_session(&msg.session_id, "deployment/status", payload, true)
            .await;
        Ok(())
    }
}

// --- data import/export -----------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportBody {
    #[serde(default = "default_container")]
    container_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportBody {
    uploaded_file_name: String,
    #[serde(default = "default_container")]
    container_name: String,
}

fn default_container() -> String {
    "sillytavern".to_string()
}

/// Uploaded file names must not walk out of the upload directory.
fn resolve_upload(upload_dir: &Path, name: &str) -> Result<PathBuf, HandlerError> {
    let candidate = Path::new(name);
    let ok = candidate.components().all(|c| matches!(c, Component::Normal(_)));
    if !ok || name.is_empty() {
        return Err(HandlerError::bad_request(format!(
            "invalid uploaded file name '{}'",
            name
        )));
    }
    Ok(upload_dir.join(candidate))
}

pub struct DataExportHandler {
    pub registry: Arc<SessionRegistry>,
    pub transfer: Arc<DataTransferService>,
    pub broker: Arc<MessageBroker>,
}

#[async_trait]
impl DestinationHandler for DataExportHandler {
    async fn handle(&self, msg: InboundMessage) -> Result<(), HandlerError> {
        require_admin(msg.role)?;
        let body: ExportBody = parse_body(&msg.body)?;
        let session = self
            .registry
            .get(&msg.session_id)
            .ok_or_else(|| HandlerError::new("no-session", "no SSH session for this client"))?;
        let cancel = self
            .broker
            .session_token(&msg.session_id)
            .ok_or_else(|| HandlerError::new("no-session", "channel is gone"))?;

        let transfer = self.transfer.clone();
        let broker = self.broker.clone();
        let session_id = msg.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = transfer
                .export(&session_id, session, &body.container_name, cancel)
                .await
            {
                tracing::warn!(session = %session_id, "export failed: {}", e);
                broker
                    .send_to_session(
                        &session_id,
                        "data/export-progress",
                        json!({"stage": "error", "message": e.to_string()}),
                        true,
                    )
                    .await;
            }
        });
        Ok(())
    }
}

pub struct DataImportHandler {
    pub registry: Arc<SessionRegistry>,
    pub transfer: Arc<DataTransferService>,
    pub broker: Arc<MessageBroker>,
    pub upload_dir: PathBuf,
}

#[async_trait]
impl DestinationHandler for DataImportHandler {
    async fn handle(&self, msg: InboundMessage) -> Result<(), HandlerError> {
        require_admin(msg.role)?;
        let body: ImportBody = parse_body(&msg.body)?;
        let archive_path = resolve_upload(&self.upload_dir, &body.uploaded_file_name)?;
        let session = self
            .registry
            .get(&msg.session_id)
            .ok_or_else(|| HandlerError::new("no-session", "no SSH session for this client"))?;
        let cancel = self
            .broker
            .session_token(&msg.session_id)
            .ok_or_else(|| HandlerError::new("no-session", "channel is gone"))?;

        let transfer = self.transfer.clone();
        let broker = self.broker.clone();
        let session_id = msg.session_id.clone();
        tokio::spawn(async move {
            let result = transfer
                .import(&session_id, session, &body.container_name, &archive_path, cancel)
                .await;
            let _ = tokio::fs::remove_file(&archive_path).await;
            if let Err(e) = result {
                tracing::warn!(session = %session_id, "import failed: {}", e);
                let code = match &e {
                    TransferError::InvalidArchive(_) | TransferError::TooLarge { .. } => "data-error",
                    TransferError::RollbackApplied(_) => "rollback-applied",
                    TransferError::Busy => "busy",
                    _ => "import-failed",
                };
                broker
                    .send_to_session(
                        &session_id,
                        "data/import-progress",
                        json!({"stage": "error", "message": e.to_string()}),
                        true,
                    )
                    .await;
                broker
                    .send_to_session(
                        &session_id,
                        "error",
                        json!({"code": code, "message": e.to_string()}),
                        true,
                    )
                    .await;
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing_accepts_the_two_modes() {
        assert_eq!(parse_mode(None).unwrap(), PipelineMode::Trust);
        assert_eq!(parse_mode(Some("trust")).unwrap(), PipelineMode::Trust);
        assert_eq!(
            parse_mode(Some("confirmation")).unwrap(),
            PipelineMode::Confirmation
        );
        assert!(parse_mode(Some("yolo")).is_err());
    }

    #[test]
    fn upload_names_cannot_traverse() {
        let dir = Path::new("/var/uploads");
        assert!(resolve_upload(dir, "export.zip").is_ok());
        assert!(resolve_upload(dir, "nested/export.zip").is_ok());
        assert!(resolve_upload(dir, "../etc/passwd").is_err());
        assert!(resolve_upload(dir, "/etc/passwd").is_err());
        assert!(resolve_upload(dir, "").is_err());
    }

    #[test]
    fn start_request_defaults() {
        let body: StartPipelineBody = serde_json::from_value(json!({
            "taskName": "deploy",
            "mode": "trust",
            "request": {
                "host": "1.2.3.4",
                "user": "root",
                "credential": "pw",
                "containerName": "app",
                "image": "example/app:latest",
                "port": 8000,
                "dataPath": "/opt/app"
            }
        }))
        .unwrap();
        assert_eq!(body.request.ssh_port, 22);
        assert_eq!(body.request.port, Some(8000));
    }
}
