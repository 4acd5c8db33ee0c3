use crate::broker::{HandlerError, MessageBroker, SessionSender};
use crate::executor::{ConnectParams, Credential, PtyRequest, SshSession};
use crate::session::{RegistryError, SessionRegistry};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTerminalBody {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub credential: String,
    #[serde(default)]
    pub cols: Option<u32>,
    #[serde(default)]
    pub rows: Option<u32>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Deserialize)]
pub struct TerminalInputBody {
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResizeBody {
    pub cols: u32,
    pub rows: u32,
    #[serde(default)]
    pub wpx: u32,
    #[serde(default)]
    pub hpx: u32,
}

/// Bridges the interactive terminal: SSH session acquisition for a client,
/// the PTY shell channel, and the byte pipe back onto the session queue.
pub struct TerminalService {
    registry: Arc<SessionRegistry>,
    broker: Arc<MessageBroker>,
}

impl TerminalService {
    pub fn new(registry: Arc<SessionRegistry>, broker: Arc<MessageBroker>) -> Self {
        Self { registry, broker }
    }

    /// The session registry is the single owner: first caller connects,
    /// racers reuse whatever won.
    pub async fn ensure_session(
        &self,
        session_id: &str,
        params: &ConnectParams,
    ) -> Result<Arc<SshSession>, HandlerError> {
        if let Some(existing) = self.registry.get(session_id) {
            return Ok(existing);
        }
        let session = SshSession::connect(params)
            .await
            .map_err(|e| HandlerError::new("ssh-connect-failed", e.to_string()))?;
        let session = Arc::new(session);
        match self.registry.put(session_id, session.clone()) {
            Ok(()) => Ok(session),
            Err(RegistryError::Duplicate(_)) => {
                // lost the race; the registry entry wins, ours goes away
                let _ = session.disconnect().await;
                self.registry
                    .get(session_id)
                    .ok_or_else(|| HandlerError::new("session-lost", "session vanished during open"))
            }
        }
    }

    pub async fn open(&self, session_id: &str, body: OpenTerminalBody) -> Result<(), HandlerError> {
        let params = ConnectParams {
            host: body.host.clone(),
            port: body.port,
            user: body.user.clone(),
            credential: Credential::from_secret(&body.credential),
        };
        let session = self.ensure_session(session_id, &params).await?;

        let pty = PtyRequest {
            cols: body.cols.unwrap_or(80),
            rows: body.rows.unwrap_or(24),
            ..PtyRequest::default()
        };

        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(64);
        session
            .open_shell(pty, output_tx)
            .await
            .map_err(|e| HandlerError::new("shell-open-failed", e.to_string()))?;

        // Pump shell bytes onto the client's terminal queue until the
        // channel closes on either end.
        let broker = self.broker.clone();
        let owner = session_id.to_string();
        tokio::spawn(async move {
            while let Some(chunk) = output_rx.recv().await {
                broker
                    .send_to_session(
                        &owner,
                        "terminal/output",
                        json!({"data": BASE64.encode(&chunk)}),
                        false,
                    )
                    .await;
            }
            tracing::debug!(session = %owner, "terminal output pump closed");
        });

        tracing::info!(session = %session_id, host = %body.host, "terminal opened");
        Ok(())
    }

    pub async fn input(&self, session_id: &str, body: TerminalInputBody) -> Result<(), HandlerError> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| HandlerError::new("no-session", "no SSH session for this client"))?;
        let bytes = BASE64
            .decode(body.data.as_bytes())
            .map_err(|e| HandlerError::bad_request(format!("invalid base64 input: {}", e)))?;
        session
            .shell_input(bytes)
            .await
            .map_err(|e| HandlerError::new("shell-write-failed", e.to_string()))
    }

    pub async fn resize(
        &self,
        session_id: &str,
        body: TerminalResizeBody,
    ) -> Result<(), HandlerError> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| HandlerError::new("no-session", "no SSH session for this client"))?;
        session
            .shell_resize(body.cols, body.rows, body.wpx, body.hpx)
            .await
            .map_err(|e| HandlerError::new("shell-resize-failed", e.to_string()))
    }
}
