use super::error::SshError;
use super::traits::RemoteExec;
use super::types::ExecOutput;
use async_trait::async_trait;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::{client, keys, ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SHELL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Authentication material supplied by the client in the open-terminal or
/// deployment request. An inline OpenSSH private key is recognized by its
/// PEM header; anything else is treated as a password.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    PrivateKey {
        pem: String,
        passphrase: Option<String>,
    },
}

impl Credential {
    pub fn from_secret(secret: &str) -> Self {
        if secret.trim_start().starts_with("-----BEGIN") {
            Credential::PrivateKey {
                pem: secret.to_string(),
                passphrase: None,
            }
        } else {
            Credential::Password(secret.to_string())
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Credential::Password(..)"),
            Credential::PrivateKey { .. } => f.write_str("Credential::PrivateKey(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
}

/// PTY geometry requested for the interactive shell channel.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
            width_px: 0,
            height_px: 0,
        }
    }
}

/// Tracks the last moment any byte I/O happened on a session. The registry
/// sweeper uses this for idle eviction.
pub struct ActivityTracker {
    started: Instant,
    last_ms: AtomicU64,
}

impl ActivityTracker {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

enum ShellCommand {
    Data(Vec<u8>),
    Resize {
        cols: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
    },
    Close,
}

struct ShellHandle {
    cmd_tx: mpsc::Sender<ShellCommand>,
}

/// A client handler that accepts the server key on first contact. The
/// gateway talks to servers its users point it at; key pinning happens
/// above this layer if an operator wants it.
struct GatewayHandler;

impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "accepting server host key (fingerprint: {})",
            server_public_key.fingerprint(Default::default())
        );
        Ok(true)
    }
}

/// One authenticated SSH session to a target server: the transport handle,
/// at most one PTY shell channel, and a lazily opened SFTP channel.
///
/// `disconnect` is idempotent and closes shell, then SFTP, then the
/// transport; any operation after it returns `ConnectionClosed`.
pub struct SshSession {
    handle: client::Handle<GatewayHandler>,
    shell: Mutex<Option<ShellHandle>>,
    sftp: Mutex<Option<Arc<SftpSession>>>,
    closed: AtomicBool,
    activity: Arc<ActivityTracker>,
}

impl SshSession {
    /// Establish and authenticate a session. Connect timeout 30 s,
    /// keepalive every 30 s with at most 3 misses.
    pub async fn connect(params: &ConnectParams) -> Result<Self, SshError> {
        let addr = tokio::net::lookup_host((params.host.as_str(), params.port))
            .await
            .map_err(|e| SshError::Network(format!("failed to resolve '{}': {}", params.host, e)))?
            .next()
            .ok_or_else(|| {
                SshError::Network(format!("no addresses found for '{}'", params.host))
            })?;

        let config = client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..Default::default()
        };

        let mut handle = timeout(
            CONNECT_TIMEOUT,
            client::connect(Arc::new(config), addr, GatewayHandler),
        )
        .await
        .map_err(|_| SshError::ConnectTimeout(CONNECT_TIMEOUT))?
        .map_err(SshError::from)?;

        match &params.credential {
            Credential::Password(password) => {
                let result = handle
                    .authenticate_password(&params.user, password)
                    .await
                    .map_err(SshError::from)?;
                if !result.success() {
                    return Err(SshError::Auth(format!(
                        "password authentication rejected for user '{}'",
                        params.user
                    )));
                }
            }
            Credential::PrivateKey { pem, passphrase } => {
                let key = keys::decode_secret_key(pem, passphrase.as_deref())
                    .map_err(|e| SshError::Auth(format!("invalid private key: {}", e)))?;
                let best_hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(SshError::from)?
                    .flatten();
                let result = handle
                    .authenticate_publickey(
                        &params.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), best_hash),
                    )
                    .await
                    .map_err(SshError::from)?;
                if !result.success() {
                    return Err(SshError::Auth(format!(
                        "public key authentication rejected for user '{}'",
                        params.user
                    )));
                }
            }
        }

        tracing::debug!(host = %params.host, port = params.port, user = %params.user,
            "SSH session established");

        Ok(Self {
            handle,
            shell: Mutex::new(None),
            sftp: Mutex::new(None),
            closed: AtomicBool::new(false),
            activity: Arc::new(ActivityTracker::new()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn activity(&self) -> Arc<ActivityTracker> {
        self.activity.clone()
    }

    fn ensure_open(&self) -> Result<(), SshError> {
        if self.is_closed() {
            Err(SshError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Open the PTY shell channel. Output bytes (stdout and stderr merged,
    /// as the PTY does) are delivered on `output`; the sender is dropped
    /// when the remote side closes the channel.
    ///
    /// At most one shell channel per session.
    pub async fn open_shell(
        &self,
        pty: PtyRequest,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), SshError> {
        self.ensure_open()?;

        let mut guard = self.shell.lock().await;
        if guard.is_some() {
            return Err(SshError::Protocol(
                "shell channel already open for this session".to_string(),
            ));
        }

        let channel = timeout(SHELL_CONNECT_TIMEOUT, self.handle.channel_open_session())
            .await
            .map_err(|_| SshError::ConnectTimeout(SHELL_CONNECT_TIMEOUT))?
            .map_err(SshError::from)?;

        channel
            .request_pty(
                true,
                &pty.term,
                pty.cols,
                pty.rows,
                pty.width_px,
                pty.height_px,
                &[],
            )
            .await
            .map_err(SshError::from)?;
        channel.request_shell(true).await.map_err(SshError::from)?;

        let (mut read_half, write_half) = channel.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(64);
        let activity = self.activity.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ShellCommand::Data(bytes)) => {
                            activity.touch();
                            let mut writer = write_half.make_writer();
                            if writer.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(ShellCommand::Resize { cols, rows, width_px, height_px }) => {
                            let _ = write_half
                                .window_change(cols, rows, width_px, height_px)
                                .await;
                        }
                        Some(ShellCommand::Close) | None => {
                            let _ = write_half.close().await;
                            break;
                        }
                    },
                    msg = read_half.wait() => match msg {
                        Some(ChannelMsg::Data { data })
                        | Some(ChannelMsg::ExtendedData { data, .. }) => {
                            activity.touch();
                            if output.send(data.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof)
                        | Some(ChannelMsg::Close)
                        | Some(ChannelMsg::ExitStatus { .. }) => break,
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            tracing::debug!("shell channel pump finished");
        });

        *guard = Some(ShellHandle { cmd_tx });
        Ok(())
    }

    /// Write bytes to the shell's stdin.
    pub async fn shell_input(&self, data: Vec<u8>) -> Result<(), SshError> {
        self.ensure_open()?;
        let guard = self.shell.lock().await;
        let shell = guard.as_ref().ok_or(SshError::ConnectionClosed)?;
        shell
            .cmd_tx
            .send(ShellCommand::Data(data))
            .await
            .map_err(|_| SshError::ConnectionClosed)
    }

    /// Resize the shell PTY.
    pub async fn shell_resize(
        &self,
        cols: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
    ) -> Result<(), SshError> {
        self.ensure_open()?;
        let guard = self.shell.lock().await;
        let shell = guard.as_ref().ok_or(SshError::ConnectionClosed)?;
        shell
            .cmd_tx
            .send(ShellCommand::Resize {
                cols,
                rows,
                width_px,
                height_px,
            })
            .await
            .map_err(|_| SshError::ConnectionClosed)
    }

    /// If not already present, open the SFTP subsystem channel and cache it.
    pub async fn open_sftp(&self) -> Result<Arc<SftpSession>, SshError> {
        self.ensure_open()?;

        let mut guard = self.sftp.lock().await;
        if let Some(sftp) = guard.as_ref() {
            return Ok(sftp.clone());
        }

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::from)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(SshError::from)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?;

        let sftp = Arc::new(sftp);
        *guard = Some(sftp.clone());
        Ok(sftp)
    }

    /// Close shell, then SFTP, then the transport. Safe to call from any
    /// number of places; only the first call does work.
    pub async fn disconnect(&self) -> Result<(), SshError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Shell first so any pending read unblocks before the transport goes.
        if let Some(shell) = self.shell.lock().await.take() {
            let _ = shell.cmd_tx.send(ShellCommand::Close).await;
        }
        self.sftp.lock().await.take();

        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(SshError::from)
    }
}

#[async_trait]
impl RemoteExec for SshSession {
    async fn exec_with_timeout(
        &self,
        command: &str,
        limit: Duration,
    ) -> Result<ExecOutput, SshError> {
        self.ensure_open()?;
        self.activity.touch();

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::from)?;
        channel.exec(true, command).await.map_err(SshError::from)?;

        let collect = async {
            let mut output = ExecOutput::new();
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => {
                        output.stdout.extend_from_slice(&data);
                    }
                    ChannelMsg::ExtendedData { data, .. } => {
                        output.stderr.extend_from_slice(&data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        output.exit_code = exit_status;
                    }
                    _ => {}
                }
            }
            output
        };

        let mut output = timeout(limit, collect)
            .await
            .map_err(|_| SshError::Timeout(limit))?;
        output.stop_timing();
        self.activity.touch();

        tracing::debug!(
            "remote command '{}' completed with exit code {}",
            command,
            output.exit_code
        );
        Ok(output)
    }

    async fn exec_streamed(
        &self,
        command: &str,
        limit: Duration,
        lines: mpsc::Sender<String>,
    ) -> Result<ExecOutput, SshError> {
        self.ensure_open()?;
        self.activity.touch();

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::from)?;
        channel.exec(true, command).await.map_err(SshError::from)?;

        let activity = self.activity.clone();
        let collect = async {
            let mut output = ExecOutput::new();
            let mut pending = Vec::new();
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => {
                        activity.touch();
                        output.stdout.extend_from_slice(&data);
                        pending.extend_from_slice(&data);
                        // Forward whole lines; keep the trailing partial.
                        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = pending.drain(..=pos).collect();
                            let text = String::from_utf8_lossy(&line).trim_end().to_string();
                            if !text.is_empty() {
                                let _ = lines.send(text).await;
                            }
                        }
                    }
                    ChannelMsg::ExtendedData { data, .. } => {
                        output.stderr.extend_from_slice(&data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        output.exit_code = exit_status;
                    }
                    _ => {}
                }
            }
            if !pending.is_empty() {
                let text = String::from_utf8_lossy(&pending).trim_end().to_string();
                if !text.is_empty() {
                    let _ = lines.send(text).await;
                }
            }
            output
        };

        let mut output = timeout(limit, collect)
            .await
            .map_err(|_| SshError::Timeout(limit))?;
        output.stop_timing();
        self.activity.touch();
        Ok(output)
    }
}
