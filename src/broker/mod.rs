pub mod auth;
pub mod frame;

pub use auth::{AuthDecision, AuthError, Authenticator, Role, TokenAuthenticator};
pub use frame::{Frame, FrameCommand, FrameError, ViolationWindow, DEFAULT_MAX_FRAME_BYTES};

use crate::session::SessionId;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_frame_bytes: usize,
    pub inbound_queue: usize,
    pub writer_queue: usize,
    pub workers: usize,
    pub heartbeat_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            inbound_queue: 1000,
            writer_queue: 256,
            workers: 4,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Outbound half of the message channel as the rest of the gateway sees
/// it: values onto per-session queues, broadcasts onto topics.
#[async_trait]
pub trait SessionSender: Send + Sync {
    async fn send_to_session(
        &self,
        session_id: &str,
        topic: &str,
        payload: serde_json::Value,
        critical: bool,
    );

    async fn broadcast(&self, topic: &str, payload: serde_json::Value);
}

/// Teardown hook invoked once per session from the unified cancellation
/// path, wired by the gateway (registry eviction, orchestrator cleanup).
#[async_trait]
pub trait SessionCleanup: Send + Sync {
    async fn cleanup(&self, session_id: &str);
}

/// One inbound SEND, as handed to a destination handler.
pub struct InboundMessage {
    pub session_id: SessionId,
    pub role: Role,
    pub destination: String,
    pub body: Bytes,
}

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad-request", message)
    }
}

#[async_trait]
pub trait DestinationHandler: Send + Sync {
    async fn handle(&self, msg: InboundMessage) -> Result<(), HandlerError>;
}

struct WorkItem {
    session_id: SessionId,
    role: Role,
    destination: String,
    body: Bytes,
}

pub(crate) fn user_queue_destination(topic: &str, session_id: &str) -> String {
    format!("/queue/{}-user{}", topic, session_id)
}

fn topic_destination(topic: &str) -> String {
    format!("/topic/{}", topic)
}

/// A session queue frame is delivered when the client subscribed to either
/// spelling of the destination; a channel that has not subscribed to
/// anything yet gets everything (CONNECT-to-SUBSCRIBE grace).
fn wants_user_queue(subs: &HashSet<String>, topic: &str, session_id: &str) -> bool {
    subs.is_empty()
        || subs.contains(&format!("/user/queue/{}", topic))
        || subs.contains(&user_queue_destination(topic, session_id))
}

/// Per-client channel state: serialized writer, subscriptions, liveness.
pub struct ClientChannel {
    pub session_id: SessionId,
    pub role: Role,
    pub principal: String,
    writer_tx: mpsc::Sender<Frame>,
    subscriptions: Mutex<HashSet<String>>,
    cancel: CancellationToken,
    last_inbound_ms: AtomicU64,
    epoch: Instant,
    slow_consumer: AtomicBool,
}

impl ClientChannel {
    fn new(
        session_id: SessionId,
        role: Role,
        principal: String,
        writer_tx: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            role,
            principal,
            writer_tx,
            subscriptions: Mutex::new(HashSet::new()),
            cancel,
            last_inbound_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            slow_consumer: AtomicBool::new(false),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn touch_inbound(&self) {
        self.last_inbound_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn inbound_silence(&self) -> Duration {
        let last = Duration::from_millis(self.last_inbound_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub fn is_slow_consumer(&self) -> bool {
        self.slow_consumer.load(Ordering::Relaxed)
    }

    /// Queue a frame for this client. Critical frames wait for space so
    /// terminal events always arrive; the rest are dropped when a slow
    /// browser lets the queue fill up.
    async fn push(&self, frame: Frame, critical: bool) {
        if critical {
            if self.writer_tx.send(frame).await.is_err() {
                tracing::debug!(session = %self.session_id, "writer gone, dropping frame");
            }
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = self.writer_tx.try_send(frame) {
            if !self.slow_consumer.swap(true, Ordering::Relaxed) {
                tracing::warn!(session = %self.session_id,
                    "client is a slow consumer, dropping non-critical frames");
            }
        }
    }
}

/// Routes frames between WebSocket clients and destination handlers:
/// bounded inbound queue with backpressure, a small worker pool for
/// dispatch, one serialized writer per client, heartbeats, and the single
/// cancellation path every teardown trigger funnels through.
pub struct MessageBroker {
    config: BrokerConfig,
    authenticator: Arc<dyn Authenticator>,
    handlers: DashMap<String, Arc<dyn DestinationHandler>>,
    channels: DashMap<SessionId, Arc<ClientChannel>>,
    work_tx: mpsc::Sender<WorkItem>,
    work_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    cleanup: OnceLock<Arc<dyn SessionCleanup>>,
}

impl MessageBroker {
    pub fn new(config: BrokerConfig, authenticator: Arc<dyn Authenticator>) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::channel(config.inbound_queue);
        Arc::new(Self {
            config,
            authenticator,
            handlers: DashMap::new(),
            channels: DashMap::new(),
            work_tx,
            work_rx: Arc::new(Mutex::new(work_rx)),
            cleanup: OnceLock::new(),
        })
    }

    pub fn register_handler(&self, destination: &str, handler: Arc<dyn DestinationHandler>) {
        self.handlers.insert(destination.to_string(), handler);
    }

    pub fn set_cleanup(&self, cleanup: Arc<dyn SessionCleanup>) {
        let _ = self.cleanup.set(cleanup);
    }

    pub fn session_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.channels.get(session_id).map(|c| c.cancel_token())
    }

    pub fn channel(&self, session_id: &str) -> Option<Arc<ClientChannel>> {
        self.channels.get(session_id).map(|c| c.clone())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Spawn the shared dispatch workers. Called once at startup.
    pub fn spawn_workers(self: &Arc<Self>) {
        for worker in 0..self.config.workers.max(1) {
            let broker = self.clone();
            tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = broker.work_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(item) = item else { break };
                    broker.dispatch(item).await;
                }
                tracing::debug!(worker, "dispatch worker stopped");
            });
        }
    }

    async fn dispatch(&self, item: WorkItem) {
        let handler = self.handlers.get(&item.destination).map(|h| h.clone());
        let Some(handler) = handler else {
            if let Some(channel) = self.channel(&item.session_id) {
                channel
                    .push(Frame::error("no-handler", &item.destination), true)
                    .await;
            }
            return;
        };

        let session_id = item.session_id.clone();
        let destination = item.destination.clone();
        if let Err(e) = handler
            .handle(InboundMessage {
                session_id: item.session_id,
                role: item.role,
                destination: item.destination,
                body: item.body,
            })
            .await
        {
            tracing::warn!(session = %session_id, destination = %destination,
                "handler failed: {}", e);
            self.send_to_session(
                &session_id,
                "error",
                json!({"code": e.code, "message": e.message}),
                true,
            )
            .await;
        }
    }

    /// Drive one WebSocket connection through its lifetime. Returns when
    /// the channel dies for any reason; cleanup has run by then.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket, remote_addr: String) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(self.config.writer_queue);

        // One writer per client; everything outbound is serialized here.
        let writer = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if ws_tx.send(Message::Binary(frame.encode())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let mut violations = ViolationWindow::default();
        let mut channel: Option<Arc<ClientChannel>> = None;
        let mut heartbeat: Option<tokio::task::JoinHandle<()>> = None;
        // Fired by any teardown trigger (heartbeat timeout, idle eviction,
        // explicit cancel); the reader must notice and release the socket.
        let conn_token = CancellationToken::new();

        loop {
            let message = tokio::select! {
                _ = conn_token.cancelled() => break,
                message = ws_rx.next() => message,
            };
            let Some(message) = message else { break };
            let raw: Bytes = match message {
                Ok(Message::Binary(b)) => b,
                Ok(Message::Text(t)) => Bytes::from(t.as_bytes().to_vec()),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(_) => break,
            };

            let frame = match Frame::decode(&raw, self.config.max_frame_bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(remote = %remote_addr, "invalid frame: {}", e);
                    let _ = writer_tx
                        .send(Frame::error("invalid-frame", &e.to_string()))
                        .await;
                    if violations.record(Instant::now()) {
                        tracing::warn!(remote = %remote_addr,
                            "closing channel after repeated protocol violations");
                        break;
                    }
                    continue;
                }
            };

            if let Some(channel) = &channel {
                channel.touch_inbound();
            }

            match frame.command {
                FrameCommand::Connect => {
                    if channel.is_some() {
                        // Second CONNECT on a live channel: protocol
                        // violation, first session is retained.
                        let _ = writer_tx
                            .send(Frame::error("already-connected", "session already established"))
                            .await;
                        continue;
                    }
                    match self
                        .authenticator
                        .authenticate(frame.headers(), &remote_addr)
                        .await
                    {
                        Ok(decision) => {
                            let session_id = uuid::Uuid::new_v4().to_string();
                            let new_channel = Arc::new(ClientChannel::new(
                                session_id.clone(),
                                decision.role,
                                decision.principal,
                                writer_tx.clone(),
                                conn_token.clone(),
                            ));
                            new_channel.touch_inbound();
                            self.channels.insert(session_id.clone(), new_channel.clone());
                            let _ = writer_tx.send(Frame::connected(&session_id)).await;
                            self.broadcast(
                                "session-lifecycle",
                                json!({"sessionId": session_id, "event": "connected"}),
                            )
                            .await;
                            heartbeat = Some(self.spawn_heartbeat(new_channel.clone()));
                            tracing::info!(session = %session_id, remote = %remote_addr,
                                role = ?new_channel.role, "client connected");
                            channel = Some(new_channel);
                        }
                        Err(e) => {
                            let _ = writer_tx.send(Frame::error("auth-failed", &e.to_string())).await;
                            break;
                        }
                    }
                }
                FrameCommand::Heartbeat => {}
                _ => {
                    let Some(ch) = channel.as_ref() else {
                        let _ = writer_tx
                            .send(Frame::error("not-connected", "CONNECT must be the first frame"))
                            .await;
                        if violations.record(Instant::now()) {
                            break;
                        }
                        continue;
                    };
                    match frame.command {
                        FrameCommand::Subscribe => {
                            if let Some(dest) = frame.destination() {
                                ch.subscriptions.lock().await.insert(dest.to_string());
                            }
                        }
                        FrameCommand::Unsubscribe => {
                            if let Some(dest) = frame.destination() {
                                ch.subscriptions.lock().await.remove(dest);
                            }
                        }
                        FrameCommand::Send => {
                            let Some(destination) = frame.destination() else {
                                let _ = writer_tx
                                    .send(Frame::error("bad-frame", "SEND requires a destination"))
                                    .await;
                                continue;
                            };
                            let item = WorkItem {
                                session_id: ch.session_id.clone(),
                                role: ch.role,
                                destination: destination.to_string(),
                                body: frame.body.clone(),
                            };
                            // A full dispatch queue pauses this reader,
                            // which transitively flow-controls the client.
                            if self.work_tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        FrameCommand::Disconnect => break,
                        _ => {
                            let _ = writer_tx
                                .send(Frame::error("unexpected-frame", "server-only command"))
                                .await;
                            if violations.record(Instant::now()) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Some(hb) = heartbeat {
            hb.abort();
        }
        if let Some(channel) = channel {
            self.cancel_session(&channel.session_id).await;
        }
        // Let queued frames (auth errors, terminal events) flush before the
        // socket goes away for good.
        drop(writer_tx);
        let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
    }

    fn spawn_heartbeat(self: &Arc<Self>, channel: Arc<ClientChannel>) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if channel.cancel.is_cancelled() {
                    break;
                }
                if channel.inbound_silence() > interval * 2 {
                    tracing::info!(session = %channel.session_id,
                        "heartbeat timeout, declaring channel dead");
                    broker.cancel_session(&channel.session_id).await;
                    break;
                }
                channel.push(Frame::heartbeat(), true).await;
            }
        })
    }

    /// The one teardown routine: DISCONNECT, socket close, heartbeat
    /// timeout and idle eviction all end up here. Fires the session token,
    /// runs the wired cleanup (registry eviction closes the SSH shell
    /// first), announces the lifecycle event.
    pub async fn cancel_session(&self, session_id: &str) {
        let Some((_, channel)) = self.channels.remove(session_id) else {
            return;
        };
        channel.cancel.cancel();
        if let Some(cleanup) = self.cleanup.get() {
            cleanup.cleanup(session_id).await;
        }
        self.broadcast(
            "session-lifecycle",
            json!({"sessionId": session_id, "event": "disconnected"}),
        )
        .await;
        tracing::info!(session = %session_id, "session closed");
    }
}

#[async_trait]
impl SessionSender for MessageBroker {
    async fn send_to_session(
        &self,
        session_id: &str,
        topic: &str,
        payload: serde_json::Value,
        critical: bool,
    ) {
        let Some(channel) = self.channel(session_id) else {
            tracing::debug!(session = %session_id, topic = %topic,
                "dropping message for unknown session");
            return;
        };
        {
            let subs = channel.subscriptions.lock().await;
            if !wants_user_queue(&subs, topic, session_id) {
                return;
            }
        }
        let destination = user_queue_destination(topic, session_id);
        let body = serde_json::to_vec(&payload).unwrap_or_default();
        let frame = Frame::message(&destination, body).with_header("content-type", "application/json");
        channel.push(frame, critical).await;
    }

    async fn broadcast(&self, topic: &str, payload: serde_json::Value) {
        let destination = topic_destination(topic);
        let body = serde_json::to_vec(&payload).unwrap_or_default();
        let subscribers: Vec<Arc<ClientChannel>> =
            self.channels.iter().map(|e| e.value().clone()).collect();
        for channel in subscribers {
            let subscribed = channel.subscriptions.lock().await.contains(&destination);
            if subscribed {
                let frame = Frame::message(&destination, body.clone())
                    .with_header("content-type", "application/json");
                channel.push(frame, false).await;
            }
        }
    }
}
