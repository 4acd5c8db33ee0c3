pub mod handlers;
pub mod terminal;

use crate::broker::{BrokerConfig, MessageBroker, SessionCleanup, TokenAuthenticator};
use crate::config::GatewayConfig;
use crate::orchestrator::{DeploymentOrchestrator, OrchestratorConfig};
use crate::session::SessionRegistry;
use crate::transfer::{ArtifactStore, ClaimError, DataTransferService, TransferConfig};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;

use handlers::{
    DataExportHandler, DataImportHandler, DeploymentCancelHandler, DeploymentConfirmHandler,
    DeploymentStartHandler, DeploymentStatusHandler, TerminalInputHandler, TerminalOpenHandler,
    TerminalResizeHandler,
};
use terminal::TerminalService;

const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Composition root: broker, registry, orchestrator and transfer service
/// wired together behind one HTTP surface.
pub struct Gateway {
    pub config: GatewayConfig,
    pub broker: Arc<MessageBroker>,
    pub registry: Arc<SessionRegistry>,
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub transfer: Arc<DataTransferService>,
    pub store: Arc<ArtifactStore>,
}

/// What "session gone" means beyond the channel itself: deployment state
/// dropped and the SSH session evicted (which closes its shell first, so
/// pending reads unblock).
struct GatewayCleanup {
    registry: Arc<SessionRegistry>,
    orchestrator: Arc<DeploymentOrchestrator>,
}

#[async_trait]
impl SessionCleanup for GatewayCleanup {
    async fn cleanup(&self, session_id: &str) {
        self.orchestrator.forget(session_id);
        self.registry.remove(session_id).await;
    }
}

pub fn build(config: GatewayConfig) -> Arc<Gateway> {
    let authenticator = Arc::new(TokenAuthenticator::new(
        config.admin_token.clone(),
        config.allow_anonymous,
    ));
    let broker = MessageBroker::new(
        BrokerConfig {
            max_frame_bytes: config.frame_max_bytes,
            inbound_queue: config.inbound_queue,
            writer_queue: config.writer_queue,
            workers: config.worker_pool_max.max(config.worker_pool_min),
            heartbeat_interval: Duration::from_secs(10),
        },
        authenticator,
    );
    let registry = Arc::new(SessionRegistry::new());
    let orchestrator = Arc::new(DeploymentOrchestrator::new(
        OrchestratorConfig {
            geo_endpoints: config.geo_endpoints.clone(),
            apt_mirror_cn: config.apt_mirror_cn.clone(),
            yum_mirror_cn: config.yum_mirror_cn.clone(),
            docker_mirrors_cn: config.docker_mirror_cn.clone(),
            confirm_ttl: config.confirm_ttl,
        },
        broker.clone(),
    ));
    let store = Arc::new(ArtifactStore::new());
    let transfer = Arc::new(DataTransferService::new(
        TransferConfig {
            export_ttl: config.export_ttl,
            import_max_bytes: config.import_max_bytes,
            ..TransferConfig::default()
        },
        broker.clone(),
        store.clone(),
    ));
    let terminal = Arc::new(TerminalService::new(registry.clone(), broker.clone()));

    broker.set_cleanup(Arc::new(GatewayCleanup {
        registry: registry.clone(),
        orchestrator: orchestrator.clone(),
    }));

    broker.register_handler(
        "/app/terminal/open",
        Arc::new(TerminalOpenHandler(terminal.clone())),
    );
    broker.register_handler(
        "/app/terminal/input",
        Arc::new(TerminalInputHandler(terminal.clone())),
    );
    broker.register_handler(
        "/app/terminal/resize",
        Arc::new(TerminalResizeHandler(terminal.clone())),
    );
    broker.register_handler(
        "/app/deployment/start",
        Arc::new(DeploymentStartHandler {
            terminal: terminal.clone(),
            orchestrator: orchestrator.clone(),
            broker: broker.clone(),
        }),
    );
    broker.register_handler(
        "/app/deployment/confirm",
        Arc::new(DeploymentConfirmHandler(orchestrator.clone())),
    );
    broker.register_handler(
        "/app/deployment/cancel",
        Arc::new(DeploymentCancelHandler(orchestrator.clone())),
    );
    broker.register_handler(
        "/app/deployment/status",
        Arc::new(DeploymentStatusHandler {
            orchestrator: orchestrator.clone(),
            broker: broker.clone(),
        }),
    );
    broker.register_handler(
        "/app/data/export",
        Arc::new(DataExportHandler {
            registry: registry.clone(),
            transfer: transfer.clone(),
            broker: broker.clone(),
        }),
    );
    broker.register_handler(
        "/app/data/import",
        Arc::new(DataImportHandler {
            registry: registry.clone(),
            transfer: transfer.clone(),
            broker: broker.clone(),
            upload_dir: config.upload_dir(),
        }),
    );

    Arc::new(Gateway {
        config,
        broker,
        registry,
        orchestrator,
        transfer,
        store,
    })
}

impl Gateway {
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/download/{token}", get(download_handler))
            .with_state(self.clone())
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.broker.spawn_workers();
        self.store.spawn_sweeper(SWEEP_PERIOD);
        self.spawn_idle_sweeper();

        let addr = self.config.listen_addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("gateway listening on {}", addr);

        let router = self.router();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown(self.clone()))
        .await?;
        Ok(())
    }

    /// Sessions with no byte I/O for the TTL go through the same
    /// cancellation path as a disconnect.
    fn spawn_idle_sweeper(self: &Arc<Self>) {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            loop {
                ticker.tick().await;
                for session_id in gateway.registry.collect_idle(gateway.config.session_idle_ttl) {
                    tracing::info!(session = %session_id, "evicting idle session");
                    gateway.broker.cancel_session(&session_id).await;
                }
            }
        });
    }
}

async fn shutdown(gateway: Arc<Gateway>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested, closing sessions");
    for session_id in gateway.broker.session_ids() {
        gateway.broker.cancel_session(&session_id).await;
    }
}

async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let broker = gateway.broker.clone();
    ws.on_upgrade(move |socket| broker.serve_socket(socket, addr.to_string()))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    session: Option<String>,
}

/// `GET /download/{token}?session=<id>` — one-time artifact download.
async fn download_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(token): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let Some(session) = query.session else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match gateway.store.claim(&token, &session) {
        Ok(artifact) => match tokio::fs::File::open(&artifact.path).await {
            Ok(file) => {
                // One-time token: unlink now, stream from the open handle.
                let _ = tokio::fs::remove_file(&artifact.path).await;
                let stream = ReaderStream::new(file);
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/zip")
                    .header(header::CONTENT_LENGTH, artifact.compressed_size)
                    .header(
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{}\"", artifact.filename),
                    )
                    .body(Body::from_stream(stream))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(e) => {
                tracing::warn!("artifact file missing: {}", e);
                StatusCode::NOT_FOUND.into_response()
            }
        },
        Err(ClaimError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(ClaimError::Expired) => StatusCode::GONE.into_response(),
        Err(ClaimError::Forbidden) => StatusCode::UNAUTHORIZED.into_response(),
    }
}
