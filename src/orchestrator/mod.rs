use crate::broker::SessionSender;
use crate::commands::{
    CheckDockerCommand, CheckToolCommand, ConfigureDockerMirrorCommand,
    ConfigureExternalAccessCommand, ConfigureSystemMirrorsCommand, CreateContainerCommand,
    DetectLocationCommand, DetectOsCommand, InstallDockerCommand, PullImageCommand, VerifyCommand,
};
use crate::executor::RemoteExec;
use crate::pipeline::context::{
    DeploymentRequest, ExternalAccess, DEPLOYMENT_REQUEST, EXTERNAL_ACCESS, TARGET_HOST,
};
use crate::pipeline::{
    Command, CommandContext, ConfirmAction, ConfirmationHub, DeploymentState, PipelineMode,
    PipelineRunner, ProgressSink, RetryPolicy, StepInfo,
};
use crate::session::SessionId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("a pipeline is already running for this session")]
    Busy,
}

/// Everything the command library needs from the environment.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub geo_endpoints: Vec<String>,
    pub apt_mirror_cn: String,
    pub yum_mirror_cn: String,
    pub docker_mirrors_cn: Vec<String>,
    pub confirm_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            geo_endpoints: Vec::new(),
            apt_mirror_cn: crate::commands::DEFAULT_CN_MIRROR.to_string(),
            yum_mirror_cn: crate::commands::DEFAULT_CN_MIRROR.to_string(),
            docker_mirrors_cn: Vec::new(),
            confirm_ttl: Duration::from_secs(600),
        }
    }
}

struct PendingConfirmation {
    step_id: String,
    reply: oneshot::Sender<ConfirmAction>,
}

struct ActiveDeployment {
    state: Arc<Mutex<DeploymentState>>,
    cancel: CancellationToken,
}

/// Composes command chains per named task and owns all per-session
/// deployment state: one active pipeline per session, pending
/// confirmations, status snapshots.
pub struct DeploymentOrchestrator {
    config: OrchestratorConfig,
    outbound: Arc<dyn SessionSender>,
    active: DashMap<SessionId, ActiveDeployment>,
    pending: Arc<DashMap<SessionId, PendingConfirmation>>,
}

impl DeploymentOrchestrator {
    pub fn new(config: OrchestratorConfig, outbound: Arc<dyn SessionSender>) -> Self {
        Self {
            config,
            outbound,
            active: DashMap::new(),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// The closed task table. Order within a chain is contractual.
    pub fn compose(&self, task_name: &str) -> Result<Vec<Arc<dyn Command>>, OrchestratorError> {
        let environment_checks: Vec<Arc<dyn Command>> = vec![
            Arc::new(DetectOsCommand),
            Arc::new(DetectLocationCommand::new(
                self.config.geo_endpoints.clone(),
            )),
            Arc::new(CheckToolCommand::curl()),
            Arc::new(CheckToolCommand::unzip()),
            Arc::new(CheckToolCommand::git()),
            Arc::new(CheckDockerCommand),
        ];
        let system_mirrors = || -> Arc<dyn Command> {
            Arc::new(ConfigureSystemMirrorsCommand::new(
                self.config.apt_mirror_cn.clone(),
                self.config.yum_mirror_cn.clone(),
            ))
        };
        let docker_mirror = || -> Arc<dyn Command> {
            Arc::new(ConfigureDockerMirrorCommand::new(
                self.config.docker_mirrors_cn.clone(),
            ))
        };

        match task_name {
            "full_setup" | "initialize_environment" => {
                let mut chain = environment_checks;
                chain.push(system_mirrors());
                chain.push(docker_mirror());
                Ok(chain)
            }
            "check_environment" => Ok(environment_checks),
            "configure_mirrors" => Ok(vec![
                Arc::new(DetectOsCommand),
                Arc::new(DetectLocationCommand::new(
                    self.config.geo_endpoints.clone(),
                )),
                system_mirrors(),
                docker_mirror(),
            ]),
            "deploy" => Ok(vec![
                Arc::new(DetectOsCommand),
                Arc::new(DetectLocationCommand::new(
                    self.config.geo_endpoints.clone(),
                )),
                system_mirrors(),
                Arc::new(CheckDockerCommand),
                Arc::new(InstallDockerCommand::default()),
                docker_mirror(),
                Arc::new(PullImageCommand),
                Arc::new(CreateContainerCommand),
                Arc::new(VerifyCommand),
                Arc::new(ConfigureExternalAccessCommand),
            ]),
            other => Err(OrchestratorError::UnknownTask(other.to_string())),
        }
    }

    /// Start a pipeline for this session. `exec` is the session's SSH
    /// executor from the registry; `session_cancel` is the channel's token
    /// so a disconnect tears the pipeline down with it.
    pub async fn start_pipeline(
        self: &Arc<Self>,
        session_id: &str,
        task_name: &str,
        mode: PipelineMode,
        target_host: String,
        request: Option<DeploymentRequest>,
        exec: Arc<dyn RemoteExec>,
        session_cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        // one active pipeline per session
        if let Some(existing) = self.active.get(session_id) {
            let state = existing.state.lock().await;
            if !state.status.is_terminal() {
                return Err(OrchestratorError::Busy);
            }
        }

        let commands = self.compose(task_name)?;
        let cancel = session_cancel.child_token();
        let hub = Arc::new(OrchestratorHub {
            pending: self.pending.clone(),
            outbound: self.outbound.clone(),
            ttl: self.config.confirm_ttl,
        });
        let runner = PipelineRunner::new(commands, mode, RetryPolicy::default(), hub);
        let state = runner.state_handle();

        self.active.insert(
            session_id.to_string(),
            ActiveDeployment {
                state,
                cancel: cancel.clone(),
            },
        );

        // Bridge pipeline progress onto the session's queue. Non-critical
        // events may be dropped downstream under backpressure.
        let (progress_tx, mut progress_rx) = mpsc::channel::<crate::pipeline::ProgressEvent>(64);
        {
            let outbound = self.outbound.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                while let Some(event) = progress_rx.recv().await {
                    let critical = event.is_critical();
                    let payload = serde_json::to_value(&event).unwrap_or_default();
                    outbound
                        .send_to_session(&session_id, "deployment/progress", payload, critical)
                        .await;
                }
            });
        }

        let mut ctx = CommandContext::new(
            session_id.to_string(),
            exec,
            ProgressSink::new(progress_tx),
            cancel,
        );
        ctx.set(TARGET_HOST, &target_host);
        if let Some(request) = &request {
            ctx.set(DEPLOYMENT_REQUEST, request);
        }

        let outbound = self.outbound.clone();
        let pending = self.pending.clone();
        let task = task_name.to_string();
        let owner = session_id.to_string();
        tokio::spawn(async move {
            tracing::info!(session = %owner, task = %task, "pipeline started");
            let outcome = runner.run(&mut ctx).await;

            // A pipeline that ends while a confirmation is parked resolves
            // it as cancelled.
            pending.remove(&owner);

            let mut result = json!({
                "success": outcome.success(),
                "summary": outcome.summary,
            });
            if outcome.success() {
                if let Some(access) = ctx.get::<ExternalAccess>(EXTERNAL_ACCESS) {
                    result["externalAccess"] = serde_json::to_value(&access).unwrap_or_default();
                }
            }
            outbound
                .send_to_session(&owner, "deployment/result", result, true)
                .await;
            tracing::info!(session = %owner, task = %task, status = ?outcome.status,
                "pipeline finished");
        });

        Ok(())
    }

    /// Resolve a parked confirmation; a reply for a step that is not
    /// waiting is a no-op.
    pub fn handle_confirmation(&self, session_id: &str, step_id: &str, action: ConfirmAction) {
        let matches_step = self
            .pending
            .get(session_id)
            .map(|p| p.step_id == step_id)
            .unwrap_or(false);
        if !matches_step {
            tracing::debug!(session = %session_id, step = %step_id,
                "confirmation reply without matching pending step");
            return;
        }
        if let Some((_, pending)) = self.pending.remove(session_id) {
            let _ = pending.reply.send(action);
        }
    }

    /// Cancel the session's active pipeline (the explicit cancel action;
    /// disconnects go through the parent session token instead).
    pub fn cancel(&self, session_id: &str) {
        if let Some(active) = self.active.get(session_id) {
            active.cancel.cancel();
        }
        if let Some((_, pending)) = self.pending.remove(session_id) {
            let _ = pending.reply.send(ConfirmAction::Cancel);
        }
    }

    pub async fn status(&self, session_id: &str) -> Option<DeploymentState> {
        let active = self.active.get(session_id)?;
        let state = active.state.lock().await;
        Some(state.clone())
    }

    /// Forget a session entirely (registry eviction path).
    pub fn forget(&self, session_id: &str) {
        self.cancel(session_id);
        self.active.remove(session_id);
    }
}

/// The runner-facing side of confirmations: parks the step, tells the
/// client, waits for the reply or the TTL.
struct OrchestratorHub {
    pending: Arc<DashMap<SessionId, PendingConfirmation>>,
    outbound: Arc<dyn SessionSender>,
    ttl: Duration,
}

#[async_trait]
impl ConfirmationHub for OrchestratorHub {
    async fn await_decision(
        &self,
        session_id: &str,
        step: &StepInfo,
        rationale: &str,
    ) -> ConfirmAction {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            session_id.to_string(),
            PendingConfirmation {
                step_id: step.id.clone(),
                reply: reply_tx,
            },
        );

        self.outbound
            .send_to_session(
                session_id,
                "deployment/confirmation",
                json!({
                    "stepId": step.id,
                    "displayName": step.display_name,
                    "rationale": rationale,
                    "defaultAction": "confirm",
                    "options": ["confirm", "skip", "cancel"],
                }),
                true,
            )
            .await;

        let action = match tokio::time::timeout(self.ttl, reply_rx).await {
            Ok(Ok(action)) => action,
            // TTL elapsed or the sender vanished: auto-cancel.
            Ok(Err(_)) | Err(_) => ConfirmAction::Cancel,
        };
        self.pending.remove(session_id);
        action
    }
}
