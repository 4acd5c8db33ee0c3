pub mod context;
pub mod hints;
pub mod progress;

pub use context::CommandContext;
pub use progress::{ProgressEvent, ProgressLevel, ProgressSink, RateGate};

use crate::executor::SshError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Error classification carried by command failures; drives retry policy
/// and the next-step hint table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Config,
    Auth,
    Transport,
    RemoteExec,
    Timeout,
    Cancelled,
    Protocol,
    Data,
}

/// Every command produces exactly one of these.
#[derive(Debug, Clone)]
pub enum CommandResult {
    Success,
    Skipped {
        reason: String,
    },
    Failure {
        kind: ErrorKind,
        reason: String,
        retryable: bool,
    },
}

impl CommandResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        CommandResult::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failure(kind: ErrorKind, reason: impl Into<String>, retryable: bool) -> Self {
        CommandResult::Failure {
            kind,
            reason: reason.into(),
            retryable,
        }
    }

    pub fn cancelled() -> Self {
        CommandResult::Failure {
            kind: ErrorKind::Cancelled,
            reason: "cancelled".to_string(),
            retryable: false,
        }
    }

    /// Translate an SSH-layer error at the command boundary.
    pub fn from_ssh_error(e: &SshError) -> Self {
        match e {
            SshError::Auth(msg) => Self::failure(ErrorKind::Auth, msg.clone(), false),
            SshError::ConnectTimeout(d) => Self::failure(
                ErrorKind::Transport,
                format!("connection attempt timed out after {:?}", d),
                false,
            ),
            SshError::Timeout(d) => Self::failure(
                ErrorKind::Timeout,
                format!("remote command timed out after {:?}", d),
                true,
            ),
            SshError::ConnectionClosed => {
                Self::failure(ErrorKind::Transport, "SSH connection closed", false)
            }
            SshError::Network(msg) => Self::failure(ErrorKind::Transport, msg.clone(), true),
            SshError::Sftp(msg) => Self::failure(ErrorKind::Data, msg.clone(), false),
            SshError::Protocol(msg) => Self::failure(ErrorKind::Protocol, msg.clone(), false),
        }
    }
}

/// A discrete unit of pipeline work. Implementations must honour
/// `ctx.cancel` at every point where they block on I/O.
#[async_trait]
pub trait Command: Send + Sync {
    /// Stable identifier, e.g. `install_docker`. Used in progress stages.
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn requires_confirmation(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &mut CommandContext) -> CommandResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    Trust,
    Confirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStatus {
    Idle,
    Running,
    WaitingConfirm,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInfo {
    pub id: String,
    pub display_name: String,
    pub estimated_duration_sec: u64,
    pub requires_confirmation: bool,
}

impl StepInfo {
    pub fn from_command(cmd: &dyn Command) -> Self {
        Self {
            id: cmd.id().to_string(),
            display_name: cmd.display_name().to_string(),
            estimated_duration_sec: cmd.estimated_duration().as_secs(),
            requires_confirmation: cmd.requires_confirmation(),
        }
    }
}

/// Per-session snapshot of a running pipeline, served by the status
/// operation and mutated only by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentState {
    pub mode: PipelineMode,
    pub steps: Vec<StepInfo>,
    pub current_index: usize,
    pub status: PipelineStatus,
    pub awaiting_step_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl DeploymentState {
    pub fn new(mode: PipelineMode, steps: Vec<StepInfo>) -> Self {
        Self {
            mode,
            steps,
            current_index: 0,
            status: PipelineStatus::Idle,
            awaiting_step_id: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmAction {
    Confirm,
    Skip,
    Cancel,
}

/// Where the runner parks while a confirmable step waits for the user.
/// The orchestrator implements this against the message channel; tests
/// use canned replies.
#[async_trait]
pub trait ConfirmationHub: Send + Sync {
    async fn await_decision(
        &self,
        session_id: &str,
        step: &StepInfo,
        rationale: &str,
    ) -> ConfirmAction;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub status: PipelineStatus,
    pub summary: String,
    pub failed_stage: Option<String>,
}

impl PipelineOutcome {
    pub fn success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }
}

/// Executes an ordered command chain against one context: confirmation
/// gating, bounded retry with doubling backoff, ordered progress emission,
/// prompt cancellation. Terminal states are final; a new run needs a new
/// runner.
pub struct PipelineRunner {
    commands: Vec<Arc<dyn Command>>,
    mode: PipelineMode,
    retry: RetryPolicy,
    hub: Arc<dyn ConfirmationHub>,
    state: Arc<Mutex<DeploymentState>>,
}

impl PipelineRunner {
    pub fn new(
        commands: Vec<Arc<dyn Command>>,
        mode: PipelineMode,
        retry: RetryPolicy,
        hub: Arc<dyn ConfirmationHub>,
    ) -> Self {
        let steps = commands
            .iter()
            .map(|c| StepInfo::from_command(c.as_ref()))
            .collect();
        Self {
            commands,
            mode,
            retry,
            hub,
            state: Arc::new(Mutex::new(DeploymentState::new(mode, steps))),
        }
    }

    /// Shared handle for status queries while the run is in flight.
    pub fn state_handle(&self) -> Arc<Mutex<DeploymentState>> {
        self.state.clone()
    }

    pub async fn run(&self, ctx: &mut CommandContext) -> PipelineOutcome {
        {
            let mut st = self.state.lock().await;
            st.status = PipelineStatus::Running;
            st.started_at = Utc::now();
        }

        let total = self.commands.len().max(1);
        for (index, cmd) in self.commands.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return self.finish_cancelled(ctx, cmd.id()).await;
            }

            {
                let mut st = self.state.lock().await;
                st.current_index = index;
            }
            let percent = ((100 * index) / total) as u8;
            ctx.progress
                .emit(ProgressEvent::info(
                    cmd.id(),
                    percent,
                    format!("starting {}", cmd.display_name()),
                ))
                .await;

            if self.mode == PipelineMode::Confirmation && cmd.requires_confirmation() {
                match self
                    .gate(ctx, cmd.as_ref(), "step requires confirmation")
                    .await
                {
                    ConfirmAction::Confirm => {}
                    ConfirmAction::Skip => {
                        ctx.progress
                            .emit(ProgressEvent::warn(
                                cmd.id(),
                                percent,
                                format!("{} skipped by user", cmd.display_name()),
                            ))
                            .await;
                        continue;
                    }
                    ConfirmAction::Cancel => return self.finish_cancelled(ctx, cmd.id()).await,
                }
            }

            let mut attempts = 0u32;
            'command: loop {
                let result = {
                    let token = ctx.cancel.clone();
                    tokio::select! {
                        _ = token.cancelled() => CommandResult::cancelled(),
                        result = cmd.execute(ctx) => result,
                    }
                };

                match result {
                    CommandResult::Success => {
                        ctx.progress
                            .emit(ProgressEvent::success(
                                cmd.id(),
                                percent,
                                format!("{} completed", cmd.display_name()),
                            ))
                            .await;
                        break 'command;
                    }
                    CommandResult::Skipped { reason } => {
                        ctx.progress
                            .emit(ProgressEvent::warn(cmd.id(), percent, reason))
                            .await;
                        break 'command;
                    }
                    CommandResult::Failure {
                        kind: ErrorKind::Cancelled,
                        ..
                    } => {
                        return self.finish_cancelled(ctx, cmd.id()).await;
                    }
                    CommandResult::Failure {
                        kind,
                        reason,
                        retryable,
                    } => {
                        if ctx.cancel.is_cancelled() {
                            return self.finish_cancelled(ctx, cmd.id()).await;
                        }
                        if retryable && attempts < self.retry.max_retries {
                            let backoff = self.retry.backoff_base * 2u32.pow(attempts);
                            attempts += 1;
                            ctx.progress
                                .emit(ProgressEvent::warn(
                                    cmd.id(),
                                    percent,
                                    format!(
                                        "{} failed ({}), retrying in {}s",
                                        cmd.display_name(),
                                        reason,
                                        backoff.as_secs()
                                    ),
                                ))
                                .await;
                            tokio::select! {
                                _ = ctx.cancel.cancelled() => {
                                    return self.finish_cancelled(ctx, cmd.id()).await;
                                }
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            continue 'command;
                        }
                        if retryable && self.mode == PipelineMode::Confirmation {
                            match self.gate(ctx, cmd.as_ref(), &reason).await {
                                ConfirmAction::Confirm => {
                                    attempts = 0;
                                    continue 'command;
                                }
                                ConfirmAction::Skip => {
                                    ctx.progress
                                        .emit(ProgressEvent::warn(
                                            cmd.id(),
                                            percent,
                                            format!(
                                                "{} skipped after failure: {}",
                                                cmd.display_name(),
                                                reason
                                            ),
                                        ))
                                        .await;
                                    break 'command;
                                }
                                ConfirmAction::Cancel => {
                                    return self.finish_cancelled(ctx, cmd.id()).await;
                                }
                            }
                        }
                        return self.finish_failed(ctx, cmd.id(), percent, kind, &reason).await;
                    }
                }
            }
        }

        ctx.progress
            .emit(ProgressEvent::success("complete", 100, "pipeline completed"))
            .await;
        {
            let mut st = self.state.lock().await;
            st.status = PipelineStatus::Completed;
            st.ended_at = Some(Utc::now());
        }
        PipelineOutcome {
            status: PipelineStatus::Completed,
            summary: "pipeline completed".to_string(),
            failed_stage: None,
        }
    }

    async fn gate(
        &self,
        ctx: &mut CommandContext,
        cmd: &dyn Command,
        rationale: &str,
    ) -> ConfirmAction {
        {
            let mut st = self.state.lock().await;
            st.status = PipelineStatus::WaitingConfirm;
            st.awaiting_step_id = Some(cmd.id().to_string());
        }
        let step = StepInfo::from_command(cmd);
        let token = ctx.cancel.clone();
        let action = tokio::select! {
            _ = token.cancelled() => ConfirmAction::Cancel,
            action = self.hub.await_decision(&ctx.session_id, &step, rationale) => action,
        };
        {
            let mut st = self.state.lock().await;
            st.status = PipelineStatus::Running;
            st.awaiting_step_id = None;
        }
        action
    }

    async fn finish_failed(
        &self,
        ctx: &mut CommandContext,
        stage: &str,
        percent: u8,
        kind: ErrorKind,
        reason: &str,
    ) -> PipelineOutcome {
        let message = format!(
            "{}; next step: {}",
            reason,
            hints::next_step_hint(stage, kind)
        );
        ctx.progress
            .emit(ProgressEvent::error(stage, percent, message.clone()))
            .await;
        let mut st = self.state.lock().await;
        st.status = PipelineStatus::Failed;
        st.ended_at = Some(Utc::now());
        PipelineOutcome {
            status: PipelineStatus::Failed,
            summary: message,
            failed_stage: Some(stage.to_string()),
        }
    }

    async fn finish_cancelled(&self, ctx: &mut CommandContext, stage: &str) -> PipelineOutcome {
        ctx.progress
            .emit(ProgressEvent::error(stage, 100, "cancelled"))
            .await;
        let mut st = self.state.lock().await;
        st.status = PipelineStatus::Cancelled;
        st.ended_at = Some(Utc::now());
        PipelineOutcome {
            status: PipelineStatus::Cancelled,
            summary: "cancelled".to_string(),
            failed_stage: Some(stage.to_string()),
        }
    }
}
