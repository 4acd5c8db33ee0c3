mod common;

use common::{script_ubuntu_without_docker, unreachable_geo, RecordingSender, ScriptedExec};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stgate::orchestrator::{DeploymentOrchestrator, OrchestratorConfig, OrchestratorError};
use stgate::pipeline::context::DeploymentRequest;
use stgate::pipeline::{ConfirmAction, PipelineMode};
use tokio_util::sync::CancellationToken;

const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

fn orchestrator(outbound: Arc<RecordingSender>) -> Arc<DeploymentOrchestrator> {
    Arc::new(DeploymentOrchestrator::new(
        OrchestratorConfig {
            geo_endpoints: unreachable_geo(),
            confirm_ttl: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        },
        outbound,
    ))
}

fn request() -> DeploymentRequest {
    DeploymentRequest {
        container_name: "app".to_string(),
        image: "example/app:latest".to_string(),
        port: 8000,
        data_path: "/opt/app".to_string(),
        username: None,
        password: None,
    }
}

async fn start(
    orch: &Arc<DeploymentOrchestrator>,
    session_id: &str,
    task: &str,
    mode: PipelineMode,
    exec: Arc<ScriptedExec>,
    request: Option<DeploymentRequest>,
) -> Result<(), OrchestratorError> {
    orch.start_pipeline(
        session_id,
        task,
        mode,
        "1.2.3.4".to_string(),
        request,
        exec,
        &CancellationToken::new(),
    )
    .await
}

fn first_position(stages: &[String], stage: &str) -> usize {
    stages
        .iter()
        .position(|s| s == stage)
        .unwrap_or_else(|| panic!("stage '{}' missing from {:?}", stage, stages))
}

/// Docker absent on a supported OS with sudo available: the deploy
/// pipeline installs it and carries on to a verified, exposed container.
#[tokio::test]
async fn deploy_installs_missing_docker_and_succeeds() {
    let exec = ScriptedExec::new();
    script_ubuntu_without_docker(&exec).await;

    let sender = RecordingSender::new();
    let orch = orchestrator(sender.clone());
    start(&orch, "s1", "deploy", PipelineMode::Trust, exec.clone(), Some(request()))
        .await
        .unwrap();

    let result = sender
        .wait_for("s1", "deployment/result", |_| true, RESULT_TIMEOUT)
        .await
        .expect("deployment result");
    assert_eq!(result.payload["success"], Value::Bool(true), "{:?}", result);
    assert_eq!(
        result.payload["externalAccess"]["url"],
        Value::String("http://1.2.3.4:8000/".to_string())
    );
    assert!(result.critical);

    // the gap fix actually ran
    assert!(exec.ran_matching("apt-get install -y docker-ce").await);

    // progress arrives in execution order
    let stages = sender.stages("s1").await;
    let order = [
        "detect_os",
        "detect_location",
        "configure_system_mirrors",
        "check_docker",
        "install_docker",
        "configure_docker_mirror",
        "pull_image",
        "create_container",
        "verify",
        "configure_external_access",
        "complete",
    ];
    let mut last = 0;
    for stage in order {
        let position = first_position(&stages, stage);
        assert!(
            position >= last,
            "stage '{}' out of order in {:?}",
            stage,
            stages
        );
        last = position;
    }
}

/// Same target without root: the pipeline stops at install_docker with a
/// hard failure and nothing after it runs.
#[tokio::test]
async fn deploy_without_sudo_fails_at_install() {
    let exec = ScriptedExec::new();
    exec.on("cat /etc/os-release", common::UBUNTU_RELEASE, 0).await;
    exec.on("sudo -n true", "", 1).await;
    exec.on("id -u", "1000", 0).await;
    exec.on("docker --version", "", 127).await;

    let sender = RecordingSender::new();
    let orch = orchestrator(sender.clone());
    start(&orch, "s1", "deploy", PipelineMode::Trust, exec.clone(), Some(request()))
        .await
        .unwrap();

    let result = sender
        .wait_for("s1", "deployment/result", |_| true, RESULT_TIMEOUT)
        .await
        .expect("deployment result");
    assert_eq!(result.payload["success"], Value::Bool(false));
    assert!(result.payload["summary"]
        .as_str()
        .unwrap()
        .contains("sudo"));

    // terminal progress event is an error on the install stage
    let errors = sender
        .events_for("s1", "deployment/progress")
        .await
        .into_iter()
        .filter(|e| e.payload["level"] == "error")
        .collect::<Vec<_>>();
    assert_eq!(errors.last().unwrap().payload["stage"], "install_docker");

    // no step after install_docker was started
    assert!(!exec.ran_matching("docker pull").await);
    let stages = sender.stages("s1").await;
    assert!(!stages.contains(&"pull_image".to_string()));
}

/// Confirmation mode parks on the confirmable location step; a skip reply
/// proceeds with mirrors off.
#[tokio::test]
async fn confirmation_skip_proceeds_without_mirrors() {
    let exec = ScriptedExec::new();
    exec.on("cat /etc/os-release", common::UBUNTU_RELEASE, 0).await;
    exec.on("sudo -n true", "", 0).await;
    exec.on("docker --version", "Docker version 27.1.1, build x", 0)
        .await;
    exec.on("systemctl is-active docker", "active", 0).await;

    let sender = RecordingSender::new();
    let orch = orchestrator(sender.clone());
    start(
        &orch,
        "s1",
        "check_environment",
        PipelineMode::Confirmation,
        exec.clone(),
        None,
    )
    .await
    .unwrap();

    let confirmation = sender
        .wait_for(
            "s1",
            "deployment/confirmation",
            |p| p["stepId"] == "detect_location",
            RESULT_TIMEOUT,
        )
        .await
        .expect("confirmation request");
    assert_eq!(
        confirmation.payload["options"],
        serde_json::json!(["confirm", "skip", "cancel"])
    );

    orch.handle_confirmation("s1", "detect_location", ConfirmAction::Skip);

    let result = sender
        .wait_for("s1", "deployment/result", |_| true, RESULT_TIMEOUT)
        .await
        .expect("deployment result");
    assert_eq!(result.payload["success"], Value::Bool(true));

    // the skipped step surfaced as a warning and never probed
    let warned = sender
        .events_for("s1", "deployment/progress")
        .await
        .into_iter()
        .any(|e| e.payload["stage"] == "detect_location" && e.payload["level"] == "warn");
    assert!(warned);
}

/// An explicit cancel during the image pull lands in a terminal cancelled
/// state promptly and stops the chain.
#[tokio::test]
async fn cancel_during_pull_is_prompt_and_final() {
    let exec = ScriptedExec::new();
    exec.on("cat /etc/os-release", common::UBUNTU_RELEASE, 0).await;
    exec.on("sudo -n true", "", 0).await;
    exec.on("docker --version", "Docker version 27.1.1, build x", 0)
        .await;
    exec.on("systemctl is-active docker", "active", 0).await;
    exec.on_delayed("docker pull", "", 0, Duration::from_secs(30)).await;

    let sender = RecordingSender::new();
    let orch = orchestrator(sender.clone());
    start(&orch, "s1", "deploy", PipelineMode::Trust, exec.clone(), Some(request()))
        .await
        .unwrap();

    sender
        .wait_for(
            "s1",
            "deployment/progress",
            |p| p["stage"] == "pull_image",
            RESULT_TIMEOUT,
        )
        .await
        .expect("pull started");

    let cancelled_at = Instant::now();
    orch.cancel("s1");

    let result = sender
        .wait_for("s1", "deployment/result", |_| true, Duration::from_secs(2))
        .await
        .expect("terminal result after cancel");
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    assert_eq!(result.payload["success"], Value::Bool(false));
    assert_eq!(result.payload["summary"], "cancelled");

    // nothing past the pull ran
    assert!(!exec.ran_matching("docker ps --filter").await);
}

/// One active pipeline per session; a second start is rejected as busy.
#[tokio::test]
async fn second_start_on_same_session_is_busy() {
    let exec = ScriptedExec::new();
    exec.on_delayed("cat /etc/os-release", common::UBUNTU_RELEASE, 0, Duration::from_secs(5))
        .await;

    let sender = RecordingSender::new();
    let orch = orchestrator(sender.clone());
    start(&orch, "s1", "check_environment", PipelineMode::Trust, exec.clone(), None)
        .await
        .unwrap();

    let second = start(&orch, "s1", "check_environment", PipelineMode::Trust, exec, None).await;
    assert!(matches!(second, Err(OrchestratorError::Busy)));
}

/// Two sessions deploy concurrently and see only their own events.
#[tokio::test]
async fn concurrent_sessions_stay_isolated() {
    let sender = RecordingSender::new();
    let orch = orchestrator(sender.clone());

    let exec_a = ScriptedExec::new();
    script_ubuntu_without_docker(&exec_a).await;
    let exec_b = ScriptedExec::new();
    exec_b.on("cat /etc/os-release", "ID=alpine\nVERSION_ID=3.20\n", 0).await;
    exec_b.on("sudo -n true", "", 1).await;
    exec_b.on("id -u", "0", 0).await;
    exec_b.on("docker --version", "Docker version 26.0.0, build x", 0)
        .await;
    exec_b.on("rc-service docker status", "started", 0).await;
    exec_b.on("systemctl is-active docker", "", 127).await;

    start(&orch, "s1", "check_environment", PipelineMode::Trust, exec_a, None)
        .await
        .unwrap();
    start(&orch, "s2", "check_environment", PipelineMode::Trust, exec_b, None)
        .await
        .unwrap();

    for session in ["s1", "s2"] {
        let result = sender
            .wait_for(session, "deployment/result", |_| true, RESULT_TIMEOUT)
            .await
            .unwrap_or_else(|| panic!("no result for {}", session));
        assert_eq!(result.payload["success"], Value::Bool(true));
    }

    // each session's progress stream is complete and its own
    for session in ["s1", "s2"] {
        let stages = sender.stages(session).await;
        assert!(stages.contains(&"complete".to_string()));
        assert!(stages.contains(&"detect_os".to_string()));
    }
    for event in sender.events().await {
        assert!(["s1", "s2"].contains(&event.session_id.as_str()));
    }
}

/// Unknown task names are rejected before anything runs.
#[tokio::test]
async fn unknown_task_is_rejected_up_front() {
    let sender = RecordingSender::new();
    let orch = orchestrator(sender.clone());
    let exec = ScriptedExec::new();
    let result = start(&orch, "s1", "reticulate_splines", PipelineMode::Trust, exec.clone(), None).await;
    assert!(matches!(result, Err(OrchestratorError::UnknownTask(_))));
    assert!(exec.executed().await.is_empty());
}
