#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use stgate::broker::SessionSender;
use stgate::executor::{ExecOutput, RemoteExec, SshError};
use tokio::sync::Mutex;

/// A scripted remote executor: rules are matched by substring in
/// registration order; a rule registered with a sequence yields its
/// outcomes one by one and then repeats the last. Unmatched commands
/// succeed silently, so scripts only spell out what the test asserts on.
pub struct ScriptedExec {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
}

struct Rule {
    pattern: String,
    outcomes: Vec<Outcome>,
    cursor: usize,
}

#[derive(Clone)]
struct Outcome {
    stdout: String,
    stderr: String,
    exit_code: u32,
    delay: Duration,
}

pub fn out(stdout: &str, exit_code: u32) -> (String, String, u32, Duration) {
    (stdout.to_string(), String::new(), exit_code, Duration::ZERO)
}

impl ScriptedExec {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rules: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    pub async fn on(&self, pattern: &str, stdout: &str, exit_code: u32) {
        self.on_seq(pattern, vec![(stdout.to_string(), String::new(), exit_code, Duration::ZERO)])
            .await;
    }

    pub async fn on_delayed(&self, pattern: &str, stdout: &str, exit_code: u32, delay: Duration) {
        self.on_seq(pattern, vec![(stdout.to_string(), String::new(), exit_code, delay)])
            .await;
    }

    /// Outcomes are yielded in order; the last one repeats.
    pub async fn on_seq(&self, pattern: &str, outcomes: Vec<(String, String, u32, Duration)>) {
        self.rules.lock().await.push(Rule {
            pattern: pattern.to_string(),
            outcomes: outcomes
                .into_iter()
                .map(|(stdout, stderr, exit_code, delay)| Outcome {
                    stdout,
                    stderr,
                    exit_code,
                    delay,
                })
                .collect(),
            cursor: 0,
        });
    }

    pub async fn executed(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    pub async fn ran_matching(&self, pattern: &str) -> bool {
        self.log.lock().await.iter().any(|c| c.contains(pattern))
    }
}

#[async_trait]
impl RemoteExec for ScriptedExec {
    async fn exec_with_timeout(
        &self,
        command: &str,
        _limit: Duration,
    ) -> Result<ExecOutput, SshError> {
        self.log.lock().await.push(command.to_string());

        let outcome = {
            let mut rules = self.rules.lock().await;
            let mut found = None;
            for rule in rules.iter_mut() {
                if command.contains(rule.pattern.as_str()) {
                    let index = rule.cursor.min(rule.outcomes.len() - 1);
                    rule.cursor += 1;
                    found = Some(rule.outcomes[index].clone());
                    break;
                }
            }
            found
        };

        let outcome = outcome.unwrap_or(Outcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            delay: Duration::ZERO,
        });
        if !outcome.delay.is_zero() {
            tokio::time::sleep(outcome.delay).await;
        }
        Ok(ExecOutput {
            stdout: outcome.stdout.into_bytes(),
            stderr: outcome.stderr.into_bytes(),
            exit_code: outcome.exit_code,
            ..ExecOutput::new()
        })
    }
}

/// Captures everything the gateway would push onto per-session queues.
#[derive(Clone)]
pub struct RecordingSender {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub session_id: String,
    pub topic: String,
    pub payload: Value,
    pub critical: bool,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_for(&self, session_id: &str, topic: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.session_id == session_id && e.topic == topic)
            .cloned()
            .collect()
    }

    /// Progress stages for a session, in arrival order.
    pub async fn stages(&self, session_id: &str) -> Vec<String> {
        self.events_for(session_id, "deployment/progress")
            .await
            .iter()
            .filter_map(|e| e.payload["stage"].as_str().map(str::to_string))
            .collect()
    }

    /// Poll until an event for (session, topic) matches, or give up.
    pub async fn wait_for(
        &self,
        session_id: &str,
        topic: &str,
        predicate: impl Fn(&Value) -> bool,
        timeout: Duration,
    ) -> Option<RecordedEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self
                .events_for(session_id, topic)
                .await
                .into_iter()
                .find(|e| predicate(&e.payload))
            {
                return Some(event);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl SessionSender for RecordingSender {
    async fn send_to_session(
        &self,
        session_id: &str,
        topic: &str,
        payload: Value,
        critical: bool,
    ) {
        self.events.lock().await.push(RecordedEvent {
            session_id: session_id.to_string(),
            topic: topic.to_string(),
            payload,
            critical,
        });
    }

    async fn broadcast(&self, _topic: &str, _payload: Value) {}
}

pub const UBUNTU_RELEASE: &str = "PRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\nNAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nVERSION_CODENAME=jammy\nID=ubuntu\n";

/// Baseline Ubuntu host with passwordless sudo and no Docker; the version
/// probe starts answering once the install has run.
pub async fn script_ubuntu_without_docker(exec: &ScriptedExec) {
    exec.on("cat /etc/os-release", UBUNTU_RELEASE, 0).await;
    exec.on("sudo -n true", "", 0).await;
    exec.on("nproc", "4", 0).await;
    exec.on("cat /proc/meminfo", "MemTotal: 8167788 kB", 0).await;
    exec.on(
        "df -Pm /",
        "Filesystem 1048576-blocks Used Available Capacity Mounted on\n/dev/vda1 81106 20000 57521 26% /",
        0,
    )
    .await;
    // absent before installation, present afterwards
    exec.on_seq(
        "docker --version",
        vec![
            ("".to_string(), String::new(), 127, Duration::ZERO),
            (
                "Docker version 27.1.1, build 6312585".to_string(),
                String::new(),
                0,
                Duration::ZERO,
            ),
        ],
    )
    .await;
    exec.on("systemctl is-active docker", "active", 0).await;
    exec.on("docker ps", "app", 0).await;
    exec.on("curl -sS", "200", 0).await;
}

/// Geo endpoint nobody listens on: the location probe degrades to its
/// skip-with-default path without touching the network for long.
pub fn unreachable_geo() -> Vec<String> {
    vec!["http://127.0.0.1:9/{ip}".to_string()]
}
