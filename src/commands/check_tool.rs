use crate::executor::RemoteExec;
use crate::pipeline::context::{tool_installed_key, tool_version_key, DockerStatus, DOCKER_STATUS};
use crate::pipeline::{Command, CommandContext, CommandResult};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

lazy_static! {
    static ref VERSION_RE: Regex = Regex::new(r"(\d+\.\d+(?:\.\d+)?)").unwrap();
}

/// Pull the first x.y[.z] out of a tool's version banner; normalize full
/// triples through semver.
fn extract_version(banner: &str) -> Option<String> {
    let raw = VERSION_RE.captures(banner)?.get(1)?.as_str();
    match semver::Version::parse(raw) {
        Ok(v) => Some(v.to_string()),
        Err(_) => Some(raw.to_string()),
    }
}

/// Probes one tool with `command -v` plus its version flag and records
/// `<TOOL>_INSTALLED` / `<TOOL>_VERSION`. A missing tool is a finding, not
/// a failure.
pub struct CheckToolCommand {
    tool: &'static str,
    version_cmd: &'static str,
    id: String,
}

impl CheckToolCommand {
    fn new(tool: &'static str, version_cmd: &'static str) -> Self {
        Self {
            tool,
            version_cmd,
            id: format!("check_{}", tool),
        }
    }

    pub fn curl() -> Self {
        Self::new("curl", "curl --version")
    }

    pub fn unzip() -> Self {
        Self::new("unzip", "unzip -v")
    }

    pub fn git() -> Self {
        Self::new("git", "git --version")
    }
}

#[async_trait]
impl Command for CheckToolCommand {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        self.tool
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(2)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> CommandResult {
        let exec = ctx.exec();

        let installed = match exec.exec(&format!("command -v {}", self.tool)).await {
            Ok(out) => out.is_success(),
            Err(e) => return CommandResult::from_ssh_error(&e),
        };
        ctx.set_bool(&tool_installed_key(self.tool), installed);

        if installed {
            if let Ok(out) = exec.exec(self.version_cmd).await {
                if let Some(version) = extract_version(&out.stdout_trimmed()) {
                    ctx.set(&tool_version_key(self.tool), &version);
                }
            }
        }
        tracing::debug!(session = %ctx.session_id, tool = self.tool, installed,
            "tool probe finished");
        CommandResult::Success
    }
}

/// Docker needs more than presence: the daemon has to be running. Records
/// the combined `DOCKER_STATUS` consumed by `install_docker` and
/// `pull_image`.
pub struct CheckDockerCommand;

pub(crate) async fn probe_docker(exec: &Arc<dyn RemoteExec>) -> Result<DockerStatus, CommandResult> {
    let version_out = exec
        .exec("docker --version")
        .await
        .map_err(|e| CommandResult::from_ssh_error(&e))?;
    let installed = version_out.is_success();
    let version = installed
        .then(|| extract_version(&version_out.stdout_trimmed()))
        .flatten();

    let service_running = if installed {
        let probe = exec
            .exec("systemctl is-active docker 2>/dev/null || rc-service docker status")
            .await
            .map_err(|e| CommandResult::from_ssh_error(&e))?;
        probe.is_success()
    } else {
        false
    };

    Ok(DockerStatus {
        installed,
        service_running,
        version,
    })
}

#[async_trait]
impl Command for CheckDockerCommand {
    fn id(&self) -> &str {
        "check_docker"
    }

    fn display_name(&self) -> &str {
        "docker"
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(3)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> CommandResult {
        let exec = ctx.exec();
        let status = match probe_docker(&exec).await {
            Ok(status) => status,
            Err(failure) => return failure,
        };

        ctx.set_bool(&tool_installed_key("docker"), status.installed);
        if let Some(version) = &status.version {
            ctx.set(&tool_version_key("docker"), version);
        }
        tracing::info!(session = %ctx.session_id, installed = status.installed,
            running = status.service_running, "docker probe finished");
        ctx.set(DOCKER_STATUS, &status);
        CommandResult::Success
    }
}
