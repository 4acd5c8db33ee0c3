use super::{as_root, backup_script, with_remote_lock};
use crate::pipeline::{Command, CommandContext, CommandResult, ErrorKind, ProgressEvent};
use async_trait::async_trait;
use std::time::Duration;

pub const DEFAULT_CN_REGISTRY_MIRRORS: &[&str] = &[
    "https://registry.cn-hangzhou.aliyuncs.com",
    "https://docker.mirrors.ustc.edu.cn",
];

const DAEMON_JSON: &str = "/etc/docker/daemon.json";

/// Maintains `registry-mirrors` in `/etc/docker/daemon.json`, merging
/// around whatever else the file carries, and nudges the daemon to pick
/// the change up.
pub struct ConfigureDockerMirrorCommand {
    cn_mirrors: Vec<String>,
}

impl ConfigureDockerMirrorCommand {
    pub fn new(cn_mirrors: Vec<String>) -> Self {
        let cn_mirrors = if cn_mirrors.is_empty() {
            DEFAULT_CN_REGISTRY_MIRRORS
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            cn_mirrors
        };
        Self { cn_mirrors }
    }
}

impl Default for ConfigureDockerMirrorCommand {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Merge the mirror list into the existing daemon config. Returns `None`
/// when the file already says exactly this.
fn merge_daemon_config(
    current: &str,
    cn_mirrors: &[String],
    use_china_mirror: bool,
) -> Result<Option<String>, serde_json::Error> {
    let trimmed = current.trim();
    let mut config: serde_json::Value = if trimmed.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(trimmed)?
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    let before = config.clone();
    let object = config.as_object_mut().expect("object ensured above");
    if use_china_mirror {
        object.insert(
            "registry-mirrors".to_string(),
            serde_json::json!(cn_mirrors),
        );
    } else {
        object.remove("registry-mirrors");
    }

    if config == before {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string_pretty(&config).expect("valid json")))
}

#[async_trait]
impl Command for ConfigureDockerMirrorCommand {
    fn id(&self) -> &str {
        "configure_docker_mirror"
    }

    fn display_name(&self) -> &str {
        "Configure Docker registry mirror"
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(15)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> CommandResult {
        let exec = ctx.exec();

        let current = match exec
            .exec(&format!("cat {} 2>/dev/null || true", DAEMON_JSON))
            .await
        {
            Ok(out) => out.stdout_trimmed(),
            Err(e) => return CommandResult::from_ssh_error(&e),
        };

        let desired = match merge_daemon_config(&current, &self.cn_mirrors, ctx.use_china_mirror())
        {
            Ok(Some(json)) => json,
            Ok(None) => {
                return CommandResult::skipped("docker daemon config already up to date");
            }
            Err(e) => {
                return CommandResult::failure(
                    ErrorKind::RemoteExec,
                    format!("existing {} is not valid JSON: {}", DAEMON_JSON, e),
                    false,
                )
            }
        };

        ctx.progress
            .emit(ProgressEvent::info(self.id(), 0, "writing daemon.json"))
            .await;
        let write = format!(
            "{backup}; mkdir -p /etc/docker && cat > {path} <<'STGATE_EOF'\n{json}\nSTGATE_EOF",
            backup = backup_script(DAEMON_JSON),
            path = DAEMON_JSON,
            json = desired
        );
        match exec.exec(&as_root(&with_remote_lock(&write))).await {
            Ok(out) if out.is_success() => {}
            Ok(out) => {
                return CommandResult::failure(
                    ErrorKind::RemoteExec,
                    format!("writing {} failed: {}", DAEMON_JSON, out.stderr_tail(5)),
                    false,
                )
            }
            Err(e) => return CommandResult::from_ssh_error(&e),
        }

        // Only poke the daemon when it is actually running; during a fresh
        // setup the service starts later and reads the file then.
        let running = ctx
            .docker_status()
            .map(|s| s.service_running)
            .unwrap_or(false);
        if running {
            ctx.progress
                .emit(ProgressEvent::info(self.id(), 0, "reloading docker daemon"))
                .await;
            let reload = "systemctl reload docker 2>/dev/null \
                          || systemctl restart docker 2>/dev/null \
                          || kill -HUP $(pidof dockerd)";
            match exec.exec(&as_root(reload)).await {
                Ok(out) if out.is_success() => {}
                Ok(out) => {
                    return CommandResult::failure(
                        ErrorKind::RemoteExec,
                        format!("docker daemon reload failed: {}", out.stderr_tail(5)),
                        true,
                    )
                }
                Err(e) => return CommandResult::from_ssh_error(&e),
            }
        }

        CommandResult::Success
    }
}
