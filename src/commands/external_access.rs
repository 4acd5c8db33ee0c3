use super::{as_root, backup_script, shell_quote, with_remote_lock};
use crate::pipeline::context::{ExternalAccess, EXTERNAL_ACCESS, TARGET_HOST};
use crate::pipeline::{Command, CommandContext, CommandResult, ErrorKind, ProgressEvent};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;

const RESTART_TIMEOUT: Duration = Duration::from_secs(120);

/// Locks the deployed application behind basic auth: writes (or merges)
/// credentials into the container's `config.yaml` on the host volume,
/// restarts the container, and reports the externally reachable URL plus
/// the credentials back to the client.
pub struct ConfigureExternalAccessCommand;

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Merge auth settings into whatever config the container already has,
/// preserving unrelated keys.
fn merge_config_yaml(
    current: &str,
    username: &str,
    password: &str,
) -> Result<String, serde_yaml::Error> {
    let mut config: serde_yaml::Value = if current.trim().is_empty() {
        serde_yaml::Value::Mapping(Default::default())
    } else {
        serde_yaml::from_str(current)?
    };
    if !config.is_mapping() {
        config = serde_yaml::Value::Mapping(Default::default());
    }

    let mapping = config.as_mapping_mut().expect("mapping ensured above");
    mapping.insert("listen".into(), true.into());
    mapping.insert("basicAuthMode".into(), true.into());

    let mut user = serde_yaml::Mapping::new();
    user.insert("username".into(), username.into());
    user.insert("password".into(), password.into());
    mapping.insert("basicAuthUser".into(), serde_yaml::Value::Mapping(user));

    serde_yaml::to_string(&config)
}

#[async_trait]
impl Command for ConfigureExternalAccessCommand {
    fn id(&self) -> &str {
        "configure_external_access"
    }

    fn display_name(&self) -> &str {
        "Configure external access"
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> CommandResult {
        let Some(request) = ctx.deployment_request() else {
            return CommandResult::failure(
                ErrorKind::Config,
                "no deployment request in context",
                false,
            );
        };
        let exec = ctx.exec();

        let username = request
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "admin".to_string());
        let password = request
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(generate_password);

        let config_path = format!("{}/config.yaml", request.data_path.trim_end_matches('/'));

        let current = match exec
            .exec(&as_root(&format!("cat {} 2>/dev/null || true", config_path)))
            .await
        {
            Ok(out) => out.stdout_trimmed(),
            Err(e) => return CommandResult::from_ssh_error(&e),
        };

        let merged = match merge_config_yaml(&current, &username, &password) {
            Ok(yaml) => yaml,
            Err(e) => {
                return CommandResult::failure(
                    ErrorKind::RemoteExec,
                    format!("existing {} is not valid YAML: {}", config_path, e),
                    false,
                )
            }
        };

        ctx.progress
            .emit(ProgressEvent::info(
                self.id(),
                0,
                "writing access credentials",
            ))
            .await;
        let write = format!(
            "{backup}; cat > {path} <<'STGATE_EOF'\n{yaml}\nSTGATE_EOF",
            backup = backup_script(&config_path),
            path = shell_quote(&config_path),
            yaml = merged
        );
        match exec.exec(&as_root(&with_remote_lock(&write))).await {
            Ok(out) if out.is_success() => {}
            Ok(out) => {
                return CommandResult::failure(
                    ErrorKind::RemoteExec,
                    format!("writing {} failed: {}", config_path, out.stderr_tail(5)),
                    false,
                )
            }
            Err(e) => return CommandResult::from_ssh_error(&e),
        }

        ctx.progress
            .emit(ProgressEvent::info(self.id(), 0, "restarting container"))
            .await;
        let restart = as_root(&format!("docker restart {}", request.container_name));
        match exec.exec_with_timeout(&restart, RESTART_TIMEOUT).await {
            Ok(out) if out.is_success() => {}
            Ok(out) => {
                return CommandResult::failure(
                    ErrorKind::RemoteExec,
                    format!("container restart failed: {}", out.stderr_tail(5)),
                    true,
                )
            }
            Err(e) => return CommandResult::from_ssh_error(&e),
        }

        let host: String = ctx.get(TARGET_HOST).unwrap_or_default();
        let access = ExternalAccess {
            url: format!("http://{}:{}/", host, request.port),
            username,
            password,
        };
        ctx.set(EXTERNAL_ACCESS, &access);
        CommandResult::Success
    }
}
