use crate::pipeline::context::{OsInfo, PkgMgr, OS_INFO};
use crate::pipeline::{Command, CommandContext, CommandResult, ErrorKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Reads `/etc/os-release`, maps the distribution to its package manager,
/// probes for root/sudo and basic capacity. Everything downstream keys off
/// the `OS_INFO` this writes.
pub struct DetectOsCommand;

fn parse_os_release(content: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            values.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    values
}

/// `MemTotal:  16316136 kB` → MiB.
fn parse_mem_total_mb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))?
        .split_whitespace()
        .nth(1)?
        .parse::<u64>()
        .ok()
        .map(|kb| kb / 1024)
}

/// Available MiB on `/` from `df -Pm /` (POSIX format, second line, fourth
/// column).
fn parse_disk_avail_mb(df: &str) -> Option<u64> {
    df.lines()
        .nth(1)?
        .split_whitespace()
        .nth(3)?
        .parse::<u64>()
        .ok()
}

#[async_trait]
impl Command for DetectOsCommand {
    fn id(&self) -> &str {
        "detect_os"
    }

    fn display_name(&self) -> &str {
        "Detect operating system"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> CommandResult {
        let exec = ctx.exec();

        let release = match exec.exec("cat /etc/os-release").await {
            Ok(out) if out.is_success() => out.stdout_trimmed(),
            Ok(out) => {
                return CommandResult::failure(
                    ErrorKind::RemoteExec,
                    format!("could not read /etc/os-release: {}", out.stderr_tail(3)),
                    false,
                )
            }
            Err(e) => return CommandResult::from_ssh_error(&e),
        };

        let values = parse_os_release(&release);
        let id = values.get("ID").cloned().unwrap_or_default();
        let version_id = values.get("VERSION_ID").cloned().unwrap_or_default();
        let codename = values.get("VERSION_CODENAME").cloned().unwrap_or_default();

        let Some(pkg_mgr) = PkgMgr::from_os_id(&id) else {
            return CommandResult::failure(
                ErrorKind::Config,
                format!("unsupported operating system '{}'", id),
                false,
            );
        };

        // Passwordless sudo, else effective uid 0.
        let has_root = match exec.exec("sudo -n true").await {
            Ok(out) if out.is_success() => true,
            Ok(_) | Err(_) => match exec.exec("id -u").await {
                Ok(out) => out.stdout_trimmed() == "0",
                Err(e) => return CommandResult::from_ssh_error(&e),
            },
        };

        let cpu_cores = match exec.exec("nproc").await {
            Ok(out) if out.is_success() => out.stdout_trimmed().parse().unwrap_or(1),
            _ => 1,
        };
        let mem_mb = match exec.exec("cat /proc/meminfo").await {
            Ok(out) if out.is_success() => {
                parse_mem_total_mb(&out.stdout_trimmed()).unwrap_or(0)
            }
            _ => 0,
        };
        let disk_mb = match exec.exec("df -Pm /").await {
            Ok(out) if out.is_success() => {
                parse_disk_avail_mb(&out.stdout_trimmed()).unwrap_or(0)
            }
            _ => 0,
        };

        let info = OsInfo {
            id,
            version_id,
            codename,
            pkg_mgr,
            has_root,
            cpu_cores,
            mem_mb,
            disk_mb,
        };
        tracing::info!(session = %ctx.session_id, os = %info.id, version = %info.version_id,
            "detected target OS");
        ctx.set(OS_INFO, &info);
        CommandResult::Success
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::ScriptedExec;
    use crate::pipeline::{ProgressSink, context};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const UBUNTU_RELEASE: &str = r#"PRETTY_NAME="Ubuntu 22.04.4 LTS"
NAME="Ubuntu"
VERSION_ID="22.04"
VERSION="22.04.4 LTS (Jammy Jellyfish)"
VERSION_CODENAME=jammy
ID=ubuntu
ID_LIKE=debian
"#;

    fn ctx_with(exec: Arc<ScriptedExec>) -> CommandContext {
        CommandContext::new(
            "s1".to_string(),
            exec,
            ProgressSink::disabled(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn detects_ubuntu_with_sudo() {
        let exec = Arc::new(ScriptedExec::new());
        exec.on("os-release", UBUNTU_RELEASE, 0).await;
        exec.on("sudo -n true", "", 0).await;
        exec.on("nproc", "4", 0).await;
        exec.on("meminfo", "MemTotal:       8167788 kB\nMemFree: 1 kB", 0)
            .await;
        exec.on(
            "df -Pm /",
            "Filesystem 1048576-blocks Used Available Capacity Mounted on\n/dev/vda1 81106 20000 57521 26% /",
            0,
        )
        .await;

        let mut ctx = ctx_with(exec);
        let result = DetectOsCommand.execute(&mut ctx).await;
        assert!(matches!(result, CommandResult::Success));

        let info = ctx.os_info().unwrap();
        assert_eq!(info.id, "ubuntu");
        assert_eq!(info.version_id, "22.04");
        assert_eq!(info.codename, "jammy");
        assert_eq!(info.pkg_mgr, PkgMgr::Apt);
        assert!(info.has_root);
        assert_eq!(info.cpu_cores, 4);
        assert_eq!(info.mem_mb, 7976);
        assert_eq!(info.disk_mb, 57521);
    }

    #[tokio::test]
    async fn root_uid_counts_without_sudo() {
        let exec = Arc::new(ScriptedExec::new());
        exec.on("os-release", "ID=alpine\nVERSION_ID=3.20\n", 0).await;
        exec.on("sudo -n true", "", 1).await;
        exec.on("id -u", "0", 0).await;

        let mut ctx = ctx_with(exec);
        assert!(matches!(
            DetectOsCommand.execute(&mut ctx).await,
            CommandResult::Success
        ));
        let info = ctx.os_info().unwrap();
        assert_eq!(info.pkg_mgr, PkgMgr::Apk);
        assert!(info.has_root);
    }

    #[tokio::test]
    async fn unknown_distribution_is_a_hard_failure() {
        let exec = Arc::new(ScriptedExec::new());
        exec.on("os-release", "ID=plan9\n", 0).await;

        let mut ctx = ctx_with(exec);
        let result = DetectOsCommand.execute(&mut ctx).await;
        match result {
            CommandResult::Failure {
                kind, retryable, ..
            } => {
                assert_eq!(kind, ErrorKind::Config);
                assert!(!retryable);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(ctx.get::<OsInfo>(context::OS_INFO).is_none());
    }

    #[test]
    fn meminfo_and_df_parsers() {
        assert_eq!(
            parse_mem_total_mb("MemTotal:       2048000 kB"),
            Some(2000)
        );
        assert_eq!(parse_mem_total_mb("bogus"), None);
        let df = "Filesystem 1048576-blocks Used Available Capacity Mounted on\n/dev/sda1 100 40 60 40% /";
        assert_eq!(parse_disk_avail_mb(df), Some(60));
    }
}
