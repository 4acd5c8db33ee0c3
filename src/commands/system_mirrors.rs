use super::{as_root, backup_script, with_remote_lock, INSTALL_STEP_TIMEOUT};
use crate::pipeline::context::PkgMgr;
use crate::pipeline::{Command, CommandContext, CommandResult, ErrorKind, ProgressEvent};
use async_trait::async_trait;
use std::time::Duration;

pub const DEFAULT_CN_MIRROR: &str = "mirrors.aliyun.com";

/// Rewrites the distribution's package sources to a regional mirror when
/// the target sits behind the usual slow routes (China decision from
/// `detect_location`). Stock files are backed up with a timestamp suffix
/// before the first rewrite; a second run detects its own edit and skips.
pub struct ConfigureSystemMirrorsCommand {
    apt_mirror: String,
    yum_mirror: String,
}

impl ConfigureSystemMirrorsCommand {
    pub fn new(apt_mirror: String, yum_mirror: String) -> Self {
        Self {
            apt_mirror,
            yum_mirror,
        }
    }
}

impl Default for ConfigureSystemMirrorsCommand {
    fn default() -> Self {
        Self::new(DEFAULT_CN_MIRROR.to_string(), DEFAULT_CN_MIRROR.to_string())
    }
}

struct MirrorPlan {
    /// Substring whose presence means the file is already rewritten.
    marker_probe: String,
    rewrite: String,
    refresh: String,
}

impl ConfigureSystemMirrorsCommand {
    fn plan_for(&self, pkg_mgr: PkgMgr) -> MirrorPlan {
        match pkg_mgr {
            PkgMgr::Apt => MirrorPlan {
                marker_probe: format!("grep -q {} /etc/apt/sources.list", self.apt_mirror),
                rewrite: format!(
                    "{backup} && sed -i \
                     -e 's|archive.ubuntu.com|{m}|g' \
                     -e 's|security.ubuntu.com|{m}|g' \
                     -e 's|deb.debian.org|{m}|g' /etc/apt/sources.list",
                    backup = backup_script("/etc/apt/sources.list"),
                    m = self.apt_mirror
                ),
                refresh: "apt-get update".to_string(),
            },
            PkgMgr::Yum | PkgMgr::Dnf => MirrorPlan {
                marker_probe: format!("grep -qr {} /etc/yum.repos.d/", self.yum_mirror),
                rewrite: format!(
                    "for f in /etc/yum.repos.d/*.repo; do {backup_expr}; done && sed -i \
                     -e 's|^mirrorlist=|#mirrorlist=|g' \
                     -e 's|^#baseurl=http://mirror.centos.org|baseurl=https://{m}|g' \
                     -e 's|^metalink=|#metalink=|g' /etc/yum.repos.d/*.repo",
                    backup_expr = "cp -p \"$f\" \"$f.bak.$(date +%Y%m%d%H%M%S)\"",
                    m = self.yum_mirror
                ),
                refresh: if pkg_mgr == PkgMgr::Dnf {
                    "dnf makecache".to_string()
                } else {
                    "yum makecache".to_string()
                },
            },
            PkgMgr::Pacman => MirrorPlan {
                marker_probe: format!("grep -q {} /etc/pacman.d/mirrorlist", self.apt_mirror),
                rewrite: format!(
                    "{backup} && sed -i '1i Server = https://{m}/archlinux/$repo/os/$arch' \
                     /etc/pacman.d/mirrorlist",
                    backup = backup_script("/etc/pacman.d/mirrorlist"),
                    m = self.apt_mirror
                ),
                refresh: "pacman -Syy --noconfirm".to_string(),
            },
            PkgMgr::Apk => MirrorPlan {
                marker_probe: format!("grep -q {} /etc/apk/repositories", self.apt_mirror),
                rewrite: format!(
                    "{backup} && sed -i 's|dl-cdn.alpinelinux.org|{m}|g' /etc/apk/repositories",
                    backup = backup_script("/etc/apk/repositories"),
                    m = self.apt_mirror
                ),
                refresh: "apk update".to_string(),
            },
        }
    }
}

#[async_trait]
impl Command for ConfigureSystemMirrorsCommand {
    fn id(&self) -> &str {
        "configure_system_mirrors"
    }

    fn display_name(&self) -> &str {
        "Configure system package mirrors"
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> CommandResult {
        if !ctx.use_china_mirror() {
            return CommandResult::skipped("target is not in China, keeping stock mirrors");
        }
        let Some(os) = ctx.os_info() else {
            return CommandResult::failure(
                ErrorKind::Config,
                "OS detection has not run before mirror configuration",
                false,
            );
        };

        let exec = ctx.exec();
        let plan = self.plan_for(os.pkg_mgr);

        match exec.exec(&plan.marker_probe).await {
            Ok(out) if out.is_success() => {
                return CommandResult::skipped("package sources already point at the mirror");
            }
            Ok(_) => {}
            Err(e) => return CommandResult::from_ssh_error(&e),
        }

        ctx.progress
            .emit(ProgressEvent::info(
                self.id(),
                0,
                "rewriting package sources",
            ))
            .await;
        let rewrite = as_root(&with_remote_lock(&plan.rewrite));
        match exec.exec(&rewrite).await {
            Ok(out) if out.is_success() => {}
            Ok(out) => {
                return CommandResult::failure(
                    ErrorKind::RemoteExec,
                    format!("source rewrite failed: {}", out.stderr_tail(5)),
                    false,
                )
            }
            Err(e) => return CommandResult::from_ssh_error(&e),
        }

        ctx.progress
            .emit(ProgressEvent::info(
                self.id(),
                0,
                "refreshing package metadata",
            ))
            .await;
        match exec
            .exec_with_timeout(&as_root(&plan.refresh), INSTALL_STEP_TIMEOUT)
            .await
        {
            Ok(out) if out.is_success() => CommandResult::Success,
            Ok(out) => CommandResult::failure(
                ErrorKind::RemoteExec,
                format!("package metadata refresh failed: {}", out.stderr_tail(5)),
                true,
            ),
            Err(e) => CommandResult::from_ssh_error(&e),
        }
    }
}
