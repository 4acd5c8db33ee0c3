mod check_tool;
mod create_container;
mod detect_location;
mod detect_os;
mod docker_mirror;
mod external_access;
mod install_docker;
mod pull_image;
mod system_mirrors;
mod verify;

pub use check_tool::{CheckDockerCommand, CheckToolCommand};
pub use create_container::CreateContainerCommand;
pub use detect_location::DetectLocationCommand;
pub use detect_os::DetectOsCommand;
pub use docker_mirror::ConfigureDockerMirrorCommand;
pub use external_access::ConfigureExternalAccessCommand;
pub use install_docker::InstallDockerCommand;
pub use pull_image::PullImageCommand;
pub use system_mirrors::{ConfigureSystemMirrorsCommand, DEFAULT_CN_MIRROR};
pub use verify::VerifyCommand;

use std::time::Duration;

/// Remote config files are mutated under this target-side lock so two
/// gateways (or two sessions) never interleave writes on one host.
pub const REMOTE_LOCK: &str = "/var/lock/st-orchestrator.lock";

/// How many `.bak.<timestamp>` copies of a mutated file are kept.
pub const BACKUP_KEEP: usize = 5;

pub const INSTALL_STEP_TIMEOUT: Duration = Duration::from_secs(600);
pub const PULL_TIMEOUT: Duration = Duration::from_secs(900);

/// POSIX single-quote escaping.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Run a script as root: directly when already uid 0, through
/// non-interactive sudo otherwise. The decision happens on the target.
pub(crate) fn as_root(script: &str) -> String {
    let quoted = shell_quote(script);
    format!(
        "if [ \"$(id -u)\" = \"0\" ]; then sh -c {q}; else sudo -n sh -c {q}; fi",
        q = quoted
    )
}

/// Serialize a mutating script against the per-host lock.
pub(crate) fn with_remote_lock(script: &str) -> String {
    format!("flock {} sh -c {}", REMOTE_LOCK, shell_quote(script))
}

/// Back up `path` with a timestamp suffix and prune old backups to
/// `BACKUP_KEEP`. Returned script is meant to run before the rewrite.
pub(crate) fn backup_script(path: &str) -> String {
    format!(
        "[ -f {p} ] && cp -p {p} {p}.bak.$(date +%Y%m%d%H%M%S) || true; \
         ls -1t {p}.bak.* 2>/dev/null | tail -n +{keep} | xargs -r rm -f --",
        p = path,
        keep = BACKUP_KEEP + 1
    )
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_embedded_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn as_root_falls_back_to_sudo() {
        let script = as_root("apt-get update");
        assert!(script.contains("sudo -n sh -c"));
        assert!(script.contains("id -u"));
    }

    #[test]
    fn backup_script_rotates_to_keep_limit() {
        let script = backup_script("/etc/apt/sources.list");
        assert!(script.contains(".bak.$(date"));
        assert!(script.contains("tail -n +6"));
    }
}
