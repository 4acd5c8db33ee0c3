use super::ErrorKind;
use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
    /// Closed table of next-step suggestions keyed by (command id, error
    /// kind). Failure messages shown to the user end with one of these.
    static ref HINTS: HashMap<(&'static str, ErrorKind), &'static str> = {
        let mut m = HashMap::new();
        m.insert(
            ("detect_os", ErrorKind::RemoteExec),
            "make sure the target is a supported Linux distribution (apt, yum, dnf, pacman or apk based)",
        );
        m.insert(
            ("detect_location", ErrorKind::Timeout),
            "geolocation lookups are optional; re-run or skip the step to proceed without regional mirrors",
        );
        m.insert(
            ("configure_system_mirrors", ErrorKind::RemoteExec),
            "restore the .bak copy of the sources file on the target, then re-run the step",
        );
        m.insert(
            ("configure_docker_mirror", ErrorKind::RemoteExec),
            "check /etc/docker/daemon.json on the target for manual edits, then re-run the step",
        );
        m.insert(
            ("install_docker", ErrorKind::Config),
            "re-run the deployment as root or as a user with passwordless sudo",
        );
        m.insert(
            ("install_docker", ErrorKind::RemoteExec),
            "inspect the package manager output above, resolve the reported conflict, then retry the installation",
        );
        m.insert(
            ("install_docker", ErrorKind::Timeout),
            "package downloads are slow from this host; configure regional mirrors and retry",
        );
        m.insert(
            ("pull_image", ErrorKind::Timeout),
            "check registry connectivity from the target or configure a registry mirror, then retry",
        );
        m.insert(
            ("pull_image", ErrorKind::RemoteExec),
            "verify the image name and tag exist in the registry",
        );
        m.insert(
            ("create_container", ErrorKind::RemoteExec),
            "check for a port conflict or a leftover container with the same name (`docker ps -a`)",
        );
        m.insert(
            ("verify", ErrorKind::RemoteExec),
            "inspect the container logs on the target with `docker logs`",
        );
        m.insert(
            ("configure_external_access", ErrorKind::RemoteExec),
            "check that the data path is writable and restart the container manually",
        );
        m
    };
}

fn default_hint(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Config => "check the request parameters and try again",
        ErrorKind::Auth => "verify the SSH credentials for the target server",
        ErrorKind::Transport => "check network connectivity to the target server and retry",
        ErrorKind::RemoteExec => "inspect the command output above and re-run the step",
        ErrorKind::Timeout => "the target responded slowly; retry the step",
        ErrorKind::Cancelled => "start a new deployment when ready",
        ErrorKind::Protocol => "reconnect and retry the request",
        ErrorKind::Data => "fix the reported data problem and try again",
    }
}

pub fn next_step_hint(command_id: &str, kind: ErrorKind) -> &'static str {
    HINTS
        .get(&(command_id, kind))
        .copied()
        .unwrap_or_else(|| default_hint(kind))
}
