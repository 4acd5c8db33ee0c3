use super::progress::ProgressSink;
use crate::executor::RemoteExec;
use crate::session::SessionId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Canonical shared-context keys. Commands agree on these; nothing else
// reads the bag directly.
pub const OS_INFO: &str = "OS_INFO";
pub const LOCATION_INFO: &str = "LOCATION_INFO";
pub const DOCKER_STATUS: &str = "DOCKER_STATUS";
pub const DEPLOYMENT_REQUEST: &str = "DEPLOYMENT_REQUEST";
pub const EXTERNAL_ACCESS: &str = "EXTERNAL_ACCESS";
pub const TARGET_HOST: &str = "TARGET_HOST";

pub fn tool_installed_key(tool: &str) -> String {
    format!("{}_INSTALLED", tool.to_ascii_uppercase())
}

pub fn tool_version_key(tool: &str) -> String {
    format!("{}_VERSION", tool.to_ascii_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PkgMgr {
    Apt,
    Yum,
    Dnf,
    Pacman,
    Apk,
}

impl PkgMgr {
    /// Closed mapping from /etc/os-release `ID` values; anything else is an
    /// unsupported OS.
    pub fn from_os_id(id: &str) -> Option<Self> {
        match id {
            "ubuntu" | "debian" => Some(PkgMgr::Apt),
            "centos" | "rhel" | "rocky" | "alma" | "almalinux" => Some(PkgMgr::Yum),
            "fedora" => Some(PkgMgr::Dnf),
            "arch" | "manjaro" => Some(PkgMgr::Pacman),
            "alpine" => Some(PkgMgr::Apk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsInfo {
    pub id: String,
    pub version_id: String,
    pub codename: String,
    pub pkg_mgr: PkgMgr,
    pub has_root: bool,
    pub cpu_cores: u32,
    pub mem_mb: u64,
    pub disk_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationInfo {
    pub country_code: String,
    pub use_china_mirror: bool,
    /// Which probe produced the answer (endpoint host, or "default").
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerStatus {
    pub installed: bool,
    pub service_running: bool,
    pub version: Option<String>,
}

/// What to deploy, straight from the client's start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub container_name: String,
    pub image: String,
    pub port: u16,
    pub data_path: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAccess {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// The typed key/value record threaded through one pipeline run. Commands
/// run sequentially on one context, so reads and writes are naturally
/// serialized; a command that fans out internally must collect results and
/// perform the single mutation itself.
pub struct CommandContext {
    pub session_id: SessionId,
    exec: Arc<dyn RemoteExec>,
    shared: HashMap<String, serde_json::Value>,
    pub progress: ProgressSink,
    pub cancel: CancellationToken,
}

impl CommandContext {
    pub fn new(
        session_id: SessionId,
        exec: Arc<dyn RemoteExec>,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            exec,
            shared: HashMap::new(),
            progress,
            cancel,
        }
    }

    pub fn exec(&self) -> Arc<dyn RemoteExec> {
        self.exec.clone()
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.shared.insert(key.to_string(), v);
            }
            Err(e) => tracing::warn!("failed to serialize context key '{}': {}", key, e),
        }
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.shared
            .insert(key.to_string(), serde_json::Value::Bool(value));
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.shared
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.shared.get(key).and_then(|v| v.as_bool())
    }

    pub fn os_info(&self) -> Option<OsInfo> {
        self.get(OS_INFO)
    }

    pub fn docker_status(&self) -> Option<DockerStatus> {
        self.get(DOCKER_STATUS)
    }

    pub fn deployment_request(&self) -> Option<DeploymentRequest> {
        self.get(DEPLOYMENT_REQUEST)
    }

    /// Mirror decision; absent location info means "no China mirrors".
    pub fn use_china_mirror(&self) -> bool {
        self.get::<LocationInfo>(LOCATION_INFO)
            .map(|l| l.use_china_mirror)
            .unwrap_or(false)
    }
}
