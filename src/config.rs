use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration: every knob is a flag with an environment
/// fallback, so containerized deployments configure purely via env.
#[derive(Parser, Debug, Clone)]
#[command(name = "stgate")]
#[command(about = "Remote server orchestration gateway", long_about = None, version)]
pub struct GatewayConfig {
    /// Listen address, e.g. ":8080" or "127.0.0.1:9000"
    #[arg(long, env = "GATEWAY_LISTEN", default_value = ":8080")]
    pub listen: String,

    /// Maximum frame size on the message channel
    #[arg(long, env = "FRAME_MAX_BYTES", default_value_t = 2 * 1024 * 1024)]
    pub frame_max_bytes: usize,

    /// Bound of the decoder→dispatcher queue
    #[arg(long, env = "INBOUND_QUEUE", default_value_t = 1000)]
    pub inbound_queue: usize,

    /// Bound of the per-client writer queue
    #[arg(long, env = "WRITER_QUEUE", default_value_t = 256)]
    pub writer_queue: usize,

    #[arg(long, env = "WORKER_POOL_MIN", default_value_t = 4)]
    pub worker_pool_min: usize,

    #[arg(long, env = "WORKER_POOL_MAX", default_value_t = 8)]
    pub worker_pool_max: usize,

    /// Idle SSH sessions are evicted after this long without byte I/O
    #[arg(long, env = "SESSION_IDLE_TTL", default_value = "30m", value_parser = humantime::parse_duration)]
    pub session_idle_ttl: Duration,

    /// Export artifacts expire after this long
    #[arg(long, env = "EXPORT_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub export_ttl: Duration,

    /// Pending confirmations auto-cancel after this long
    #[arg(long, env = "CONFIRM_TTL", default_value = "10m", value_parser = humantime::parse_duration)]
    pub confirm_ttl: Duration,

    /// Comma-separated IP-geolocation endpoints ({ip} is substituted)
    #[arg(long, env = "GEO_ENDPOINTS", value_delimiter = ',')]
    pub geo_endpoints: Vec<String>,

    /// Comma-separated registry mirrors used when the target is in China
    #[arg(long, env = "DOCKER_MIRROR_CN", value_delimiter = ',')]
    pub docker_mirror_cn: Vec<String>,

    #[arg(long, env = "APT_MIRROR_CN", default_value = crate::commands::DEFAULT_CN_MIRROR)]
    pub apt_mirror_cn: String,

    #[arg(long, env = "YUM_MIRROR_CN", default_value = crate::commands::DEFAULT_CN_MIRROR)]
    pub yum_mirror_cn: String,

    /// Token that grants the admin role on CONNECT
    #[arg(long, env = "ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Accept tokenless end-user connections as anonymous
    #[arg(long, env = "ALLOW_ANONYMOUS", default_value_t = true, action = ArgAction::Set)]
    pub allow_anonymous: bool,

    /// Ceiling on the uncompressed size of imported archives
    #[arg(long, env = "IMPORT_MAX_BYTES", default_value_t = 2 * 1024 * 1024 * 1024)]
    pub import_max_bytes: u64,

    /// Where uploaded import archives are picked up from
    #[arg(long, env = "UPLOAD_DIR")]
    pub upload_dir: Option<PathBuf>,

    /// Increase message verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl GatewayConfig {
    /// ":8080" listens on all interfaces; anything else must be a full
    /// socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let normalized = if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        };
        normalized.parse()
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("stgate").join("uploads"))
    }
}

pub fn parse_args() -> GatewayConfig {
    GatewayConfig::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(args: &[&str]) -> GatewayConfig {
        GatewayConfig::try_parse_from(std::iter::once("stgate").chain(args.iter().copied()))
            .expect("parse")
    }

    #[test]
    fn defaults_match_the_contract() {
        let config = config_from(&[]);
        assert_eq!(config.listen, ":8080");
        assert_eq!(config.frame_max_bytes, 2 * 1024 * 1024);
        assert_eq!(config.inbound_queue, 1000);
        assert_eq!(config.writer_queue, 256);
        assert_eq!(config.session_idle_ttl, Duration::from_secs(30 * 60));
        assert_eq!(config.export_ttl, Duration::from_secs(3600));
        assert_eq!(config.confirm_ttl, Duration::from_secs(600));
        assert!(config.allow_anonymous);
    }

    #[test]
    fn bare_port_listen_address_binds_all_interfaces() {
        let config = config_from(&[]);
        assert_eq!(config.listen_addr().unwrap().to_string(), "0.0.0.0:8080");

        let config = config_from(&["--listen", "127.0.0.1:9000"]);
        assert_eq!(config.listen_addr().unwrap().to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn geo_endpoints_split_on_commas() {
        let config = config_from(&["--geo-endpoints", "http://a/{ip},http://b/{ip}"]);
        assert_eq!(config.geo_endpoints.len(), 2);
    }

    #[test]
    fn durations_accept_human_units() {
        let config = config_from(&["--session-idle-ttl", "90s"]);
        assert_eq!(config.session_idle_ttl, Duration::from_secs(90));
    }
}
