use crate::pipeline::context::{LocationInfo, LOCATION_INFO, TARGET_HOST};
use crate::pipeline::{Command, CommandContext, CommandResult};
use async_trait::async_trait;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PROBES: usize = 3;

pub const DEFAULT_GEO_ENDPOINTS: &[&str] = &[
    "http://ip-api.com/json/{ip}",
    "https://ipinfo.io/{ip}/json",
    "https://api.ip.sb/geoip/{ip}",
];

/// Resolves the target server's region by asking public IP-geo endpoints
/// about its address, first answer wins. The only consumer-visible output
/// is the mirror decision: `useChinaMirror = (country == CN)`. Total
/// failure degrades to a skip with mirrors off.
pub struct DetectLocationCommand {
    endpoints: Vec<String>,
    client: reqwest::Client,
}

impl DetectLocationCommand {
    pub fn new(endpoints: Vec<String>) -> Self {
        let endpoints = if endpoints.is_empty() {
            DEFAULT_GEO_ENDPOINTS.iter().map(|s| s.to_string()).collect()
        } else {
            endpoints
        };
        Self {
            endpoints,
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for DetectLocationCommand {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// The probed endpoints disagree on field naming; accept the common ones.
fn extract_country_code(value: &serde_json::Value) -> Option<String> {
    for key in ["countryCode", "country_code", "country"] {
        if let Some(code) = value.get(key).and_then(|v| v.as_str()) {
            if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Some(code.to_ascii_uppercase());
            }
        }
    }
    None
}

fn endpoint_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

#[async_trait]
impl Command for DetectLocationCommand {
    fn id(&self) -> &str {
        "detect_location"
    }

    fn display_name(&self) -> &str {
        "Detect server location"
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut CommandContext) -> CommandResult {
        let host: String = ctx.get(TARGET_HOST).unwrap_or_default();

        for endpoint in self.endpoints.iter().take(MAX_PROBES) {
            if ctx.cancel.is_cancelled() {
                return CommandResult::cancelled();
            }
            let url = endpoint.replace("{ip}", &host);
            let response = tokio::select! {
                _ = ctx.cancel.cancelled() => return CommandResult::cancelled(),
                r = self.client.get(&url).send() => r,
            };
            let body = match response {
                Ok(r) if r.status().is_success() => r.json::<serde_json::Value>().await,
                Ok(r) => {
                    tracing::debug!("geo endpoint {} answered {}", url, r.status());
                    continue;
                }
                Err(e) => {
                    tracing::debug!("geo endpoint {} unreachable: {}", url, e);
                    continue;
                }
            };
            let Ok(body) = body else { continue };
            if let Some(country_code) = extract_country_code(&body) {
                let info = LocationInfo {
                    use_china_mirror: country_code == "CN",
                    method: endpoint_host(endpoint),
                    country_code,
                };
                tracing::info!(session = %ctx.session_id, country = %info.country_code,
                    via = %info.method, "resolved target location");
                ctx.set(LOCATION_INFO, &info);
                return CommandResult::Success;
            }
        }

        // No endpoint answered; deploy with default (non-China) mirrors.
        ctx.set(
            LOCATION_INFO,
            &LocationInfo {
                country_code: String::new(),
                use_china_mirror: false,
                method: "default".to_string(),
            },
        );
        CommandResult::skipped("location could not be determined, using default mirrors")
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn country_code_field_variants() {
        assert_eq!(
            extract_country_code(&json!({"countryCode": "CN"})),
            Some("CN".to_string())
        );
        assert_eq!(
            extract_country_code(&json!({"country_code": "de"})),
            Some("DE".to_string())
        );
        assert_eq!(
            extract_country_code(&json!({"country": "US"})),
            Some("US".to_string())
        );
        // ipinfo-style spelled-out country names are not codes
        assert_eq!(extract_country_code(&json!({"country": "China"})), None);
        assert_eq!(extract_country_code(&json!({"region": "Asia"})), None);
    }

    #[test]
    fn endpoint_host_strips_path_and_placeholder() {
        assert_eq!(
            endpoint_host("http://ip-api.com/json/{ip}"),
            "ip-api.com".to_string()
        );
    }

    #[test]
    fn default_endpoints_are_used_when_config_is_empty() {
        let cmd = DetectLocationCommand::new(Vec::new());
        assert_eq!(cmd.endpoints.len(), 3);
    }
}
