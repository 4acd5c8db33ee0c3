use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Info,
    Warn,
    Error,
    Success,
}

/// Structured progress record streamed to the owning client on
/// `/user/queue/deployment/progress`. Values are copied onto the queue and
/// never mutated after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub percent: u8,
    pub message: String,
    pub level: ProgressLevel,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: &str, percent: u8, message: impl Into<String>, level: ProgressLevel) -> Self {
        Self {
            stage: stage.to_string(),
            percent: percent.min(100),
            message: message.into(),
            level,
            timestamp: Utc::now(),
        }
    }

    pub fn info(stage: &str, percent: u8, message: impl Into<String>) -> Self {
        Self::new(stage, percent, message, ProgressLevel::Info)
    }

    pub fn warn(stage: &str, percent: u8, message: impl Into<String>) -> Self {
        Self::new(stage, percent, message, ProgressLevel::Warn)
    }

    pub fn error(stage: &str, percent: u8, message: impl Into<String>) -> Self {
        Self::new(stage, percent, message, ProgressLevel::Error)
    }

    pub fn success(stage: &str, percent: u8, message: impl Into<String>) -> Self {
        Self::new(stage, percent, message, ProgressLevel::Success)
    }

    /// Stage transitions and terminal events survive slow consumers;
    /// everything else may be dropped under backpressure.
    pub fn is_critical(&self) -> bool {
        matches!(self.level, ProgressLevel::Error | ProgressLevel::Success)
            || self.stage == "complete"
    }
}

/// Sending half of a pipeline's progress stream. Cloned into commands so
/// long-running steps can narrate sub-steps.
#[derive(Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that swallows events; unit tests that don't care use this.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub async fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(event).await {
                tracing::warn!("failed to forward progress event: {}", e);
            }
        }
    }
}

/// Paces repetitive progress (byte counters, pull output) to at most
/// `max_hz` events per second.
pub struct RateGate {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateGate {
    pub fn new(max_hz: u32) -> Self {
        Self {
            min_interval: Duration::from_millis(1000 / u64::from(max_hz.max(1))),
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped() {
        assert_eq!(ProgressEvent::info("x", 250, "m").percent, 100);
    }

    #[test]
    fn terminal_events_are_critical() {
        assert!(ProgressEvent::error("pull_image", 40, "boom").is_critical());
        assert!(ProgressEvent::success("complete", 100, "done").is_critical());
        assert!(!ProgressEvent::info("pull_image", 40, "layer 3/9").is_critical());
    }

    #[test]
    fn rate_gate_limits_bursts() {
        let mut gate = RateGate::new(10);
        assert!(gate.ready());
        assert!(!gate.ready());
    }
}
