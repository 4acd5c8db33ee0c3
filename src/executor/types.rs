use std::string::FromUtf8Error;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Errors that can occur when processing or parsing remote command output
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("UTF-8 conversion error: {0}")]
    Utf8Error(#[from] FromUtf8Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Output exceeds maximum size: {size} bytes")]
    OutputTooLarge { size: usize },
}

/// Raw result of one remote command: stdout/stderr bytes, exit code, timing.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: u32,
    pub timestamp: SystemTime,
    pub duration: Duration,
}

impl Default for ExecOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecOutput {
    const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024; // 10 MB

    pub fn new() -> Self {
        Self {
            stdout: vec![],
            stderr: vec![],
            exit_code: 0,
            timestamp: SystemTime::now(),
            duration: Duration::default(),
        }
    }

    /// Update `duration` based on time elapsed since `timestamp`.
    pub fn stop_timing(&mut self) {
        if let Ok(elapsed) = self.timestamp.elapsed() {
            self.duration = elapsed;
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert stdout bytes to UTF-8 string
    pub fn stdout_string(&self) -> Result<String, OutputError> {
        if self.stdout.len() > Self::MAX_OUTPUT_SIZE {
            return Err(OutputError::OutputTooLarge {
                size: self.stdout.len(),
            });
        }
        Ok(String::from_utf8(self.stdout.clone())?)
    }

    /// Convert stderr bytes to UTF-8 string
    pub fn stderr_string(&self) -> Result<String, OutputError> {
        if self.stderr.len() > Self::MAX_OUTPUT_SIZE {
            return Err(OutputError::OutputTooLarge {
                size: self.stderr.len(),
            });
        }
        Ok(String::from_utf8(self.stderr.clone())?)
    }

    /// Split stdout into lines (trim and filter out empty lines).
    pub fn stdout_lines(&self) -> Result<Vec<String>, OutputError> {
        Ok(self
            .stdout_string()?
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// First stdout line, trimmed. Convenient for single-value probes.
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Last `max_lines` of stderr, for embedding in failure messages.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }

    /// Check if stdout contains a given pattern (simple substring).
    pub fn contains(&self, pattern: &str) -> bool {
        self.stdout_string()
            .map(|s| s.contains(pattern))
            .unwrap_or(false)
    }
}
