use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum SshError {
    #[error("SSH authentication failed: {0}")]
    Auth(String),

    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),

    #[error("SSH connection closed")]
    ConnectionClosed,

    #[error("network error: {0}")]
    Network(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),
}

impl SshError {
    /// Transport reads and per-command timeouts are worth retrying;
    /// connect and auth failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SshError::Network(_) | SshError::Timeout(_))
    }
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        match e {
            russh::Error::Disconnect | russh::Error::ChannelOpenFailure(_) => {
                SshError::ConnectionClosed
            }
            russh::Error::NotAuthenticated => SshError::Auth("not authenticated".to_string()),
            russh::Error::IO(io) => SshError::Network(io.to_string()),
            other => SshError::Protocol(other.to_string()),
        }
    }
}
