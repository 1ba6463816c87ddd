//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Keepalive lost")]
    KeepaliveLost,

    #[error("Server busy: {current}/{max} sessions")]
    ServerBusy { current: usize, max: usize },

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Stable wire code carried in `connectError` frames.
    pub fn code(&self) -> &'static str {
        match self {
            SshError::InvalidRequest(_) => "invalidRequest",
            SshError::ConnectionFailed(_) | SshError::IoError(_) => "upstreamUnreachable",
            SshError::AuthenticationFailed(_) | SshError::KeyError(_) => "authFailure",
            SshError::ChannelError(_) | SshError::ProtocolError(_) => "upstreamClosed",
            SshError::Timeout(_) => "timeout",
            SshError::SessionNotFound(_) => "sessionNotFound",
            SshError::KeepaliveLost => "keepaliveLost",
            SshError::ServerBusy { .. } => "serverBusy",
            SshError::Disconnected => "upstreamClosed",
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
