//! Error types for swarmpatch

use thiserror::Error;
use uuid::Uuid;

/// Result type for swarmpatch operations
pub type Result<T> = std::result::Result<T, SwarmpatchError>;

/// Swarmpatch error types
#[derive(Error, Debug)]
pub enum SwarmpatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire protocol error: {0}")]
    Wire(#[from] swarmpatch_wire::WireError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bencode error: {0}")]
    Bencode(String),

    #[error("session table encoding error: {0}")]
    SessionEncoding(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("key load error: {0}")]
    KeyLoad(String),

    #[error("no reply within the transaction deadline")]
    TransactionTimeout,

    #[error("descriptor signature verification failed")]
    Verification,

    #[error("update {uuid} version {version} already exists")]
    AlreadyExists { uuid: Uuid, version: u32 },

    #[error("update {uuid} version {version} is older than the registered one")]
    IsOlder { uuid: Uuid, version: u32 },

    #[error("update has not been stopped")]
    NotStopped,

    #[error("deployment failed: {0}")]
    Deploy(String),

    #[error("deployer not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("agent runtime error: {0}")]
    AgentRuntime(String),

    #[error("overlay error: {0}")]
    Overlay(String),

    #[error("swarm engine error: {0}")]
    Swarm(String),
}

impl SwarmpatchError {
    /// Registry policy violations are reported to the caller but are not
    /// failures of the receiving agent; monitors and the notification sink
    /// log them and move on.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SwarmpatchError::Configuration(_) | SwarmpatchError::KeyLoad(_)
        )
    }
}

impl From<serde_bencode::Error> for SwarmpatchError {
    fn from(err: serde_bencode::Error) -> Self {
        SwarmpatchError::Bencode(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SwarmpatchError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        SwarmpatchError::SessionEncoding(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SwarmpatchError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        SwarmpatchError::SessionEncoding(err.to_string())
    }
}
