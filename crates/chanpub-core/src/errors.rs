use thiserror::Error;

use crate::config::ChannelAddress;

/// Failure reported by a backend operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timed out: {0}")]
    Timeout(String),
    #[error("session closed: {0}")]
    Closed(String),
}

/// Actionable failure broadcast on the Error stream.
///
/// Never returned from a command; observers receive these asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublisherError {
    #[error("failed to initialize session: {reason}")]
    FailedToInitialize { reason: String },
    #[error("session is unrecoverable, restart required: {reason}")]
    SessionUnrecoverable { reason: String },
    #[error("could not acquire capture device: {reason}")]
    DeviceAcquisitionFailed { reason: String },
    #[error("publish to {target} failed: {reason}")]
    PublishFailed { target: ChannelAddress, reason: String },
    #[error("join of {target} failed: {reason}")]
    JoinFailed { target: ChannelAddress, reason: String },
    #[error("camera flip failed: {reason}")]
    CameraFlipFailed { reason: String },
    #[error("backend did not come online within {waited_ms} ms")]
    NetworkTimeout { waited_ms: u64 },
}

/// A command could not be handed to the orchestrator task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("orchestrator has shut down")]
    Closed,
}

/// Invalid configuration values or settings I/O problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid connection configuration: {0}")]
    InvalidConnection(String),
    #[error("invalid media configuration: {0}")]
    InvalidMedia(String),
    #[error("settings i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings format: {0}")]
    Serde(#[from] serde_json::Error),
}
