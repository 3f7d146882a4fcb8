//! Error types for the audio link

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Device bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Endpoint is shut down")]
    EndpointClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a failure is treated by the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Fatal to the current attempt; the shell must re-issue START_STREAM
    Setup,
    /// Retried automatically, never surfaced individually
    Transient,
    /// Reported as a disconnect event, then retried if streaming is wanted
    ConnectionLost,
    /// Rejected locally with `success = false`
    ProtocolMisuse,
    /// A worker thread misbehaved (did not stop in time, failed to spawn)
    Internal,
}

/// Connection lifecycle errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("TCP port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("Failed to listen on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Device bridge unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("Failed to forward tcp:{port} to device {device}: {reason}")]
    ForwardFailed {
        device: String,
        port: u16,
        reason: String,
    },

    #[error("Stream already started")]
    AlreadyStreaming,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} did not stop within the wait budget")]
    WorkerStuck(String),

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Classify this error according to the lifecycle's failure taxonomy
    pub fn class(&self) -> FailureClass {
        match self {
            LinkError::PortInUse { .. }
            | LinkError::Bind { .. }
            | LinkError::BridgeUnavailable(_)
            | LinkError::ForwardFailed { .. } => FailureClass::Setup,
            LinkError::AlreadyStreaming | LinkError::InvalidRequest(_) => {
                FailureClass::ProtocolMisuse
            }
            LinkError::WorkerStuck(_) | LinkError::Spawn(_) => FailureClass::Internal,
            LinkError::Io(_) => FailureClass::Transient,
        }
    }
}

/// Device-bridge (adb) errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge executable unavailable: {0}")]
    Unavailable(String),

    #[error("Bridge command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a running data pump gives up on its socket
#[derive(Error, Debug)]
pub enum PumpFailure {
    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Read failed: {0}")]
    ReadFailed(std::io::Error),

    #[error("Write failed: {0}")]
    WriteFailed(std::io::Error),
}

impl PumpFailure {
    /// Every pump failure ends the connection; the link worker reports it
    /// and goes back to connecting
    pub fn class(&self) -> FailureClass {
        FailureClass::ConnectionLost
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
