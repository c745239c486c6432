/// Errors that can occur in peer runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] peerlink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] peerlink_frame::FrameError),

    /// Link handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Remote side went away.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration could not be parsed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An envelope failed to decode or validate.
    #[error("envelope error: {0}")]
    Decode(#[from] crate::envelope::DecodeError),

    /// Request or handshake timed out.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The runtime stopped while the operation was pending.
    #[error("operation cancelled: runtime stopped")]
    Cancelled,

    /// Operation is not valid in the current lifecycle state.
    #[error("invalid runtime state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    ConfigIo {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PeerError>;
