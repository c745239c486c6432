use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("cannot bind {endpoint}: {source}")]
    Bind { endpoint: String, source: io::Error },

    #[error("cannot connect to {endpoint}: {source}")]
    Connect { endpoint: String, source: io::Error },

    #[error("accept failed: {0}")]
    Accept(io::Error),

    #[error("link i/o: {0}")]
    Io(#[from] io::Error),

    /// Longer than `sockaddr_un` can hold.
    #[error("socket path {} is {len} bytes, limit {max}", path.display())]
    PathTooLong { path: PathBuf, len: usize, max: usize },

    /// Nothing in the address book for this peer id.
    #[error("no address known for peer '{0}'")]
    UnknownPeer(String),

    #[error("transport is not open")]
    NotConnected,

    #[error("transport closed")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
