use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, TransportError};

const TCP_SCHEME: &str = "tcp://";
const UNIX_SCHEME: &str = "unix://";

/// A location a peer or broker can bind to or dial.
///
/// Accepted forms:
/// - `tcp://host:port` (`*` as host means all interfaces)
/// - `host:port` (shorthand for TCP)
/// - `unix:///absolute/path.sock` or `unix://relative.sock`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP socket address in `host:port` form.
    Tcp(String),
    /// Filesystem path of a Unix domain socket.
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint string.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid(raw, "empty endpoint"));
        }

        if let Some(path) = trimmed.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(invalid(raw, "missing socket path"));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let addr = trimmed.strip_prefix(TCP_SCHEME).unwrap_or(trimmed);
        if addr.contains("://") {
            return Err(invalid(raw, "unsupported scheme"));
        }

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid(raw, "expected host:port"))?;
        if host.is_empty() {
            return Err(invalid(raw, "missing host"));
        }
        port.parse::<u16>()
            .map_err(|_| invalid(raw, "port must be a number between 0 and 65535"))?;

        let host = if host == "*" { "0.0.0.0" } else { host };
        Ok(Self::Tcp(format!("{host}:{port}")))
    }

    /// Create a TCP endpoint from a `host:port` string.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::Tcp(addr.into())
    }

    /// Create a Unix domain socket endpoint.
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::Unix(path.as_ref().to_path_buf())
    }

    /// Short medium name for diagnostics.
    pub fn medium(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Unix(_) => "unix",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{TCP_SCHEME}{addr}"),
            Self::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn invalid(raw: &str, reason: &str) -> TransportError {
    TransportError::InvalidEndpoint {
        endpoint: raw.to_string(),
        reason: reason.to_string(),
    }
}
