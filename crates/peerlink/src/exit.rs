//! Process exit codes and the error type commands return.

use std::fmt;
use std::io;

use peerlink_frame::FrameError;
use peerlink_runtime::PeerError;
use peerlink_transport::TransportError;

pub const SUCCESS: i32 = 0;
/// The command ran but the answer was a failure (`ok: false`, unknown key).
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;
pub const CANCELLED: i32 = 130;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CliError {}

/// Which exit code an error ends the process with.
pub trait ExitCode {
    fn exit_code(&self) -> i32;
}

impl ExitCode for io::Error {
    fn exit_code(&self) -> i32 {
        use io::ErrorKind::*;
        match self.kind() {
            TimedOut | WouldBlock => TIMEOUT,
            ConnectionRefused | ConnectionReset | AddrInUse => TRANSPORT_ERROR,
            NotFound | PermissionDenied => USAGE,
            _ => INTERNAL,
        }
    }
}

impl ExitCode for TransportError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidEndpoint { .. } | Self::PathTooLong { .. } => USAGE,
            Self::Io(io) => io.exit_code(),
            _ => TRANSPORT_ERROR,
        }
    }
}

impl ExitCode for FrameError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::PayloadTooLarge { .. } | Self::BadRoute(_) | Self::InvalidMagic => DATA_INVALID,
            Self::Io(io) => io.exit_code(),
            Self::ConnectionClosed => TRANSPORT_ERROR,
        }
    }
}

impl ExitCode for PeerError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Transport(err) => err.exit_code(),
            Self::Frame(err) => err.exit_code(),
            Self::HandshakeFailed(_) | Self::Disconnected(_) => TRANSPORT_ERROR,
            Self::Timeout(_) => TIMEOUT,
            Self::Cancelled => CANCELLED,
            Self::Json(_) | Self::Yaml(_) | Self::Decode(_) => DATA_INVALID,
            Self::Config(_) | Self::ConfigIo { .. } => USAGE,
            Self::InvalidState { .. } => INTERNAL,
        }
    }
}

/// Attach a leading context string and pick the exit code from the error.
pub trait Context<T> {
    fn context(self, what: impl fmt::Display) -> CliResult<T>;
}

impl<T, E: ExitCode + fmt::Display> Context<T> for Result<T, E> {
    fn context(self, what: impl fmt::Display) -> CliResult<T> {
        self.map_err(|err| CliError::new(err.exit_code(), format!("{what}: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn code_of(err: PeerError) -> i32 {
        Err::<(), _>(err).context("op").expect_err("error should stay an error").code
    }

    #[test]
    fn runtime_errors_pick_their_codes() {
        assert_eq!(code_of(PeerError::Timeout(Duration::from_secs(1))), TIMEOUT);
        assert_eq!(code_of(PeerError::Cancelled), CANCELLED);
        assert_eq!(code_of(PeerError::Config("x".into())), USAGE);
        assert_eq!(code_of(PeerError::HandshakeFailed("refused".into())), TRANSPORT_ERROR);
        assert_eq!(
            code_of(PeerError::Transport(TransportError::UnknownPeer("b".into()))),
            TRANSPORT_ERROR
        );
        assert_eq!(code_of(PeerError::Frame(FrameError::InvalidMagic)), DATA_INVALID);
    }

    #[test]
    fn nested_io_errors_are_classified_by_kind() {
        let refused = TransportError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(code_of(PeerError::Transport(refused)), TRANSPORT_ERROR);

        let timed_out = FrameError::Io(io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(code_of(PeerError::Frame(timed_out)), TIMEOUT);
    }

    #[test]
    fn message_leads_with_context() {
        let err = Err::<(), _>(PeerError::Cancelled)
            .context("request failed")
            .expect_err("error should stay an error");
        assert!(err.to_string().starts_with("request failed: "));
    }
}
