use std::io;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Header did not start with "PL"; the stream is out of sync.
    #[error("bad frame magic, stream out of sync")]
    InvalidMagic,

    #[error("frame payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("bad route prefix: {0}")]
    BadRoute(String),

    #[error("frame i/o: {0}")]
    Io(#[from] io::Error),

    /// EOF, possibly in the middle of a frame.
    #[error("link closed by remote")]
    ConnectionClosed,
}

impl FrameError {
    /// A socket read/write timeout, as opposed to a broken link.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Io(err) => matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
