use std::io::{ErrorKind, Read};
use std::time::Duration;

use bytes::BytesMut;
use peerlink_transport::{LinkStream, TransportError};
use tracing::trace;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const CHUNK: usize = 8 * 1024;

/// Pulls whole frames out of a byte stream.
///
/// A read timeout on the stream surfaces as an error for which
/// [`FrameError::is_timeout`] holds; whatever part of a frame already
/// arrived stays buffered, so the next call resumes where this one stopped.
pub struct FrameReader<T> {
    inner: T,
    pending: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            pending: BytesMut::with_capacity(CHUNK),
            config,
        }
    }

    /// Block until a frame is complete. EOF is [`FrameError::ConnectionClosed`].
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.pending, self.config.max_payload_size)? {
                trace!(channel = frame.channel, len = frame.payload.len(), "frame read");
                return Ok(frame);
            }
            self.fill()?;
        }
    }

    /// Append whatever the stream has ready to the pending buffer.
    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; CHUNK];
        let n = loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        };
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl FrameReader<LinkStream> {
    /// Wrap a link, applying `config.read_timeout` to the socket.
    pub fn for_link(inner: LinkStream, config: FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout).map_err(link_error)?;
        Ok(Self::with_config(inner, config))
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(link_error)?;
        self.config.read_timeout = timeout;
        Ok(())
    }
}

/// Socket option failures on a link are plain I/O errors at this layer.
pub(crate) fn link_error(err: TransportError) -> FrameError {
    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => source.into(),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
