use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use peerlink_transport::LinkStream;
use tracing::trace;

use crate::codec::{encode_frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::reader::link_error;
use crate::route::encode_route;

/// Pushes whole frames into a byte stream.
///
/// Each call encodes into a reused scratch buffer and writes it out in full
/// before returning, so one writer never interleaves two frames.
pub struct FrameWriter<T> {
    inner: T,
    scratch: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            scratch: BytesMut::new(),
            config,
        }
    }

    pub fn send(&mut self, channel: u16, payload: &[u8]) -> Result<()> {
        let max = self.config.max_payload_size;
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        self.scratch.clear();
        encode_frame(channel, payload, &mut self.scratch)?;
        write_all(&mut self.inner, &self.scratch)?;
        trace!(channel, len = payload.len(), "frame written");
        Ok(())
    }

    /// Send `body` behind a route prefix naming `peer_id`.
    pub fn send_routed(&mut self, channel: u16, peer_id: &str, body: &[u8]) -> Result<()> {
        let payload = encode_route(peer_id, body)?;
        self.send(channel, &payload)
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl FrameWriter<LinkStream> {
    /// Wrap a link, applying `config.write_timeout` to the socket.
    pub fn for_link(inner: LinkStream, config: FrameConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout).map_err(link_error)?;
        Ok(Self::with_config(inner, config))
    }
}

/// `Write::write_all` plus flush, but a zero-length write means the peer
/// hung up rather than `WriteZero`.
fn write_all<T: Write>(out: &mut T, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        match out.write(bytes) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    loop {
        match out.flush() {
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            other => return other.map_err(Into::into),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::channel::DIRECT;
    use crate::codec::{decode_frame, Frame};
    use crate::route::decode_route;

    fn drain(writer: FrameWriter<Cursor<Vec<u8>>>) -> Vec<Frame> {
        let mut wire = BytesMut::from(writer.into_inner().into_inner().as_slice());
        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(&mut wire, usize::MAX).expect("written bytes should decode") {
            frames.push(frame);
        }
        assert!(wire.is_empty(), "no trailing bytes should remain");
        frames
    }

    #[test]
    fn sends_are_written_back_to_back() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()));
        writer.send(1, b"one").expect("first send should succeed");
        writer.send(2, b"two").expect("second send should succeed");

        assert_eq!(
            drain(writer),
            vec![Frame::new(1, &b"one"[..]), Frame::new(2, &b"two"[..])]
        );
    }

    #[test]
    fn routed_send_carries_the_peer_prefix() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()));
        writer
            .send_routed(DIRECT, "peer-C", b"body")
            .expect("routed send should succeed");

        let frame = drain(writer).remove(0);
        assert_eq!(frame.channel, DIRECT);
        let (peer, body) = decode_route(frame.payload).expect("prefix should decode");
        assert_eq!((peer.as_str(), body.as_ref()), ("peer-C", &b"body"[..]));
    }

    #[test]
    fn oversized_payload_never_reaches_the_stream() {
        let config = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::new()), config);
        assert!(matches!(
            writer.send(1, b"oversized"),
            Err(FrameError::PayloadTooLarge { size: 9, max: 4 })
        ));
        assert!(writer.get_ref().get_ref().is_empty());
    }

    struct HungUp;

    impl Write for HungUp {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn zero_length_write_means_closed() {
        let mut writer = FrameWriter::new(HungUp);
        assert!(matches!(writer.send(1, b"x"), Err(FrameError::ConnectionClosed)));
    }
}
