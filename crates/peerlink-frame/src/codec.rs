use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Bytes in a frame header.
pub const HEADER_SIZE: usize = 8;

/// "PL"
pub const MAGIC: [u8; 2] = *b"PL";

/// 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One frame: a channel id and its payload.
///
/// On routed channels the payload still carries its route prefix; strip it
/// with [`crate::decode_route`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }
}

/// Fixed-size prefix of every frame.
///
/// ```text
/// +-----------+---------------+--------------+------------------+
/// | "PL" (2B) | length (4B LE)| channel (2B) | payload (length) |
/// +-----------+---------------+--------------+------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    len: u32,
    channel: u16,
}

impl Header {
    fn for_payload(channel: u16, payload: &[u8]) -> Result<Self> {
        let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        Ok(Self { len, channel })
    }

    fn put(self, dst: &mut BytesMut) {
        dst.put_slice(&MAGIC);
        dst.put_u32_le(self.len);
        dst.put_u16_le(self.channel);
    }

    /// Read a header from the front of `src` without consuming it.
    fn peek(src: &[u8]) -> Result<Option<Self>> {
        let Some(mut raw) = src.get(..HEADER_SIZE) else {
            return Ok(None);
        };
        if raw.get_u16() != u16::from_be_bytes(MAGIC) {
            return Err(FrameError::InvalidMagic);
        }
        Ok(Some(Self {
            len: raw.get_u32_le(),
            channel: raw.get_u16_le(),
        }))
    }

    fn total(self) -> usize {
        HEADER_SIZE + self.len as usize
    }
}

/// Append one encoded frame to `dst`.
pub fn encode_frame(channel: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let header = Header::for_payload(channel, payload)?;
    dst.reserve(header.total());
    header.put(dst);
    dst.put_slice(payload);
    Ok(())
}

/// Take one complete frame off the front of `src`.
///
/// `Ok(None)` means more bytes are needed; `src` is left untouched. An
/// oversized length is rejected as soon as the header is visible.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    let Some(header) = Header::peek(src)? else {
        return Ok(None);
    };
    if header.len as usize > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: header.len as usize,
            max: max_payload,
        });
    }
    if src.len() < header.total() {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(Frame {
        channel: header.channel,
        payload: src.split_to(header.len as usize).freeze(),
    }))
}

/// Limits and socket timeouts for a [`crate::FrameReader`] or [`crate::FrameWriter`].
#[derive(Debug, Clone)]
pub struct FrameConfig {
    pub max_payload_size: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
