//! Peer-id route prefix carried by routed frames.
//!
//! ```text
//! ┌──────────────┬────────────────────┬──────────────┐
//! │ Id len (2B)  │ Peer id (UTF-8)    │ Body         │
//! │ LE           │ (Id len bytes)     │ (rest)       │
//! └──────────────┴────────────────────┴──────────────┘
//! ```
//!
//! On DELIVER the id is the source peer, on DIRECT the destination peer,
//! and on BROADCAST it is empty.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Longest peer id accepted in a route prefix.
pub const MAX_ROUTE_ID_LEN: usize = 255;

/// Build a routed payload: prefix + body.
pub fn encode_route(peer_id: &str, body: &[u8]) -> Result<Bytes> {
    if peer_id.len() > MAX_ROUTE_ID_LEN {
        return Err(FrameError::BadRoute(format!(
            "peer id too long ({} bytes, max {MAX_ROUTE_ID_LEN})",
            peer_id.len()
        )));
    }
    let mut out = BytesMut::with_capacity(2 + peer_id.len() + body.len());
    out.put_u16_le(peer_id.len() as u16);
    out.put_slice(peer_id.as_bytes());
    out.put_slice(body);
    Ok(out.freeze())
}

/// Split a routed payload into its peer id and body.
pub fn decode_route(mut payload: Bytes) -> Result<(String, Bytes)> {
    if payload.len() < 2 {
        return Err(FrameError::BadRoute("missing length".to_string()));
    }
    let id_len = payload.get_u16_le() as usize;
    if id_len > MAX_ROUTE_ID_LEN {
        return Err(FrameError::BadRoute(format!("peer id length {id_len} exceeds max")));
    }
    if payload.len() < id_len {
        return Err(FrameError::BadRoute("truncated peer id".to_string()));
    }
    let id = payload.split_to(id_len);
    let peer_id = std::str::from_utf8(&id)
        .map_err(|_| FrameError::BadRoute("peer id is not UTF-8".to_string()))?
        .to_string();
    Ok((peer_id, payload))
}
