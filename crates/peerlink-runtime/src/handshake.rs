//! Link opening exchange on the CONTROL channel.
//!
//! The dialing side sends one [`HandshakeRequest`] naming itself; the
//! accepting side answers with one [`HandshakeResponse`] naming itself, or
//! carrying an `error` when it refuses the link. Versions are
//! `<major>.<minor>`: majors must match and the dialer's minor must be at
//! least the acceptor's.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::time::{Duration, Instant};

use peerlink_frame::{FrameError, FrameReader, FrameWriter, CONTROL};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PeerError, Result};

const PROTOCOL_MAX: usize = 32;
const VERSION_MAX: usize = 16;
const TOKEN_MAX: usize = 4096;

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: String,
    /// Identity of the dialing peer.
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub protocol: String,
    pub version: String,
    /// Identity of the accepting peer (or broker).
    pub peer_id: String,
    /// Present when the link was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What one side learned about the other.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub peer_id: String,
    pub version: String,
    /// Token the dialer presented. Only ever set on the accepting side.
    pub auth_token: Option<String>,
}

#[derive(Clone)]
pub struct HandshakeConfig {
    /// Deadline for the whole exchange.
    pub timeout: Duration,
    pub protocol_name: String,
    pub protocol_version: String,
    /// Largest CONTROL payload accepted while opening a link.
    pub max_handshake_payload: usize,
    /// Dialers present this token. Acceptors insist on it when set.
    pub auth_token: Option<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "peerlink".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
            auth_token: None,
        }
    }
}

fn masked(token: &Option<String>) -> String {
    token
        .as_ref()
        .map_or_else(|| "none".to_string(), |t| format!("<hidden, {} bytes>", t.len()))
}

impl fmt::Debug for HandshakeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HandshakeRequest {{ protocol: {:?}, version: {:?}, peer_id: {:?}, auth_token: {} }}",
            self.protocol,
            self.version,
            self.peer_id,
            masked(&self.auth_token)
        )
    }
}

impl fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HandshakeResult {{ peer_id: {:?}, version: {:?}, auth_token: {} }}",
            self.peer_id,
            self.version,
            masked(&self.auth_token)
        )
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HandshakeConfig {{ timeout: {:?}, protocol: {:?}, version: {:?}, max_payload: {}, auth_token: {} }}",
            self.timeout,
            self.protocol_name,
            self.protocol_version,
            self.max_handshake_payload,
            masked(&self.auth_token)
        )
    }
}

/// `<major>.<minor>` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProtocolVersion {
    major: u16,
    minor: u16,
}

impl ProtocolVersion {
    /// Whether an acceptor at `self` takes a dialer at `dialer`.
    fn admits(self, dialer: ProtocolVersion) -> bool {
        self.major == dialer.major && dialer.minor >= self.minor
    }
}

impl FromStr for ProtocolVersion {
    type Err = PeerError;

    fn from_str(raw: &str) -> Result<Self> {
        let refuse = |why: &str| PeerError::HandshakeFailed(format!("bad version '{raw}': {why}"));
        if raw.is_empty() || raw.len() > VERSION_MAX {
            return Err(refuse("length out of range"));
        }
        let mut parts = raw.split('.');
        let (Some(major), Some(minor), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(refuse("want <major>.<minor>"));
        };
        Ok(Self {
            major: major.parse().map_err(|_| refuse("major is not a number"))?,
            minor: minor.parse().map_err(|_| refuse("minor is not a number"))?,
        })
    }
}

fn bounded(field: &str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() || value.len() > max {
        return Err(PeerError::HandshakeFailed(format!(
            "{field} must be 1..={max} bytes, got {}",
            value.len()
        )));
    }
    Ok(())
}

impl HandshakeConfig {
    fn local_version(&self) -> Result<ProtocolVersion> {
        bounded("protocol", &self.protocol_name, PROTOCOL_MAX)?;
        self.protocol_version.parse()
    }

    fn reply(&self, local_id: &str, error: Option<String>) -> HandshakeResponse {
        HandshakeResponse {
            protocol: self.protocol_name.clone(),
            version: self.protocol_version.clone(),
            peer_id: local_id.to_string(),
            error,
        }
    }
}

impl HandshakeRequest {
    /// Decide whether an acceptor configured with `config` takes this dialer.
    fn admit(&self, config: &HandshakeConfig, local: ProtocolVersion) -> Result<()> {
        bounded("protocol", &self.protocol, PROTOCOL_MAX)?;
        bounded("peer_id", &self.peer_id, peerlink_frame::MAX_ROUTE_ID_LEN)?;
        if let Some(token) = &self.auth_token {
            bounded("auth_token", token, TOKEN_MAX)?;
        }
        let theirs: ProtocolVersion = self.version.parse()?;

        if self.protocol != config.protocol_name {
            return Err(PeerError::HandshakeFailed(format!(
                "unknown protocol '{}', this side speaks '{}'",
                self.protocol, config.protocol_name
            )));
        }
        if !local.admits(theirs) {
            return Err(PeerError::HandshakeFailed(format!(
                "incompatible version {} against {}",
                self.version, config.protocol_version
            )));
        }
        match &config.auth_token {
            Some(expected) if self.auth_token.as_ref() != Some(expected) => Err(
                PeerError::HandshakeFailed("authentication failed".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Dialing side: announce `local_id`, then learn who answered.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    local_id: &str,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    let local = config.local_version()?;
    bounded("peer_id", local_id, peerlink_frame::MAX_ROUTE_ID_LEN)?;
    if let Some(token) = &config.auth_token {
        bounded("auth_token", token, TOKEN_MAX)?;
    }

    write_control(
        writer,
        &HandshakeRequest {
            protocol: config.protocol_name.clone(),
            version: config.protocol_version.clone(),
            peer_id: local_id.to_string(),
            auth_token: config.auth_token.clone(),
        },
    )?;
    let reply: HandshakeResponse = serde_json::from_slice(&read_control(reader, config)?)?;

    if let Some(reason) = reply.error {
        return Err(PeerError::HandshakeFailed(format!("refused by remote: {reason}")));
    }
    bounded("peer_id", &reply.peer_id, peerlink_frame::MAX_ROUTE_ID_LEN)?;
    if reply.protocol != config.protocol_name {
        return Err(PeerError::HandshakeFailed(format!(
            "remote answered with unknown protocol '{}'",
            reply.protocol
        )));
    }
    let theirs: ProtocolVersion = reply.version.parse()?;
    if !theirs.admits(local) {
        return Err(PeerError::HandshakeFailed(format!(
            "incompatible version {} against {}",
            config.protocol_version, reply.version
        )));
    }

    debug!(remote = %reply.peer_id, version = %reply.version, "link opened as dialer");
    Ok(HandshakeResult {
        peer_id: reply.peer_id,
        version: reply.version,
        auth_token: None,
    })
}

/// Accepting side: vet the dialer and answer as `local_id`.
///
/// A refused dialer is told why before this returns `HandshakeFailed`.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    local_id: &str,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    let local = config.local_version()?;
    bounded("peer_id", local_id, peerlink_frame::MAX_ROUTE_ID_LEN)?;

    let request: HandshakeRequest = serde_json::from_slice(&read_control(reader, config)?)?;
    if let Err(err) = request.admit(config, local) {
        let reason = match &err {
            PeerError::HandshakeFailed(reason) => reason.clone(),
            other => other.to_string(),
        };
        if let Err(send_err) = write_control(writer, &config.reply(local_id, Some(reason))) {
            debug!(error = %send_err, "could not deliver handshake refusal");
        }
        return Err(err);
    }
    write_control(writer, &config.reply(local_id, None))?;

    debug!(remote = %request.peer_id, version = %request.version, "link opened as acceptor");
    Ok(HandshakeResult {
        peer_id: request.peer_id,
        version: request.version,
        auth_token: request.auth_token,
    })
}

fn write_control<T: Serialize, W: Write>(writer: &mut FrameWriter<W>, message: &T) -> Result<()> {
    writer.send(CONTROL, &serde_json::to_vec(message)?)?;
    Ok(())
}

/// Read the next CONTROL payload, retrying read timeouts until the deadline.
fn read_control<R: Read>(reader: &mut FrameReader<R>, config: &HandshakeConfig) -> Result<Vec<u8>> {
    let deadline = Instant::now().checked_add(config.timeout);
    let frame = loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(PeerError::Timeout(config.timeout));
        }
        match reader.read_frame() {
            Ok(frame) => break frame,
            Err(err) if err.is_timeout() => {}
            Err(FrameError::ConnectionClosed) => {
                return Err(PeerError::Disconnected(
                    "link closed while opening".to_string(),
                ))
            }
            Err(err) => return Err(err.into()),
        }
    };

    if frame.channel != CONTROL {
        return Err(PeerError::HandshakeFailed(format!(
            "handshake arrived on channel {} instead of CONTROL",
            frame.channel
        )));
    }
    if frame.payload.len() > config.max_handshake_payload {
        return Err(PeerError::HandshakeFailed(format!(
            "handshake payload of {} bytes exceeds {}",
            frame.payload.len(),
            config.max_handshake_payload
        )));
    }
    Ok(frame.payload.to_vec())
}
