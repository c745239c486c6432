//! Transport abstraction and its implementations.
//!
//! A [`Transport`] moves opaque envelope bytes between peer ids. Three
//! families exist:
//! - [`DirectTransport`]: peer-to-peer over TCP or Unix sockets, with a
//!   static address book and lazily dialed outbound links.
//! - [`BrokeredTransport`]: a single link to a [`Broker`] that routes by
//!   peer id and fans out broadcasts.
//! - [`MemoryTransport`]: in-process delivery through a [`MemoryHub`].

mod broker;
mod brokered;
mod direct;
mod memory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use peerlink_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};
use peerlink_transport::TransportError;
use tracing::debug;

pub use broker::{Broker, BrokerConfig, BrokerHandle};
pub use brokered::BrokeredTransport;
pub use direct::DirectTransport;
pub use memory::{MemoryHub, MemoryTransport};

use crate::config::{RuntimeConfig, TransportConfig};
use crate::error::{PeerError, Result};
use crate::handshake::HandshakeConfig;

/// Bytes received from another peer (or from ourselves).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Peer id the transport attributes the bytes to.
    pub source: String,
    pub bytes: Bytes,
}

/// Moves envelope bytes between peers.
///
/// Implementations are shared between the receive loop, request workers
/// and application threads, so every method takes `&self`.
pub trait Transport: Send + Sync {
    /// Short family name for logs.
    fn name(&self) -> &'static str;

    /// Identity this transport sends as.
    fn local_id(&self) -> &str;

    /// Bind, dial or register as the family requires. Idempotent.
    fn open(&self) -> Result<()>;

    /// Record or replace how to reach `peer_id`.
    ///
    /// Families that route through a broker accept and ignore this.
    fn connect(&self, peer_id: &str, address: &str) -> Result<()>;

    /// Deliver bytes to one peer. `dest == local_id()` loops back.
    fn send(&self, dest: &str, bytes: &[u8]) -> Result<()>;

    /// Deliver bytes to every reachable peer except ourselves.
    ///
    /// Returns how many links the bytes were handed to.
    fn broadcast(&self, bytes: &[u8]) -> Result<usize>;

    /// Wait up to `timeout` for inbound bytes.
    ///
    /// `Ok(None)` on timeout; `Err` once the transport is closed.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Inbound>>;

    /// Stop accepting and release every link. Idempotent.
    fn close(&self);
}

/// Iterator over inbound bytes that ends when the transport closes.
pub struct Incoming<'a> {
    transport: &'a dyn Transport,
    poll: Duration,
}

impl<'a> Incoming<'a> {
    pub fn new(transport: &'a dyn Transport, poll: Duration) -> Self {
        Self { transport, poll }
    }
}

impl Iterator for Incoming<'_> {
    type Item = Inbound;

    fn next(&mut self) -> Option<Inbound> {
        loop {
            match self.transport.recv_timeout(self.poll) {
                Ok(Some(inbound)) => return Some(inbound),
                Ok(None) => continue,
                Err(err) => {
                    debug!(transport = self.transport.name(), error = %err, "inbound stream ended");
                    return None;
                }
            }
        }
    }
}

/// Tuning shared by the socket-based transports.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub handshake: HandshakeConfig,
    /// Bound on dialing a peer or broker.
    pub connect_timeout: Duration,
    /// Bound on a single frame write.
    pub write_timeout: Duration,
    /// How often background readers check for shutdown.
    pub poll_interval: Duration,
    pub max_payload_size: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            connect_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl LinkOptions {
    pub(crate) fn handshake_frames(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
            read_timeout: Some(self.handshake.timeout),
            write_timeout: Some(self.write_timeout),
        }
    }

    pub(crate) fn frames(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
            read_timeout: Some(self.poll_interval),
            write_timeout: Some(self.write_timeout),
        }
    }
}

/// Build the transport a [`RuntimeConfig`] describes.
pub fn transport_for(config: &RuntimeConfig) -> Result<Arc<dyn Transport>> {
    match &config.transport {
        TransportConfig::PeerToPeer { bind, address_book } => {
            let transport = DirectTransport::new(&config.peer_id, bind.clone(), config.link.clone());
            for (peer_id, endpoint) in address_book {
                transport.add_peer(peer_id, endpoint.clone());
            }
            Ok(Arc::new(transport))
        }
        TransportConfig::Brokered { broker, auth_token } => {
            let mut link = config.link.clone();
            if auth_token.is_some() {
                link.handshake.auth_token = auth_token.clone();
            }
            Ok(Arc::new(BrokeredTransport::new(
                &config.peer_id,
                broker.clone(),
                link,
            )))
        }
        TransportConfig::Custom => Err(PeerError::Config(
            "custom transport selected but none was supplied".to_string(),
        )),
    }
}

/// Inbound queue plus the closed flag every transport shares with its
/// background threads.
#[derive(Clone)]
pub(crate) struct InboundQueue {
    tx: Sender<Inbound>,
    rx: Receiver<Inbound>,
    closed: Arc<AtomicBool>,
}

impl InboundQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn push(&self, source: &str, bytes: Bytes) {
        // The receiver lives as long as the queue, so this cannot fail.
        let _ = self.tx.send(Inbound {
            source: source.to_string(),
            bytes,
        });
    }

    pub(crate) fn sender(&self) -> Sender<Inbound> {
        self.tx.clone()
    }

    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Result<Option<Inbound>> {
        if self.is_closed() {
            return Err(PeerError::Transport(TransportError::Shutdown));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(inbound) => Ok(Some(inbound)),
            Err(RecvTimeoutError::Timeout) if !self.is_closed() => Ok(None),
            Err(_) => Err(PeerError::Transport(TransportError::Shutdown)),
        }
    }

    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
