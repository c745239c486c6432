use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use peerlink_transport::TransportError;
use tracing::{debug, trace};

use super::{Inbound, InboundQueue, Transport};
use crate::error::{PeerError, Result};

/// In-process switchboard connecting [`MemoryTransport`]s by peer id.
#[derive(Default)]
pub struct MemoryHub {
    peers: Mutex<HashMap<String, Sender<Inbound>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport for `peer_id` attached to this hub.
    ///
    /// The peer becomes reachable once the transport is opened.
    pub fn transport(self: &Arc<Self>, peer_id: &str) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(self),
            peer_id: peer_id.to_string(),
            queue: InboundQueue::new(),
        }
    }

    /// Ids of the currently open transports, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peers.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn route(&self, dest: &str) -> Option<Sender<Inbound>> {
        self.peers.lock().get(dest).cloned()
    }
}

/// Transport whose peers live in the same process.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    peer_id: String,
    queue: InboundQueue,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.queue.is_closed() {
            return Err(PeerError::Transport(TransportError::Shutdown));
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn local_id(&self) -> &str {
        &self.peer_id
    }

    fn open(&self) -> Result<()> {
        self.ensure_open()?;
        self.hub
            .peers
            .lock()
            .insert(self.peer_id.clone(), self.queue.sender());
        debug!(peer_id = %self.peer_id, "memory transport attached to hub");
        Ok(())
    }

    fn connect(&self, _peer_id: &str, _address: &str) -> Result<()> {
        Ok(())
    }

    fn send(&self, dest: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let route = self
            .hub
            .route(dest)
            .ok_or_else(|| TransportError::UnknownPeer(dest.to_string()))?;
        route
            .send(Inbound {
                source: self.peer_id.clone(),
                bytes: Bytes::copy_from_slice(bytes),
            })
            .map_err(|_| TransportError::UnknownPeer(dest.to_string()))?;
        trace!(from = %self.peer_id, to = %dest, len = bytes.len(), "memory send");
        Ok(())
    }

    fn broadcast(&self, bytes: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let routes: Vec<Sender<Inbound>> = self
            .hub
            .peers
            .lock()
            .iter()
            .filter(|(peer, _)| **peer != self.peer_id)
            .map(|(_, tx)| tx.clone())
            .collect();

        let payload = Bytes::copy_from_slice(bytes);
        let delivered = routes
            .into_iter()
            .filter(|tx| {
                tx.send(Inbound {
                    source: self.peer_id.clone(),
                    bytes: payload.clone(),
                })
                .is_ok()
            })
            .count();
        Ok(delivered)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Inbound>> {
        self.queue.recv_timeout(timeout)
    }

    fn close(&self) {
        if !self.queue.close() {
            return;
        }
        let mine = self.queue.sender();
        let mut peers = self.hub.peers.lock();
        if peers
            .get(&self.peer_id)
            .is_some_and(|tx| tx.same_channel(&mine))
        {
            peers.remove(&self.peer_id);
        }
        debug!(peer_id = %self.peer_id, "memory transport detached");
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
