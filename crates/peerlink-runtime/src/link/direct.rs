use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use peerlink_frame::{channel_name, decode_route, FrameError, FrameReader, FrameWriter, DELIVER};
use peerlink_transport::{Endpoint, LinkListener, LinkStream, TransportError};
use tracing::{debug, info, trace, warn};

use super::{Inbound, InboundQueue, LinkOptions, Transport};
use crate::error::{PeerError, Result};
use crate::handshake::{handshake_client, handshake_server};

const MIN_REDIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_REDIAL_BACKOFF: Duration = Duration::from_secs(10);
/// Messages held for a peer while its link is still being dialed.
const MAX_QUEUED_WHILE_DIALING: usize = 256;

/// Peer-to-peer transport.
///
/// Binds one listener for inbound links and dials every other peer lazily
/// from a static address book. Each peer has its own outbound slot whose
/// lock serializes writes to that peer. A write failure drops the link so
/// the next send redials; a failed dial backs off before the next attempt.
///
/// Unicast sends dial on the caller's thread. Broadcasts never do: a peer
/// without a live link is dialed in the background and the message waits
/// in that peer's queue, so one wedged peer cannot stall the rest.
pub struct DirectTransport {
    shared: Arc<Shared>,
    bind: Endpoint,
    book: RwLock<HashMap<String, Endpoint>>,
    outbound: Mutex<HashMap<String, Arc<Mutex<PeerLink>>>>,
    bound: Mutex<Option<Endpoint>>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

struct Shared {
    peer_id: String,
    options: LinkOptions,
    queue: InboundQueue,
}

#[derive(Default)]
enum LinkState {
    #[default]
    Idle,
    Dialing(Vec<Bytes>),
    Up(FrameWriter<LinkStream>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    BackingOff,
    Dialing,
    Up,
}

#[derive(Default)]
struct PeerLink {
    state: LinkState,
    retry_at: Option<Instant>,
    backoff: Duration,
}

impl PeerLink {
    fn phase(&self) -> Phase {
        match self.state {
            LinkState::Up(_) => Phase::Up,
            LinkState::Dialing(_) => Phase::Dialing,
            LinkState::Idle if self.retry_at.is_some_and(|at| Instant::now() < at) => Phase::BackingOff,
            LinkState::Idle => Phase::Idle,
        }
    }

    fn write(&mut self, local: &str, dest: &str, bytes: &[u8]) -> Result<()> {
        let LinkState::Up(writer) = &mut self.state else {
            return Err(PeerError::Transport(TransportError::NotConnected));
        };
        match writer.send_routed(DELIVER, local, bytes) {
            Ok(()) => {
                trace!(to = %dest, len = bytes.len(), "direct send");
                Ok(())
            }
            Err(err) => {
                debug!(to = %dest, error = %err, "outbound link failed; dropping it");
                let _ = writer.get_ref().shutdown();
                self.state = LinkState::Idle;
                Err(err.into())
            }
        }
    }

    /// Hold `bytes` until the pending dial settles. False when the queue is full.
    fn enqueue(&mut self, dest: &str, bytes: &[u8]) -> bool {
        match &mut self.state {
            LinkState::Dialing(queued) if queued.len() < MAX_QUEUED_WHILE_DIALING => {
                queued.push(Bytes::copy_from_slice(bytes));
                true
            }
            _ => {
                debug!(to = %dest, "dial queue full; dropping message");
                false
            }
        }
    }

    fn shutdown(&mut self) {
        if let LinkState::Up(writer) = std::mem::take(&mut self.state) {
            let _ = writer.get_ref().shutdown();
        }
    }
}

impl DirectTransport {
    pub fn new(peer_id: &str, bind: Endpoint, options: LinkOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                peer_id: peer_id.to_string(),
                options,
                queue: InboundQueue::new(),
            }),
            bind,
            book: RwLock::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            bound: Mutex::new(None),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add or replace an address-book entry.
    pub fn add_peer(&self, peer_id: &str, endpoint: Endpoint) {
        let previous = self.book.write().insert(peer_id.to_string(), endpoint.clone());
        if previous.is_some_and(|old| old != endpoint) {
            if let Some(stale) = self.outbound.lock().remove(peer_id) {
                stale.lock().shutdown();
            }
        }
        debug!(peer = %peer_id, %endpoint, "address book entry set");
    }

    /// Endpoint actually bound, once open. Reports the real port for `:0` binds.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.bound.lock().clone()
    }

    /// Peer ids in the address book, sorted.
    pub fn address_book(&self) -> Vec<(String, Endpoint)> {
        let mut entries: Vec<(String, Endpoint)> = self
            .book
            .read()
            .iter()
            .map(|(peer, ep)| (peer.clone(), ep.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.queue.is_closed() {
            return Err(PeerError::Transport(TransportError::Shutdown));
        }
        if self.bound.lock().is_none() {
            return Err(PeerError::Transport(TransportError::NotConnected));
        }
        Ok(())
    }

    fn endpoint_of(&self, dest: &str) -> Result<Endpoint> {
        self.book
            .read()
            .get(dest)
            .cloned()
            .ok_or_else(|| PeerError::Transport(TransportError::UnknownPeer(dest.to_string())))
    }

    fn link_for(&self, dest: &str) -> Arc<Mutex<PeerLink>> {
        Arc::clone(self.outbound.lock().entry(dest.to_string()).or_default())
    }

    fn send_remote(&self, dest: &str, bytes: &[u8]) -> Result<()> {
        let endpoint = self.endpoint_of(dest)?;
        let link = self.link_for(dest);
        {
            let mut guard = link.lock();
            match guard.phase() {
                Phase::Up => return guard.write(&self.shared.peer_id, dest, bytes),
                Phase::Dialing if guard.enqueue(dest, bytes) => return Ok(()),
                Phase::Dialing | Phase::BackingOff => {
                    return Err(PeerError::Transport(TransportError::NotConnected));
                }
                Phase::Idle => guard.state = LinkState::Dialing(Vec::new()),
            }
        }
        let dialed = dial(&self.shared, dest, &endpoint);
        finish_dial(&self.shared, dest, &link, dialed, Some(bytes))
    }

    /// Hand `bytes` to `dest` without ever dialing on this thread.
    fn offer(&self, dest: &str, endpoint: Endpoint, bytes: &[u8]) -> Result<bool> {
        let link = self.link_for(dest);
        let mut guard = link.lock();
        match guard.phase() {
            Phase::Up => guard.write(&self.shared.peer_id, dest, bytes).map(|()| true),
            Phase::Dialing => Ok(guard.enqueue(dest, bytes)),
            Phase::BackingOff => Ok(false),
            Phase::Idle => {
                guard.state = LinkState::Dialing(vec![Bytes::copy_from_slice(bytes)]);
                drop(guard);
                self.dial_in_background(dest, endpoint, link);
                Ok(true)
            }
        }
    }

    fn dial_in_background(&self, dest: &str, endpoint: Endpoint, link: Arc<Mutex<PeerLink>>) {
        let shared = Arc::clone(&self.shared);
        let peer = dest.to_string();
        let slot = Arc::clone(&link);
        let spawned = thread::Builder::new()
            .name("peerlink-dial".to_string())
            .spawn(move || {
                let dialed = dial(&shared, &peer, &endpoint);
                if let Err(err) = finish_dial(&shared, &peer, &slot, dialed, None) {
                    debug!(%peer, error = %err, "background dial failed");
                }
            });
        if let Err(err) = spawned {
            warn!(peer = %dest, error = %err, "failed to spawn dial thread");
            link.lock().state = LinkState::Idle;
        }
    }
}

fn dial(shared: &Shared, dest: &str, endpoint: &Endpoint) -> Result<FrameWriter<LinkStream>> {
    let options = &shared.options;
    let stream = LinkStream::connect(endpoint, Some(options.connect_timeout))?;
    let mut reader = FrameReader::for_link(stream.try_clone()?, options.handshake_frames())?;
    let mut writer = FrameWriter::for_link(stream, options.handshake_frames())?;
    let result = handshake_client(&mut reader, &mut writer, &shared.peer_id, &options.handshake)?;
    if result.peer_id != dest {
        warn!(
            expected = %dest,
            announced = %result.peer_id,
            %endpoint,
            "peer at address-book endpoint announced a different id"
        );
    }
    info!(peer = %dest, %endpoint, "outbound link established");
    Ok(writer)
}

/// Install the outcome of a dial, then write `first` and whatever queued
/// up while the dial was in flight, in that order.
fn finish_dial(
    shared: &Shared,
    dest: &str,
    link: &Mutex<PeerLink>,
    dialed: Result<FrameWriter<LinkStream>>,
    first: Option<&[u8]>,
) -> Result<()> {
    let mut guard = link.lock();
    let queued = match std::mem::take(&mut guard.state) {
        LinkState::Dialing(queued) => queued,
        _ => Vec::new(),
    };

    let writer = match dialed {
        Ok(writer) => writer,
        Err(err) => {
            guard.backoff = (guard.backoff * 2).clamp(MIN_REDIAL_BACKOFF, MAX_REDIAL_BACKOFF);
            guard.retry_at = Some(Instant::now() + guard.backoff);
            debug!(
                peer = %dest,
                error = %err,
                backoff = ?guard.backoff,
                dropped = queued.len(),
                "dial failed; backing off"
            );
            return Err(err);
        }
    };
    if shared.queue.is_closed() {
        let _ = writer.get_ref().shutdown();
        return Err(PeerError::Transport(TransportError::Shutdown));
    }
    guard.state = LinkState::Up(writer);
    guard.retry_at = None;
    guard.backoff = Duration::ZERO;

    if let Some(bytes) = first {
        guard.write(&shared.peer_id, dest, bytes)?;
    }
    for (sent, bytes) in queued.iter().enumerate() {
        if let Err(err) = guard.write(&shared.peer_id, dest, bytes) {
            debug!(peer = %dest, error = %err, dropped = queued.len() - sent, "queued sends lost");
            return Err(err);
        }
    }
    Ok(())
}

impl Transport for DirectTransport {
    fn name(&self) -> &'static str {
        "peer-to-peer"
    }

    fn local_id(&self) -> &str {
        &self.shared.peer_id
    }

    fn open(&self) -> Result<()> {
        if self.shared.queue.is_closed() {
            return Err(PeerError::Transport(TransportError::Shutdown));
        }
        let mut bound = self.bound.lock();
        if bound.is_some() {
            return Ok(());
        }

        let listener = LinkListener::bind(&self.bind)?;
        *bound = Some(listener.endpoint().clone());
        info!(
            peer_id = %self.shared.peer_id,
            endpoint = %listener.endpoint(),
            "peer-to-peer transport listening"
        );

        let shared = Arc::clone(&self.shared);
        let threads = Arc::clone(&self.threads);
        let accept = thread::Builder::new()
            .name("peerlink-accept".to_string())
            .spawn(move || accept_loop(listener, shared, threads))
            .map_err(TransportError::Io)?;
        self.threads.lock().push(accept);
        Ok(())
    }

    fn connect(&self, peer_id: &str, address: &str) -> Result<()> {
        let endpoint = Endpoint::parse(address)?;
        self.add_peer(peer_id, endpoint);
        Ok(())
    }

    fn send(&self, dest: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if dest == self.shared.peer_id {
            self.shared
                .queue
                .push(&self.shared.peer_id, Bytes::copy_from_slice(bytes));
            return Ok(());
        }
        self.send_remote(dest, bytes)
    }

    fn broadcast(&self, bytes: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let peers: Vec<(String, Endpoint)> = self
            .book
            .read()
            .iter()
            .filter(|(peer, _)| **peer != self.shared.peer_id)
            .map(|(peer, endpoint)| (peer.clone(), endpoint.clone()))
            .collect();

        let mut handed = 0;
        for (peer, endpoint) in peers {
            match self.offer(&peer, endpoint, bytes) {
                Ok(true) => handed += 1,
                Ok(false) => trace!(%peer, "broadcast skipped peer in backoff"),
                Err(err) => debug!(%peer, error = %err, "broadcast skipped unreachable peer"),
            }
        }
        Ok(handed)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Inbound>> {
        self.shared.queue.recv_timeout(timeout)
    }

    fn close(&self) {
        if !self.shared.queue.close() {
            return;
        }
        for (_, link) in self.outbound.lock().drain() {
            link.lock().shutdown();
        }
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        info!(peer_id = %self.shared.peer_id, "peer-to-peer transport closed");
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(listener: LinkListener, shared: Arc<Shared>, threads: Arc<Mutex<Vec<JoinHandle<()>>>>) {
    while !shared.queue.is_closed() {
        match listener.try_accept() {
            Ok(Some(stream)) => {
                let link = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name("peerlink-link".to_string())
                    .spawn(move || serve_inbound(stream, link));
                match spawned {
                    Ok(handle) => {
                        let mut threads = threads.lock();
                        threads.retain(|h| !h.is_finished());
                        threads.push(handle);
                    }
                    Err(err) => warn!(error = %err, "failed to spawn inbound link thread"),
                }
            }
            Ok(None) => thread::sleep(shared.options.poll_interval.min(Duration::from_millis(20))),
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(shared.options.poll_interval);
            }
        }
    }
    debug!(endpoint = %listener.endpoint(), "accept loop stopped");
}

fn serve_inbound(stream: LinkStream, shared: Arc<Shared>) {
    let label = stream.peer_label();
    let remote = match accept_handshake(stream, &shared) {
        Ok(accepted) => accepted,
        Err(err) => {
            warn!(remote = %label, error = %err, "inbound handshake failed");
            return;
        }
    };
    let (remote_id, mut reader) = remote;
    info!(peer = %remote_id, remote = %label, "inbound link established");

    loop {
        match reader.read_frame() {
            Ok(frame) if frame.channel == DELIVER => match decode_route(frame.payload) {
                Ok((claimed, body)) => {
                    if claimed != remote_id {
                        debug!(%claimed, peer = %remote_id, "route prefix differs from link identity");
                    }
                    shared.queue.push(&remote_id, body);
                }
                Err(err) => warn!(peer = %remote_id, error = %err, "dropping malformed frame"),
            },
            Ok(frame) => {
                warn!(peer = %remote_id, channel = channel_name(frame.channel), "unexpected channel on inbound link")
            }
            Err(err) if err.is_timeout() => {
                if shared.queue.is_closed() {
                    break;
                }
            }
            Err(FrameError::ConnectionClosed) => {
                debug!(peer = %remote_id, "inbound link closed by peer");
                break;
            }
            Err(err) => {
                warn!(peer = %remote_id, error = %err, "inbound link failed");
                break;
            }
        }
    }
    let _ = reader.get_ref().shutdown();
}

fn accept_handshake(
    stream: LinkStream,
    shared: &Shared,
) -> Result<(String, FrameReader<LinkStream>)> {
    let options = &shared.options;
    let mut reader = FrameReader::for_link(stream.try_clone()?, options.handshake_frames())?;
    let mut writer = FrameWriter::for_link(stream, options.handshake_frames())?;
    let result = handshake_server(&mut reader, &mut writer, &shared.peer_id, &options.handshake)?;
    reader.set_read_timeout(Some(options.poll_interval))?;
    Ok((result.peer_id, reader))
}
