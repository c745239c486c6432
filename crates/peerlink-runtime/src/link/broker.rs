use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_frame::{channel_name, decode_route, FrameError, FrameReader, FrameWriter, BROADCAST, DELIVER, DIRECT, ERROR};
use peerlink_transport::{Endpoint, LinkListener, LinkStream, TransportError};
use serde_json::json;
use tracing::{debug, info, trace, warn};

use super::LinkOptions;
use crate::error::Result;
use crate::handshake::handshake_server;

/// Identity the broker announces during link handshakes.
pub const BROKER_ID: &str = "peerlink-broker";

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub endpoint: Endpoint,
    /// `handshake.auth_token`, when set, is required from every peer.
    pub link: LinkOptions,
}

impl BrokerConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            link: LinkOptions::default(),
        }
    }
}

/// Routes frames between peers by id.
///
/// Each peer holds one link. DIRECT frames are forwarded to the named peer
/// as DELIVER frames carrying the sender's id; BROADCAST frames go to every
/// attached peer except the sender. A peer that re-attaches under the same
/// id replaces its previous link.
pub struct Broker;

impl Broker {
    /// Bind and start serving in background threads.
    pub fn bind(config: BrokerConfig) -> Result<BrokerHandle> {
        let listener = LinkListener::bind(&config.endpoint)?;
        let endpoint = listener.endpoint().clone();
        info!(%endpoint, "broker listening");

        let shared = Arc::new(BrokerShared {
            options: config.link,
            routes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_link: AtomicU64::new(1),
            threads: Mutex::new(Vec::new()),
        });
        let accept_shared = Arc::clone(&shared);
        let accept = thread::Builder::new()
            .name("peerlink-broker".to_string())
            .spawn(move || accept_loop(listener, accept_shared))
            .map_err(TransportError::Io)?;

        Ok(BrokerHandle {
            endpoint,
            shared,
            accept: Some(accept),
        })
    }
}

/// Running broker. Dropping the handle shuts the broker down.
pub struct BrokerHandle {
    endpoint: Endpoint,
    shared: Arc<BrokerShared>,
    accept: Option<JoinHandle<()>>,
}

impl BrokerHandle {
    /// Endpoint actually bound.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Ids of currently attached peers, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.shared.routes.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_running(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting, drop every link and join the serving threads.
    pub fn shutdown(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, route) in self.shared.routes.lock().drain() {
            let _ = route.stream.shutdown();
        }
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
        let links: Vec<JoinHandle<()>> = self.shared.threads.lock().drain(..).collect();
        for link in links {
            let _ = link.join();
        }
        info!(endpoint = %self.endpoint, "broker stopped");
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct BrokerShared {
    options: LinkOptions,
    routes: Mutex<HashMap<String, Route>>,
    closed: AtomicBool,
    next_link: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Route {
    link_id: u64,
    writer: Arc<Mutex<FrameWriter<LinkStream>>>,
    stream: LinkStream,
}

impl BrokerShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn attach(&self, peer_id: &str, link_id: u64, stream: &LinkStream) -> Result<()> {
        let writer = FrameWriter::for_link(stream.try_clone()?, self.options.frames())?;
        let route = Route {
            link_id,
            writer: Arc::new(Mutex::new(writer)),
            stream: stream.try_clone()?,
        };
        if let Some(previous) = self.routes.lock().insert(peer_id.to_string(), route) {
            info!(peer = %peer_id, "peer re-attached; replacing previous link");
            let _ = previous.stream.shutdown();
        }
        Ok(())
    }

    fn detach(&self, peer_id: &str, link_id: u64) {
        let mut routes = self.routes.lock();
        if routes.get(peer_id).is_some_and(|route| route.link_id == link_id) {
            routes.remove(peer_id);
        }
    }

    fn writer_for(&self, peer_id: &str) -> Option<(u64, Arc<Mutex<FrameWriter<LinkStream>>>)> {
        self.routes
            .lock()
            .get(peer_id)
            .map(|route| (route.link_id, Arc::clone(&route.writer)))
    }

    /// Forward `body` from `source` to `dest`. Returns false when `dest` is not attached.
    fn deliver(&self, source: &str, dest: &str, body: &[u8]) -> bool {
        let Some((link_id, writer)) = self.writer_for(dest) else {
            return false;
        };
        let sent = writer.lock().send_routed(DELIVER, source, body);
        if let Err(err) = sent {
            warn!(peer = %dest, error = %err, "delivery failed; dropping link");
            if let Some(route) = self.routes.lock().get(dest) {
                if route.link_id == link_id {
                    let _ = route.stream.shutdown();
                }
            }
            self.detach(dest, link_id);
            return false;
        }
        true
    }

    fn fan_out(&self, source: &str, body: &[u8]) -> usize {
        let targets: Vec<String> = self
            .routes
            .lock()
            .keys()
            .filter(|peer| peer.as_str() != source)
            .cloned()
            .collect();
        targets
            .iter()
            .filter(|dest| self.deliver(source, dest, body))
            .count()
    }

    fn report_unroutable(&self, source: &str, dest: &str) {
        let Some((_, writer)) = self.writer_for(source) else {
            return;
        };
        let detail = json!({ "error": "unknown destination", "dest": dest }).to_string();
        let mut writer = writer.lock();
        if let Err(err) = writer.send(ERROR, detail.as_bytes()) {
            debug!(peer = %source, error = %err, "could not report routing error");
        }
    }
}

fn accept_loop(listener: LinkListener, shared: Arc<BrokerShared>) {
    while !shared.is_closed() {
        match listener.try_accept() {
            Ok(Some(stream)) => {
                let link_shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name("peerlink-broker-link".to_string())
                    .spawn(move || serve_link(stream, link_shared));
                match spawned {
                    Ok(handle) => {
                        let mut threads = shared.threads.lock();
                        threads.retain(|h| !h.is_finished());
                        threads.push(handle);
                    }
                    Err(err) => warn!(error = %err, "failed to spawn broker link thread"),
                }
            }
            Ok(None) => thread::sleep(Duration::from_millis(20)),
            Err(err) => {
                warn!(error = %err, "broker accept failed");
                thread::sleep(shared.options.poll_interval);
            }
        }
    }
}

fn serve_link(stream: LinkStream, shared: Arc<BrokerShared>) {
    let label = stream.peer_label();
    let link_id = shared.next_link.fetch_add(1, Ordering::Relaxed);

    let (peer_id, mut reader) = match open_link(&stream, &shared, link_id) {
        Ok(opened) => opened,
        Err(err) => {
            warn!(remote = %label, error = %err, "peer failed to attach");
            let _ = stream.shutdown();
            return;
        }
    };
    info!(peer = %peer_id, remote = %label, "peer attached");

    loop {
        match reader.read_frame() {
            Ok(frame) => route_frame(&shared, &peer_id, frame.channel, frame.payload),
            Err(err) if err.is_timeout() => {
                if shared.is_closed() {
                    break;
                }
            }
            Err(FrameError::ConnectionClosed) => break,
            Err(err) => {
                if !shared.is_closed() {
                    warn!(peer = %peer_id, error = %err, "peer link failed");
                }
                break;
            }
        }
    }

    shared.detach(&peer_id, link_id);
    let _ = stream.shutdown();
    info!(peer = %peer_id, "peer detached");
}

fn open_link(
    stream: &LinkStream,
    shared: &BrokerShared,
    link_id: u64,
) -> Result<(String, FrameReader<LinkStream>)> {
    let options = &shared.options;
    let mut reader = FrameReader::for_link(stream.try_clone()?, options.handshake_frames())?;
    let mut writer = FrameWriter::for_link(stream.try_clone()?, options.handshake_frames())?;
    let result = handshake_server(&mut reader, &mut writer, BROKER_ID, &options.handshake)?;
    reader.set_read_timeout(Some(options.poll_interval))?;
    shared.attach(&result.peer_id, link_id, stream)?;
    Ok((result.peer_id, reader))
}

fn route_frame(shared: &BrokerShared, source: &str, channel: u16, payload: Bytes) {
    match channel {
        DIRECT => match decode_route(payload) {
            Ok((dest, body)) => {
                if shared.deliver(source, &dest, &body) {
                    trace!(from = %source, to = %dest, len = body.len(), "routed");
                } else {
                    debug!(from = %source, to = %dest, "destination not attached");
                    shared.report_unroutable(source, &dest);
                }
            }
            Err(err) => warn!(peer = %source, error = %err, "malformed DIRECT frame"),
        },
        BROADCAST => match decode_route(payload) {
            Ok((_, body)) => {
                let reached = shared.fan_out(source, &body);
                trace!(from = %source, reached, "broadcast fanned out");
            }
            Err(err) => warn!(peer = %source, error = %err, "malformed BROADCAST frame"),
        },
        other => warn!(peer = %source, channel = channel_name(other), "unexpected channel from peer"),
    }
}
