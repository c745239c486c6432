use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use peerlink_frame::{channel_name, decode_route, FrameError, FrameReader, FrameWriter, BROADCAST, DELIVER, DIRECT, ERROR};
use peerlink_transport::{Endpoint, LinkStream, TransportError};
use tracing::{debug, info, trace, warn};

use super::{Inbound, InboundQueue, LinkOptions, Transport};
use crate::error::{PeerError, Result};
use crate::handshake::handshake_client;

/// Transport that reaches every peer through one broker link.
///
/// Sends are DIRECT frames addressed by peer id; broadcasts are a single
/// BROADCAST frame the broker fans out. The link is not re-established if
/// the broker goes away.
pub struct BrokeredTransport {
    peer_id: String,
    broker: Endpoint,
    options: LinkOptions,
    queue: InboundQueue,
    writer: Mutex<Option<FrameWriter<LinkStream>>>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl BrokeredTransport {
    pub fn new(peer_id: &str, broker: Endpoint, options: LinkOptions) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            broker,
            options,
            queue: InboundQueue::new(),
            writer: Mutex::new(None),
            reader_thread: Mutex::new(None),
        }
    }

    /// Broker endpoint this transport dials.
    pub fn broker(&self) -> &Endpoint {
        &self.broker
    }

    fn write(&self, channel: u16, route: &str, bytes: &[u8]) -> Result<()> {
        if self.queue.is_closed() {
            return Err(PeerError::Transport(TransportError::Shutdown));
        }
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or(PeerError::Transport(TransportError::NotConnected))?;
        if let Err(err) = writer.send_routed(channel, route, bytes) {
            warn!(broker = %self.broker, error = %err, "broker link failed");
            if let Some(dead) = guard.take() {
                let _ = dead.get_ref().shutdown();
            }
            return Err(err.into());
        }
        Ok(())
    }
}

impl Transport for BrokeredTransport {
    fn name(&self) -> &'static str {
        "brokered"
    }

    fn local_id(&self) -> &str {
        &self.peer_id
    }

    fn open(&self) -> Result<()> {
        if self.queue.is_closed() {
            return Err(PeerError::Transport(TransportError::Shutdown));
        }
        let mut guard = self.writer.lock();
        if guard.is_some() {
            return Ok(());
        }

        let stream = LinkStream::connect(&self.broker, Some(self.options.connect_timeout))?;
        let mut reader = FrameReader::for_link(stream.try_clone()?, self.options.handshake_frames())?;
        let mut writer = FrameWriter::for_link(stream, self.options.handshake_frames())?;
        let result = handshake_client(&mut reader, &mut writer, &self.peer_id, &self.options.handshake)?;
        reader.set_read_timeout(Some(self.options.poll_interval))?;
        info!(peer_id = %self.peer_id, broker = %self.broker, broker_id = %result.peer_id, "attached to broker");

        let queue = self.queue.clone();
        let broker = self.broker.clone();
        let handle = thread::Builder::new()
            .name("peerlink-broker-rx".to_string())
            .spawn(move || read_loop(reader, queue, broker))
            .map_err(TransportError::Io)?;
        *self.reader_thread.lock() = Some(handle);
        *guard = Some(writer);
        Ok(())
    }

    fn connect(&self, _peer_id: &str, _address: &str) -> Result<()> {
        Ok(())
    }

    fn send(&self, dest: &str, bytes: &[u8]) -> Result<()> {
        self.write(DIRECT, dest, bytes)?;
        trace!(to = %dest, len = bytes.len(), "brokered send");
        Ok(())
    }

    fn broadcast(&self, bytes: &[u8]) -> Result<usize> {
        self.write(BROADCAST, "", bytes)?;
        Ok(1)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Inbound>> {
        self.queue.recv_timeout(timeout)
    }

    fn close(&self) {
        if !self.queue.close() {
            return;
        }
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.get_ref().shutdown();
        }
        if let Some(handle) = self.reader_thread.lock().take() {
            let _ = handle.join();
        }
        info!(peer_id = %self.peer_id, "detached from broker");
    }
}

impl Drop for BrokeredTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(mut reader: FrameReader<LinkStream>, queue: InboundQueue, broker: Endpoint) {
    loop {
        match reader.read_frame() {
            Ok(frame) if frame.channel == DELIVER => match decode_route(frame.payload) {
                Ok((source, body)) => queue.push(&source, body),
                Err(err) => warn!(%broker, error = %err, "dropping malformed delivery"),
            },
            Ok(frame) if frame.channel == ERROR => {
                let detail = String::from_utf8_lossy(&frame.payload);
                warn!(%broker, %detail, "broker reported a routing error");
            }
            Ok(frame) => {
                debug!(%broker, channel = channel_name(frame.channel), "ignoring unexpected channel from broker")
            }
            Err(err) if err.is_timeout() => {
                if queue.is_closed() {
                    break;
                }
            }
            Err(FrameError::ConnectionClosed) => {
                if !queue.is_closed() {
                    warn!(%broker, "broker closed the link");
                }
                break;
            }
            Err(err) => {
                if !queue.is_closed() {
                    warn!(%broker, error = %err, "broker link failed");
                }
                break;
            }
        }
    }
    let _ = reader.get_ref().shutdown();
}
