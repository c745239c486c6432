use std::io::ErrorKind;
use std::net::TcpListener;

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::LinkStream;

/// A bound listener for any supported endpoint medium.
///
/// The listener is non-blocking: [`LinkListener::try_accept`] returns
/// `Ok(None)` when no connection is pending, so accept loops can observe a
/// shutdown flag between polls.
pub struct LinkListener {
    inner: ListenerInner,
    endpoint: Endpoint,
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(crate::uds::UnixDomainSocket),
}

impl LinkListener {
    /// Bind to an endpoint.
    ///
    /// Binding `tcp://host:0` picks an ephemeral port; [`LinkListener::endpoint`]
    /// reports the port actually bound.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let bind_err = |source: std::io::Error| TransportError::Bind {
                    endpoint: endpoint.to_string(),
                    source,
                };
                let listener = TcpListener::bind(addr.as_str()).map_err(bind_err)?;
                listener.set_nonblocking(true).map_err(bind_err)?;
                let local = listener.local_addr().map_err(bind_err)?;
                let bound = Endpoint::Tcp(local.to_string());
                info!(endpoint = %bound, "listening on tcp");
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                    endpoint: bound,
                })
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let socket = crate::uds::UnixDomainSocket::bind(path)?;
                socket.set_nonblocking(true)?;
                Ok(Self {
                    inner: ListenerInner::Unix(socket),
                    endpoint: endpoint.clone(),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Bind {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    ErrorKind::Unsupported,
                    "unix domain sockets are not available on this platform",
                ),
            }),
        }
    }

    /// Accept one pending connection, if any.
    pub fn try_accept(&self) -> Result<Option<LinkStream>> {
        let accepted = match &self.inner {
            ListenerInner::Tcp(listener) => match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nodelay(true).map_err(TransportError::Accept)?;
                    debug!(%addr, "accepted tcp connection");
                    Ok(LinkStream::from_tcp(stream))
                }
                Err(err) => Err(TransportError::Accept(err)),
            },
            #[cfg(unix)]
            ListenerInner::Unix(socket) => socket.accept(),
        };

        match accepted {
            Ok(stream) => {
                stream.set_nonblocking(false)?;
                Ok(Some(stream))
            }
            Err(TransportError::Accept(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// The endpoint this listener is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    use super::*;

    fn accept_within(listener: &LinkListener, timeout: Duration) -> LinkStream {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(stream) = listener.try_accept().unwrap() {
                return stream;
            }
            assert!(Instant::now() < deadline, "no connection accepted in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn tcp_ephemeral_port_is_reported() {
        let listener = LinkListener::bind(&Endpoint::tcp("127.0.0.1:0")).unwrap();
        match listener.endpoint() {
            Endpoint::Tcp(addr) => assert!(!addr.ends_with(":0")),
            other => panic!("unexpected endpoint {other:?}"),
        }
    }

    #[test]
    fn try_accept_without_client_returns_none() {
        let listener = LinkListener::bind(&Endpoint::tcp("127.0.0.1:0")).unwrap();
        assert!(listener.try_accept().unwrap().is_none());
    }

    #[test]
    fn tcp_accept_and_exchange() {
        let listener = LinkListener::bind(&Endpoint::tcp("127.0.0.1:0")).unwrap();
        let endpoint = listener.endpoint().clone();

        let client = std::thread::spawn(move || {
            let mut stream = LinkStream::connect(&endpoint, Some(Duration::from_secs(2))).unwrap();
            stream.write_all(b"hi").unwrap();
        });

        let mut server = accept_within(&listener, Duration::from_secs(2));
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        client.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn unix_accept_and_exchange() {
        let dir = std::env::temp_dir().join(format!("peerlink-listener-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let endpoint = Endpoint::unix(dir.join("l.sock"));
        let listener = LinkListener::bind(&endpoint).unwrap();

        let dial = endpoint.clone();
        let client = std::thread::spawn(move || {
            let mut stream = LinkStream::connect(&dial, None).unwrap();
            stream.write_all(b"yo").unwrap();
        });

        let mut server = accept_within(&listener, Duration::from_secs(2));
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"yo");
        client.join().unwrap();

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
