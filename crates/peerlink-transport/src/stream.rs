use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};

/// A connected link stream — implements Read + Write.
///
/// This is the fundamental I/O type returned by dial and accept operations.
/// It wraps either a TCP stream or a Unix domain socket stream.
pub struct LinkStream {
    inner: LinkStreamInner,
}

enum LinkStreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for LinkStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            LinkStreamInner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for LinkStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            LinkStreamInner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            LinkStreamInner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl LinkStream {
    /// Dial an endpoint (blocking).
    ///
    /// `timeout` bounds the TCP connect; Unix sockets connect immediately or fail.
    pub fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Self> {
        let connect_err = |source: std::io::Error| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };

        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = match timeout {
                    Some(timeout) => {
                        let resolved = addr
                            .to_socket_addrs()
                            .map_err(connect_err)?
                            .next()
                            .ok_or_else(|| {
                                connect_err(std::io::Error::new(
                                    std::io::ErrorKind::NotFound,
                                    "address resolved to nothing",
                                ))
                            })?;
                        TcpStream::connect_timeout(&resolved, timeout).map_err(connect_err)?
                    }
                    None => TcpStream::connect(addr.as_str()).map_err(connect_err)?,
                };
                stream.set_nodelay(true).map_err(connect_err)?;
                debug!(%endpoint, "connected tcp link");
                Ok(Self::from_tcp(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => crate::uds::UnixDomainSocket::connect(path),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(connect_err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix domain sockets are not available on this platform",
            ))),
        }
    }

    /// Create a connected pair of Unix streams (useful for tests and loopback).
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: LinkStreamInner::Tcp(stream),
        }
    }

    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: LinkStreamInner::Unix(stream),
        }
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            LinkStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            LinkStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            LinkStreamInner::Tcp(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => {
                stream.set_nonblocking(nonblocking).map_err(Into::into)
            }
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            LinkStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
        }
    }

    /// Shut down both halves of the connection.
    ///
    /// Blocked readers on any clone of this stream observe end-of-stream.
    pub fn shutdown(&self) -> Result<()> {
        let res = match &self.inner {
            LinkStreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            LinkStreamInner::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
        match res {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Human-readable description of the remote side.
    pub fn peer_label(&self) -> String {
        match &self.inner {
            LinkStreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| format!("tcp://{addr}"))
                .unwrap_or_else(|_| "tcp://<unknown>".to_string()),
            #[cfg(unix)]
            LinkStreamInner::Unix(_) => "unix".to_string(),
        }
    }
}

impl std::fmt::Debug for LinkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            LinkStreamInner::Tcp(_) => f.debug_struct("LinkStream").field("type", &"tcp").finish(),
            #[cfg(unix)]
            LinkStreamInner::Unix(_) => {
                f.debug_struct("LinkStream").field("type", &"unix").finish()
            }
        }
    }
}
