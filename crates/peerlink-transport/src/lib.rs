//! Stream transports for peerlink.
//!
//! Provides a unified interface over the byte-stream media a peer can bind
//! or dial:
//! - TCP (`tcp://host:port`)
//! - Unix domain sockets (`unix:///path/to.sock`, Linux/macOS)
//!
//! This is the lowest layer of peerlink. Framing, handshakes and routing
//! all build on the [`LinkStream`] and [`LinkListener`] types provided here.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::LinkListener;
pub use stream::LinkStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
