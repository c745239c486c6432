//! Peer-to-peer and brokered messaging for cooperating processes.
//!
//! peerlink joins processes ("peers") into a small mesh, either directly
//! over TCP / Unix sockets or through a central broker, and layers three
//! patterns on top: request/response RPC with a time-to-live,
//! fire-and-forget publish/subscribe, and HELLO-based discovery of which
//! peer serves which keys.
//!
//! # Crate Structure
//!
//! - [`transport`]: endpoints and raw socket streams (TCP, Unix sockets)
//! - [`frame`]: length-prefixed frames with channel and route prefixes
//! - [`runtime`]: the peer runtime, transports, broker and configuration

/// Re-export transport types.
pub mod transport {
    pub use peerlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use peerlink_frame::*;
}

/// Re-export runtime types.
pub mod runtime {
    pub use peerlink_runtime::*;
}

pub use peerlink_runtime::{
    HandlerError, HandlerResult, PeerError, PeerRuntime, RequestContext, RuntimeConfig,
    RuntimeHandle,
};
pub use peerlink_transport::Endpoint;
