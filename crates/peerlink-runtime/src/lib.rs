//! Transport-agnostic peer runtime.
//!
//! A [`PeerRuntime`] joins a set of peers over a [`Transport`] and offers
//! request/response RPC with a time-to-live, best-effort publish/subscribe,
//! and periodic HELLO discovery of which peer serves which keys.
//!
//! ```no_run
//! use std::time::Duration;
//! use peerlink_runtime::{PeerRuntime, RuntimeConfig, HandlerResult, RequestContext};
//! use peerlink_transport::Endpoint;
//! use serde_json::{json, Value};
//!
//! # fn main() -> peerlink_runtime::Result<()> {
//! let config = RuntimeConfig::peer_to_peer("peer-A", Endpoint::parse("tcp://127.0.0.1:5555")?)
//!     .with_peer("peer-B", Endpoint::parse("tcp://127.0.0.1:5556")?);
//! let runtime = PeerRuntime::builder(config)
//!     .service("perf.echo", |p: &Value, _: &RequestContext| -> HandlerResult { Ok(p.clone()) })
//!     .build()?;
//! let handle = runtime.start()?;
//! if handle.wait_for_key("peer-B", "math.add", Duration::from_secs(5))? {
//!     let sum = handle.rpc_default("peer-B", "math.add", json!({"a": 2, "b": 3}))?;
//!     println!("{sum}");
//! }
//! runtime.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod hooks;
pub mod link;
pub mod pool;
pub mod pubsub;
pub mod registry;
pub mod rpc;
pub mod runtime;
mod signal;

pub use config::{ConfigFile, RuntimeConfig, TransportConfig, ENV_PREFIX};
pub use discovery::DEFAULT_DISCOVERY_INTERVAL;
pub use envelope::{DecodeError, Envelope, EnvelopeKind};
pub use error::{PeerError, Result};
pub use handshake::{
    handshake_client, handshake_server, HandshakeConfig, HandshakeRequest, HandshakeResponse,
    HandshakeResult,
};
pub use hooks::{
    EventHandler, HandlerError, HandlerResult, Hooks, NoHooks, RequestContext, RequestHandler,
};
pub use link::{
    transport_for, Broker, BrokerConfig, BrokerHandle, BrokeredTransport, DirectTransport,
    Inbound, Incoming, LinkOptions, MemoryHub, MemoryTransport, Transport,
};
pub use pubsub::PubSubRouter;
pub use registry::{CapabilityRegistry, PeerRecord};
pub use rpc::{RequestState, RpcEngine, DEFAULT_TTL_MS};
pub use runtime::{LifecycleState, PeerRuntime, PeerRuntimeBuilder, RuntimeHandle};
