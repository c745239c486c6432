//! Application-facing callbacks: request handlers, event handlers and
//! lifecycle hooks.

use serde_json::Value;

use crate::runtime::RuntimeHandle;

/// Metadata about the request being served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Peer that issued the request.
    pub source: String,
    /// Service key the request targets.
    pub key: String,
    pub correlation_id: String,
    /// Time-to-live the requester attached.
    pub ttl_ms: u64,
    /// Requester wall clock at send time, ms since epoch.
    pub sent_at: u64,
}

/// Failure reported by a request handler; becomes `{"ok": false, "error": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Serves requests for one service key.
///
/// Any `Fn(&Value, &RequestContext) -> HandlerResult` closure qualifies.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, payload: &Value, ctx: &RequestContext) -> HandlerResult;
}

impl<F> RequestHandler for F
where
    F: Fn(&Value, &RequestContext) -> HandlerResult + Send + Sync,
{
    fn handle(&self, payload: &Value, ctx: &RequestContext) -> HandlerResult {
        self(payload, ctx)
    }
}

/// Receives events published on a subscribed topic.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, topic: &str, payload: &Value);
}

impl<F> EventHandler for F
where
    F: Fn(&str, &Value) + Send + Sync,
{
    fn on_event(&self, topic: &str, payload: &Value) {
        self(topic, payload)
    }
}

/// Lifecycle hooks. Every method has a no-op default.
///
/// `on_hello` and `on_event` run on the runtime's event worker, never on the
/// receive loop.
pub trait Hooks: Send + Sync {
    /// Called once the transport is open, before `start` returns.
    fn on_start(&self, _runtime: &RuntimeHandle) {}

    /// Called during `stop` after the transport is closed.
    fn on_stop(&self) {}

    /// Called for every HELLO received from another peer.
    fn on_hello(&self, _runtime: &RuntimeHandle, _peer_id: &str) {}

    /// Called for every event delivered on a subscribed topic, after the
    /// topic's handlers.
    fn on_event(&self, _topic: &str, _payload: &Value) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl Hooks for NoHooks {}
