//! Request/response correlation.
//!
//! A caller registers a pending slot, sends REQ, and blocks on the slot
//! until RESP arrives, the TTL elapses, or the runtime stops. ACK only
//! moves the slot to `AwaitingResponse`; the deadline is unaffected.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::{json, Map, Value};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{PeerError, Result};
use crate::hooks::{HandlerResult, RequestContext, RequestHandler};
use crate::link::Transport;

/// Default request time-to-live.
pub const DEFAULT_TTL_MS: u64 = 8000;

/// Where an outstanding request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    AwaitingAck,
    AwaitingResponse,
    Resolved,
    TimedOut,
    Cancelled,
}

impl RequestState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::TimedOut | Self::Cancelled)
    }
}

struct SlotState {
    state: RequestState,
    response: Option<Value>,
}

/// One outstanding request.
pub struct PendingSlot {
    dest: String,
    key: String,
    deadline: Option<Instant>,
    inner: Mutex<SlotState>,
    ready: Condvar,
}

impl PendingSlot {
    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    /// Block until resolved, cancelled, or the deadline passes.
    fn wait(&self) -> (RequestState, Option<Value>) {
        let mut inner = self.inner.lock();
        while !inner.state.is_terminal() {
            let Some(deadline) = self.deadline else {
                self.ready.wait(&mut inner);
                continue;
            };
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                if !inner.state.is_terminal() {
                    inner.state = RequestState::TimedOut;
                }
                break;
            }
        }
        (inner.state, inner.response.take())
    }

    fn transition(&self, to: RequestState, response: Option<Value>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        if to == RequestState::AwaitingResponse && inner.state != RequestState::AwaitingAck {
            return false;
        }
        inner.state = to;
        if response.is_some() {
            inner.response = response;
        }
        if to.is_terminal() {
            self.ready.notify_all();
        }
        true
    }
}

/// Outstanding requests by correlation id.
#[derive(Default)]
pub struct PendingTable {
    slots: Mutex<HashMap<String, Arc<PendingSlot>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request. `None` waits without a deadline.
    pub fn register(
        &self,
        correlation_id: &str,
        dest: &str,
        key: &str,
        deadline: Option<Instant>,
    ) -> Arc<PendingSlot> {
        let slot = Arc::new(PendingSlot {
            dest: dest.to_string(),
            key: key.to_string(),
            deadline,
            inner: Mutex::new(SlotState {
                state: RequestState::AwaitingAck,
                response: None,
            }),
            ready: Condvar::new(),
        });
        self.slots
            .lock()
            .insert(correlation_id.to_string(), Arc::clone(&slot));
        slot
    }

    fn get(&self, correlation_id: &str) -> Option<Arc<PendingSlot>> {
        self.slots.lock().get(correlation_id).cloned()
    }

    /// Record an ACK. False when the id is unknown or already settled.
    pub fn acknowledge(&self, correlation_id: &str) -> bool {
        self.get(correlation_id)
            .is_some_and(|slot| slot.transition(RequestState::AwaitingResponse, None))
    }

    /// Record a RESP and wake the caller. False when the id is unknown or already settled.
    pub fn resolve(&self, correlation_id: &str, response: Value) -> bool {
        self.get(correlation_id)
            .is_some_and(|slot| slot.transition(RequestState::Resolved, Some(response)))
    }

    pub fn remove(&self, correlation_id: &str) -> Option<Arc<PendingSlot>> {
        self.slots.lock().remove(correlation_id)
    }

    /// Cancel and drop every outstanding request. Returns how many were woken.
    pub fn cancel_all(&self) -> usize {
        let slots: Vec<Arc<PendingSlot>> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        slots
            .iter()
            .filter(|slot| slot.transition(RequestState::Cancelled, None))
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller side of the request/response exchange.
pub struct RpcEngine {
    local_id: String,
    pending: PendingTable,
}

impl RpcEngine {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            pending: PendingTable::new(),
        }
    }

    /// Send a request and block for its response.
    ///
    /// `stopping` is checked after registration so a request issued while
    /// the runtime shuts down cannot miss its cancellation.
    pub fn call(
        &self,
        transport: &dyn Transport,
        stopping: impl Fn() -> bool,
        dest: &str,
        key: &str,
        payload: Value,
        ttl_ms: u64,
    ) -> Result<Value> {
        let correlation_id = Uuid::new_v4().to_string();
        let ttl = Duration::from_millis(ttl_ms);
        let slot = self
            .pending
            .register(&correlation_id, dest, key, Instant::now().checked_add(ttl));

        if stopping() {
            self.pending.remove(&correlation_id);
            return Err(PeerError::Cancelled);
        }

        let request = Envelope::request(&self.local_id, dest, &correlation_id, key, payload, ttl_ms);
        let sent = request
            .encode()
            .map_err(PeerError::from)
            .and_then(|bytes| transport.send(dest, &bytes));
        if let Err(err) = sent {
            self.pending.remove(&correlation_id);
            return Err(err);
        }
        trace!(%dest, %key, %correlation_id, ttl_ms, "request sent");

        let (state, response) = slot.wait();
        self.pending.remove(&correlation_id);
        match (state, response) {
            (RequestState::Resolved, Some(response)) => Ok(response),
            (RequestState::Cancelled, _) => Err(PeerError::Cancelled),
            _ => {
                debug!(dest = %slot.dest, key = %slot.key, %correlation_id, ttl_ms, "request timed out");
                Err(PeerError::Timeout(ttl))
            }
        }
    }

    /// Apply an inbound ACK.
    pub fn on_ack(&self, ack: &Envelope) {
        let Some(correlation_id) = ack.correlation_id.as_deref() else {
            return;
        };
        if !self.pending.acknowledge(correlation_id) {
            debug!(%correlation_id, from = %ack.source, "late or unknown ACK dropped");
        }
    }

    /// Apply an inbound RESP.
    pub fn on_response(&self, resp: &Envelope) {
        let Some(correlation_id) = resp.correlation_id.as_deref() else {
            return;
        };
        let payload = resp.payload.clone().unwrap_or_else(|| json!({}));
        if !self.pending.resolve(correlation_id, payload) {
            debug!(%correlation_id, from = %resp.source, "late or unknown RESP dropped");
        }
    }

    /// Outstanding requests.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Wake every waiter with `Cancelled`.
    pub fn cancel_all(&self) -> usize {
        self.pending.cancel_all()
    }
}

/// Shape a handler outcome into a RESP payload.
///
/// Objects pass through, `null` becomes `{}`, any other value is wrapped
/// as `{"data": value}`, and failures become `{"ok": false, "error": msg}`.
pub fn normalize_reply(result: HandlerResult) -> Value {
    match result {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(Value::Null) => Value::Object(Map::new()),
        Ok(other) => json!({ "data": other }),
        Err(err) => error_reply(&err.0),
    }
}

pub fn error_reply(message: &str) -> Value {
    json!({ "ok": false, "error": message })
}

/// Answer a request for a key we do not serve: RESP only, no ACK.
pub(crate) fn reject_unknown_key(transport: &dyn Transport, local_id: &str, request: &Envelope) {
    let key = request.key.as_deref().unwrap_or_default();
    reply(
        transport,
        local_id,
        request,
        error_reply(&format!("unknown key '{key}'")),
    );
}

/// Answer a request we could not schedule.
pub(crate) fn reject_busy(transport: &dyn Transport, local_id: &str, request: &Envelope) {
    reply(transport, local_id, request, error_reply("request queue full"));
}

/// ACK, run the handler, RESP. Handler panics become an error reply.
pub(crate) fn serve_request(
    transport: &dyn Transport,
    local_id: &str,
    handler: &dyn RequestHandler,
    request: &Envelope,
) {
    let (Some(correlation_id), Some(key)) = (request.correlation_id.as_deref(), request.key.as_deref())
    else {
        return;
    };

    let ack = Envelope::ack(local_id, &request.source, correlation_id);
    match ack.encode() {
        Ok(bytes) => {
            if let Err(err) = transport.send(&request.source, &bytes) {
                debug!(to = %request.source, %correlation_id, error = %err, "ACK not delivered");
            }
        }
        Err(err) => warn!(error = %err, "failed to encode ACK"),
    }

    let ctx = RequestContext {
        source: request.source.clone(),
        key: key.to_string(),
        correlation_id: correlation_id.to_string(),
        ttl_ms: request.ttl_ms.unwrap_or(DEFAULT_TTL_MS),
        sent_at: request.sent_at,
    };
    let payload = request.payload.clone().unwrap_or_else(|| json!({}));
    let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&payload, &ctx)));
    let body = match outcome {
        Ok(result) => normalize_reply(result),
        Err(_) => {
            error!(%key, from = %request.source, %correlation_id, "request handler panicked");
            error_reply("handler panicked")
        }
    };
    reply(transport, local_id, request, body);
}

fn reply(transport: &dyn Transport, local_id: &str, request: &Envelope, body: Value) {
    let Some(correlation_id) = request.correlation_id.as_deref() else {
        return;
    };
    let resp = Envelope::response(local_id, &request.source, correlation_id, body);
    match resp.encode() {
        Ok(bytes) => {
            if let Err(err) = transport.send(&request.source, &bytes) {
                warn!(to = %request.source, %correlation_id, error = %err, "RESP not delivered");
            }
        }
        Err(err) => warn!(error = %err, "failed to encode RESP"),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::envelope::EnvelopeKind;
    use crate::hooks::HandlerError;
    use crate::link::{MemoryHub, Transport};

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_reply(Ok(json!({"sum": 5}))), json!({"sum": 5}));
        assert_eq!(normalize_reply(Ok(Value::Null)), json!({}));
        assert_eq!(normalize_reply(Ok(json!(42))), json!({"data": 42}));
        assert_eq!(normalize_reply(Ok(json!([1, 2]))), json!({"data": [1, 2]}));
        assert_eq!(
            normalize_reply(Err(HandlerError::new("nope"))),
            json!({"ok": false, "error": "nope"})
        );
    }

    #[test]
    fn ack_then_resolve_wakes_waiter() {
        let table = Arc::new(PendingTable::new());
        let slot = table.register("c-1", "peer-B", "k", Instant::now().checked_add(Duration::from_secs(5)));

        let resolver = Arc::clone(&table);
        let handle = thread::spawn(move || {
            assert!(resolver.acknowledge("c-1"));
            assert!(!resolver.acknowledge("c-1"));
            assert!(resolver.resolve("c-1", json!({"ok": true})));
        });

        let (state, response) = slot.wait();
        handle.join().unwrap();
        assert_eq!(state, RequestState::Resolved);
        assert_eq!(response, Some(json!({"ok": true})));
    }

    #[test]
    fn ack_only_advances_to_awaiting_response() {
        let table = PendingTable::new();
        let slot = table.register("c-4", "peer-B", "k", None);
        assert_eq!(slot.state(), RequestState::AwaitingAck);
        assert!(table.acknowledge("c-4"));
        assert_eq!(slot.state(), RequestState::AwaitingResponse);
        assert_eq!(table.cancel_all(), 1);
        assert_eq!(slot.wait().0, RequestState::Cancelled);
    }

    #[test]
    fn response_without_ack_is_accepted() {
        let table = PendingTable::new();
        let slot = table.register("c-2", "peer-B", "k", Instant::now().checked_add(Duration::from_secs(1)));
        assert!(table.resolve("c-2", json!({})));
        assert!(!table.resolve("c-2", json!({"late": true})));
        assert!(!table.acknowledge("c-2"));
        assert_eq!(slot.wait().0, RequestState::Resolved);
    }

    #[test]
    fn deadline_elapses_to_timed_out() {
        let table = PendingTable::new();
        let slot = table.register("c-3", "peer-B", "k", Instant::now().checked_add(Duration::from_millis(30)));
        let started = Instant::now();
        let (state, response) = slot.wait();
        assert_eq!(state, RequestState::TimedOut);
        assert!(response.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert!(!table.resolve("c-3", json!({})), "late RESP must be dropped");
    }

    #[test]
    fn cancel_all_wakes_every_waiter() {
        let table = Arc::new(PendingTable::new());
        let slots: Vec<_> = (0..3)
            .map(|n| table.register(&format!("c-{n}"), "peer-B", "k", Instant::now().checked_add(Duration::from_secs(30))))
            .collect();

        let waiters: Vec<_> = slots
            .into_iter()
            .map(|slot| thread::spawn(move || slot.wait().0))
            .collect();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(table.cancel_all(), 3);
        assert!(table.is_empty());
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), RequestState::Cancelled);
        }
    }

    #[test]
    fn call_times_out_when_nobody_answers() {
        let hub = MemoryHub::new();
        let a = hub.transport("peer-A");
        let silent = hub.transport("peer-B");
        a.open().unwrap();
        silent.open().unwrap();

        let engine = RpcEngine::new("peer-A");
        let started = Instant::now();
        let err = engine
            .call(&a, || false, "peer-B", "perf.echo", json!({}), 100)
            .unwrap_err();
        assert!(matches!(err, PeerError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(engine.in_flight(), 0);

        let request = silent.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        let decoded = Envelope::decode(&request.bytes).unwrap();
        assert_eq!(decoded.kind, EnvelopeKind::Req);
        assert_eq!(decoded.ttl_ms, Some(100));
    }

    #[test]
    fn call_fails_fast_when_stopping() {
        let hub = MemoryHub::new();
        let a = hub.transport("peer-A");
        a.open().unwrap();
        let engine = RpcEngine::new("peer-A");
        let err = engine
            .call(&a, || true, "peer-A", "k", json!({}), 5000)
            .unwrap_err();
        assert!(matches!(err, PeerError::Cancelled));
        assert!(a.recv_timeout(Duration::from_millis(20)).unwrap().is_none());
    }

    #[test]
    fn serve_request_acks_then_responds() {
        let hub = MemoryHub::new();
        let client = hub.transport("peer-A");
        let server = hub.transport("peer-B");
        client.open().unwrap();
        server.open().unwrap();

        let request = Envelope::request("peer-A", "peer-B", "c-9", "math.add", json!({"a": 2, "b": 3}), 8000);
        let add = |payload: &Value, _: &RequestContext| -> HandlerResult {
            let sum = payload["a"].as_f64().unwrap_or(0.0) + payload["b"].as_f64().unwrap_or(0.0);
            Ok(json!({ "ok": true, "sum": sum }))
        };
        serve_request(&server, "peer-B", &add, &request);

        let ack = Envelope::decode(&client.recv_timeout(Duration::from_secs(1)).unwrap().unwrap().bytes).unwrap();
        let resp = Envelope::decode(&client.recv_timeout(Duration::from_secs(1)).unwrap().unwrap().bytes).unwrap();
        assert_eq!(ack.kind, EnvelopeKind::Ack);
        assert_eq!(resp.kind, EnvelopeKind::Resp);
        assert_eq!(resp.correlation_id.as_deref(), Some("c-9"));
        assert_eq!(resp.payload_or_null()["sum"], 5.0);
    }

    #[test]
    fn panicking_handler_yields_error_reply() {
        let hub = MemoryHub::new();
        let client = hub.transport("peer-A");
        let server = hub.transport("peer-B");
        client.open().unwrap();
        server.open().unwrap();

        let request = Envelope::request("peer-A", "peer-B", "c-p", "boom", json!({}), 8000);
        let boom = |_: &Value, _: &RequestContext| -> HandlerResult { panic!("kaboom") };
        serve_request(&server, "peer-B", &boom, &request);

        let _ack = client.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        let resp = Envelope::decode(&client.recv_timeout(Duration::from_secs(1)).unwrap().unwrap().bytes).unwrap();
        assert_eq!(resp.payload, Some(json!({"ok": false, "error": "handler panicked"})));
    }

    #[test]
    fn unknown_key_gets_response_without_ack() {
        let hub = MemoryHub::new();
        let client = hub.transport("peer-A");
        let server = hub.transport("peer-B");
        client.open().unwrap();
        server.open().unwrap();

        let request = Envelope::request("peer-A", "peer-B", "c-u", "ghost.key", json!({}), 8000);
        reject_unknown_key(&server, "peer-B", &request);

        let only = Envelope::decode(&client.recv_timeout(Duration::from_secs(1)).unwrap().unwrap().bytes).unwrap();
        assert_eq!(only.kind, EnvelopeKind::Resp);
        assert_eq!(only.payload_or_null()["error"], "unknown key 'ghost.key'");
        assert!(client.recv_timeout(Duration::from_millis(20)).unwrap().is_none());
    }
}
