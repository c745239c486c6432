#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use peerlink_runtime::envelope::now_millis;
use peerlink_runtime::{
    HandlerError, HandlerResult, PeerRuntime, PeerRuntimeBuilder, RequestContext, RuntimeConfig,
    Transport,
};
use serde_json::{json, Value};

pub const ADD_ERROR: &str = "payload must include numeric 'a' and 'b'";

/// `perf.echo`: stamp the receive time next to the caller's `t0`.
pub fn echo(payload: &Value, _ctx: &RequestContext) -> HandlerResult {
    Ok(json!({
        "ok": true,
        "t0": payload.get("t0").cloned().unwrap_or(Value::Null),
        "t1": now_millis(),
    }))
}

/// `math.add`: sum of numeric `a` and `b`.
pub fn add(payload: &Value, _ctx: &RequestContext) -> HandlerResult {
    let a = payload.get("a").and_then(Value::as_f64);
    let b = payload.get("b").and_then(Value::as_f64);
    match (a, b) {
        (Some(a), Some(b)) => Ok(json!({ "ok": true, "sum": a + b })),
        _ => Err(HandlerError::new(ADD_ERROR)),
    }
}

/// Records every event a subscriber sees.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<(String, Value)>>>);

impl EventLog {
    pub fn handler(&self) -> impl Fn(&str, &Value) + Send + Sync + 'static {
        let log = Arc::clone(&self.0);
        move |topic: &str, payload: &Value| log.lock().push((topic.to_string(), payload.clone()))
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.0.lock().clone()
    }

    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.0.lock().len() >= count)
    }
}

pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

/// Builder for a runtime over an already-constructed transport.
pub fn builder_over(transport: Arc<dyn Transport>, discovery: Option<Duration>) -> PeerRuntimeBuilder {
    let config = match discovery {
        Some(interval) => RuntimeConfig::custom(transport.local_id()).with_discovery(true, interval),
        None => RuntimeConfig::custom(transport.local_id()).with_discovery(false, Duration::from_secs(5)),
    };
    PeerRuntime::builder(config).transport(transport)
}
