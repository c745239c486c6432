//! Periodic HELLO announcements and their interpretation.
//!
//! Discovery is advisory: a peer can always be called if the caller already
//! knows it serves a key, HELLO or not.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::link::Transport;
use crate::pubsub::PubSubRouter;
use crate::registry::CapabilityRegistry;
use crate::signal::StopSignal;

/// Default period between HELLO broadcasts.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Broadcast one HELLO advertising our keys and topics.
pub(crate) fn announce(
    transport: &dyn Transport,
    registry: &CapabilityRegistry,
    router: &PubSubRouter,
) -> Result<usize> {
    let hello = Envelope::hello(transport.local_id(), &registry.local_keys(), &router.topics());
    let reached = transport.broadcast(&hello.encode()?)?;
    trace!(reached, "HELLO broadcast");
    Ok(reached)
}

/// Fold a received HELLO into the registry. Malformed lists count as empty.
pub(crate) fn absorb_hello(registry: &CapabilityRegistry, hello: &Envelope) {
    let payload = hello.payload_or_null();
    let keys = string_list(payload.get("keys"));
    let topics = string_list(payload.get("topics"));
    debug!(peer = %hello.source, keys = keys.len(), topics = topics.len(), "HELLO received");
    registry.record_hello(&hello.source, keys, topics);
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Run the announce timer until `stop` fires.
pub(crate) fn run_timer(interval: Duration, hello_on_start: bool, stop: &StopSignal, announce: impl Fn()) {
    if hello_on_start && !stop.is_set() {
        announce();
    }
    while !stop.wait_timeout(interval) {
        announce();
    }
    debug!("discovery timer stopped");
}
