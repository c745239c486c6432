//! Local service table plus what we have learned about other peers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::hooks::RequestHandler;

/// What is known about one remote peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Service keys the peer serves. Only ever grows.
    pub keys: BTreeSet<String>,
    /// Topics the peer last advertised.
    pub topics: BTreeSet<String>,
    /// Last HELLO, or the moment keys were learned manually.
    pub last_seen: Instant,
}

impl PeerRecord {
    fn new() -> Self {
        Self {
            keys: BTreeSet::new(),
            topics: BTreeSet::new(),
            last_seen: Instant::now(),
        }
    }
}

/// Thread-safe capability registry.
#[derive(Default)]
pub struct CapabilityRegistry {
    local: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    remote: RwLock<HashMap<String, PeerRecord>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local service. Returns true when an existing handler was replaced.
    pub fn register_local(&self, key: &str, handler: Arc<dyn RequestHandler>) -> bool {
        let replaced = self.local.write().insert(key.to_string(), handler).is_some();
        debug!(%key, replaced, "registered local service");
        replaced
    }

    /// Remove a local service. Returns true when it existed.
    pub fn unregister_local(&self, key: &str) -> bool {
        self.local.write().remove(key).is_some()
    }

    pub fn handler(&self, key: &str) -> Option<Arc<dyn RequestHandler>> {
        self.local.read().get(key).cloned()
    }

    /// Locally served keys, sorted.
    pub fn local_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.local.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Merge manually learned keys for a peer.
    pub fn record_remote(&self, peer_id: &str, keys: impl IntoIterator<Item = String>) {
        let mut remote = self.remote.write();
        let record = remote
            .entry(peer_id.to_string())
            .or_insert_with(PeerRecord::new);
        record.keys.extend(keys);
        record.last_seen = Instant::now();
    }

    /// Apply a HELLO: merge keys, replace topics, refresh `last_seen`.
    pub fn record_hello(
        &self,
        peer_id: &str,
        keys: impl IntoIterator<Item = String>,
        topics: impl IntoIterator<Item = String>,
    ) {
        let mut remote = self.remote.write();
        let record = remote
            .entry(peer_id.to_string())
            .or_insert_with(PeerRecord::new);
        record.keys.extend(keys);
        record.topics = topics.into_iter().collect();
        record.last_seen = Instant::now();
    }

    /// Keys known for a peer; empty for unknown peers.
    pub fn known_keys(&self, peer_id: &str) -> BTreeSet<String> {
        self.remote
            .read()
            .get(peer_id)
            .map(|record| record.keys.clone())
            .unwrap_or_default()
    }

    pub fn has_key(&self, peer_id: &str, key: &str) -> bool {
        self.remote
            .read()
            .get(peer_id)
            .is_some_and(|record| record.keys.contains(key))
    }

    /// Remote peers that advertised a subscription to `topic`.
    pub fn remote_subscribers(&self, topic: &str) -> Vec<String> {
        let mut peers: Vec<String> = self
            .remote
            .read()
            .iter()
            .filter(|(_, record)| record.topics.contains(topic))
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Peers seen within `window`, with the time since they were last seen.
    pub fn peers_alive(&self, window: Duration) -> BTreeMap<String, Duration> {
        let now = Instant::now();
        self.remote
            .read()
            .iter()
            .filter_map(|(peer, record)| {
                let age = now.saturating_duration_since(record.last_seen);
                (age <= window).then(|| (peer.clone(), age))
            })
            .collect()
    }

    /// All known remote peers, sorted.
    pub fn peers(&self) -> BTreeMap<String, PeerRecord> {
        self.remote
            .read()
            .iter()
            .map(|(peer, record)| (peer.clone(), record.clone()))
            .collect()
    }

    /// Drop everything known about a peer. Returns true when it was known.
    pub fn forget_peer(&self, peer_id: &str) -> bool {
        self.remote.write().remove(peer_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::hooks::{HandlerResult, RequestContext};

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn local_registration_and_replacement() {
        let registry = CapabilityRegistry::new();
        let first: Arc<dyn RequestHandler> =
            Arc::new(|_: &serde_json::Value, _: &RequestContext| -> HandlerResult { Ok(json!(1)) });
        let second: Arc<dyn RequestHandler> =
            Arc::new(|_: &serde_json::Value, _: &RequestContext| -> HandlerResult { Ok(json!(2)) });

        assert!(!registry.register_local("svc.b", first));
        assert!(registry.register_local("svc.b", second));
        registry.register_local("svc.a", Arc::new(
            |_: &serde_json::Value, _: &RequestContext| -> HandlerResult { Ok(json!(null)) },
        ));

        assert_eq!(registry.local_keys(), keys(&["svc.a", "svc.b"]));
        let ctx = RequestContext {
            source: "x".into(),
            key: "svc.b".into(),
            correlation_id: "c".into(),
            ttl_ms: 1,
            sent_at: 0,
        };
        let reply = registry.handler("svc.b").unwrap().handle(&json!({}), &ctx).unwrap();
        assert_eq!(reply, json!(2));

        assert!(registry.unregister_local("svc.b"));
        assert!(!registry.unregister_local("svc.b"));
        assert!(registry.handler("svc.b").is_none());
    }

    #[test]
    fn learning_merges_and_is_idempotent() {
        let registry = CapabilityRegistry::new();
        registry.record_remote("peer-B", keys(&["math.add"]));
        registry.record_remote("peer-B", keys(&["math.add", "perf.echo"]));

        assert_eq!(
            registry.known_keys("peer-B").into_iter().collect::<Vec<_>>(),
            keys(&["math.add", "perf.echo"])
        );
        assert!(registry.has_key("peer-B", "perf.echo"));
        assert!(!registry.has_key("peer-C", "perf.echo"));
        assert!(registry.known_keys("peer-C").is_empty());
    }

    #[test]
    fn hello_keeps_keys_but_replaces_topics() {
        let registry = CapabilityRegistry::new();
        registry.record_hello("peer-B", keys(&["a"]), keys(&["alerts"]));
        registry.record_hello("peer-B", keys(&["b"]), keys(&["metrics"]));

        assert!(registry.has_key("peer-B", "a"));
        assert!(registry.has_key("peer-B", "b"));
        assert!(registry.remote_subscribers("alerts").is_empty());
        assert_eq!(registry.remote_subscribers("metrics"), keys(&["peer-B"]));
    }

    #[test]
    fn liveness_window_and_forgetting() {
        let registry = CapabilityRegistry::new();
        registry.record_hello("peer-B", Vec::new(), Vec::new());

        let alive = registry.peers_alive(Duration::from_secs(60));
        assert!(alive.contains_key("peer-B"));
        assert!(registry.peers_alive(Duration::ZERO).len() <= 1);

        assert!(registry.forget_peer("peer-B"));
        assert!(registry.peers_alive(Duration::from_secs(60)).is_empty());
        assert!(!registry.forget_peer("peer-B"));
    }
}
