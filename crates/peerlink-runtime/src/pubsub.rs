use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::hooks::EventHandler;

/// Local topic subscriptions.
///
/// A topic may carry several handlers; they run in subscription order.
#[derive(Default)]
pub struct PubSubRouter {
    topics: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl PubSubRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        let mut topics = self.topics.write();
        let handlers = topics.entry(topic.to_string()).or_default();
        handlers.push(handler);
        debug!(%topic, handlers = handlers.len(), "subscribed");
    }

    /// Drop every handler for `topic`. Returns true when it was subscribed.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let removed = self.topics.write().remove(topic).is_some();
        if removed {
            debug!(%topic, "unsubscribed");
        }
        removed
    }

    pub fn handlers(&self, topic: &str) -> Vec<Arc<dyn EventHandler>> {
        self.topics.read().get(topic).cloned().unwrap_or_default()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.read().contains_key(topic)
    }

    /// Subscribed topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn handlers_accumulate_per_topic() {
        let router = PubSubRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            router.subscribe(
                "alerts",
                Arc::new(move |_: &str, _: &Value| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        for handler in router.handlers("alerts") {
            handler.on_event("alerts", &json!({}));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(router.handlers("metrics").is_empty());
    }

    #[test]
    fn unsubscribe_removes_topic() {
        let router = PubSubRouter::new();
        router.subscribe("b", Arc::new(|_: &str, _: &Value| {}));
        router.subscribe("a", Arc::new(|_: &str, _: &Value| {}));
        assert_eq!(router.topics(), vec!["a".to_string(), "b".to_string()]);

        assert!(router.unsubscribe("a"));
        assert!(!router.unsubscribe("a"));
        assert!(!router.is_subscribed("a"));
        assert!(router.is_subscribed("b"));
    }
}
