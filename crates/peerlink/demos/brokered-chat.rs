//! A broker and three peers exchanging `chat` events.
//!
//! Run with: cargo run --example brokered-chat

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use peerlink::runtime::{Broker, BrokerConfig, BrokeredTransport, LinkOptions};
use peerlink::{Endpoint, PeerRuntime, RuntimeConfig};
use serde_json::{json, Value};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut broker = Broker::bind(BrokerConfig::new(Endpoint::tcp("127.0.0.1:0")))?;
    println!("broker on {}", broker.endpoint());

    let mut peers = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let transport = Arc::new(BrokeredTransport::new(
            name,
            broker.endpoint().clone(),
            LinkOptions::default(),
        ));
        let config = RuntimeConfig::custom(name).with_discovery(true, Duration::from_millis(200));
        let runtime = PeerRuntime::builder(config)
            .transport(transport)
            .subscribe("chat", move |_topic: &str, payload: &Value| {
                println!("[{name}] {}: {}", payload["from"], payload["text"]);
            })
            .build()?;
        runtime.start()?;
        peers.push(runtime);
    }

    let alice = peers[0].handle();
    alice.wait_for_peer("carol", Duration::from_secs(5))?;
    alice.publish("chat", json!({ "from": "alice", "text": "hello, everyone" }))?;
    thread::sleep(Duration::from_millis(300));

    for runtime in &peers {
        runtime.stop();
    }
    broker.shutdown();
    Ok(())
}
