//! Two peers on TCP loopback: one serves `math.add`, the other calls it.
//!
//! Run with: cargo run --example echo-peer

use std::sync::Arc;
use std::time::Duration;

use peerlink::runtime::{DirectTransport, LinkOptions, Transport};
use peerlink::{Endpoint, HandlerError, HandlerResult, PeerRuntime, RequestContext, RuntimeConfig};
use serde_json::{json, Value};

fn add(payload: &Value, _ctx: &RequestContext) -> HandlerResult {
    match (payload["a"].as_f64(), payload["b"].as_f64()) {
        (Some(a), Some(b)) => Ok(json!({ "ok": true, "sum": a + b })),
        _ => Err(HandlerError::new("payload must include numeric 'a' and 'b'")),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let a = Arc::new(DirectTransport::new(
        "peer-A",
        Endpoint::tcp("127.0.0.1:0"),
        LinkOptions::default(),
    ));
    let b = Arc::new(DirectTransport::new(
        "peer-B",
        Endpoint::tcp("127.0.0.1:0"),
        LinkOptions::default(),
    ));
    a.open()?;
    b.open()?;
    if let (Some(a_at), Some(b_at)) = (a.local_endpoint(), b.local_endpoint()) {
        a.add_peer("peer-B", b_at);
        b.add_peer("peer-A", a_at);
    }

    let server = PeerRuntime::builder(RuntimeConfig::custom("peer-B"))
        .transport(b)
        .service("math.add", add)
        .build()?;
    let client = PeerRuntime::builder(RuntimeConfig::custom("peer-A"))
        .transport(a)
        .build()?;
    server.start()?;
    let handle = client.start()?;

    if !handle.wait_for_key("peer-B", "math.add", Duration::from_secs(5))? {
        eprintln!("peer-B never announced math.add");
        return Ok(());
    }
    let sum = handle.rpc_default("peer-B", "math.add", json!({ "a": 20, "b": 22 }))?;
    println!("math.add -> {sum}");
    let bad = handle.rpc_default("peer-B", "math.add", json!({ "a": "x" }))?;
    println!("math.add (bad input) -> {bad}");

    client.stop();
    server.stop();
    Ok(())
}
