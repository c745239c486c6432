mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{add, builder_over, echo, wait_until, EventLog, ADD_ERROR};
use peerlink_runtime::{
    HandlerResult, MemoryHub, PeerError, PeerRuntime, RequestContext, Transport,
};
use serde_json::{json, Value};

fn start_pair(hub: &Arc<MemoryHub>) -> (PeerRuntime, PeerRuntime) {
    let a = builder_over(Arc::new(hub.transport("peer-A")), None)
        .build()
        .expect("peer-A should build");
    let b = builder_over(Arc::new(hub.transport("peer-B")), None)
        .service("perf.echo", echo)
        .service("math.add", add)
        .build()
        .expect("peer-B should build");
    b.start().expect("peer-B should start");
    a.start().expect("peer-A should start");
    (a, b)
}

#[test]
fn echo_round_trip_carries_timestamps() {
    let hub = MemoryHub::new();
    let (a, _b) = start_pair(&hub);
    let handle = a.handle();

    let t0 = peerlink_runtime::envelope::now_millis();
    let reply = handle
        .rpc("peer-B", "perf.echo", json!({ "t0": t0 }), 2000)
        .expect("echo should answer");
    let t1 = reply["t1"].as_u64().expect("t1 should be a timestamp");
    assert_eq!(reply["ok"], json!(true));
    assert_eq!(reply["t0"], json!(t0));
    assert!(t1 >= t0);
}

#[test]
fn add_success_and_application_error() {
    let hub = MemoryHub::new();
    let (a, _b) = start_pair(&hub);
    let handle = a.handle();

    let sum = handle
        .rpc_default("peer-B", "math.add", json!({ "a": 2, "b": 3.5 }))
        .expect("add should answer");
    assert_eq!(sum, json!({ "ok": true, "sum": 5.5 }));

    let failure = handle
        .rpc_default("peer-B", "math.add", json!({ "a": "two" }))
        .expect("application errors still arrive as a reply");
    assert_eq!(failure, json!({ "ok": false, "error": ADD_ERROR }));
}

#[test]
fn unknown_key_is_answered_without_waiting_for_ttl() {
    let hub = MemoryHub::new();
    let (a, _b) = start_pair(&hub);

    let started = Instant::now();
    let reply = a
        .handle()
        .rpc("peer-B", "no.such.key", json!({}), 5000)
        .expect("unknown key should be answered");
    assert_eq!(reply, json!({ "ok": false, "error": "unknown key 'no.such.key'" }));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn silent_peer_times_out_after_ttl() {
    let hub = MemoryHub::new();
    let a = builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap();
    let handle = a.start().unwrap();

    // Registered on the hub but nobody reads its queue.
    let silent = hub.transport("peer-S");
    silent.open().unwrap();

    let started = Instant::now();
    let outcome = handle.rpc("peer-S", "perf.echo", json!({}), 200);
    assert!(matches!(outcome, Err(PeerError::Timeout(ttl)) if ttl == Duration::from_millis(200)));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

/// A handler that sleeps before answering and counts its invocations.
fn sleepy(delay: Duration, calls: &Arc<AtomicUsize>) -> impl Fn(&Value, &RequestContext) -> HandlerResult + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_: &Value, _: &RequestContext| -> HandlerResult {
        calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(delay);
        Ok(json!({ "ok": true, "slept_ms": delay.as_millis() as u64 }))
    }
}

#[test]
fn live_handler_slower_than_ttl_times_out_and_runs_once() {
    let hub = MemoryHub::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let a = builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap();
    let b = builder_over(Arc::new(hub.transport("peer-B")), None)
        .service("slow", sleepy(Duration::from_millis(400), &calls))
        .build()
        .unwrap();
    b.start().unwrap();
    let handle = a.start().unwrap();

    let started = Instant::now();
    let outcome = handle.rpc("peer-B", "slow", json!({}), 100);
    assert!(matches!(outcome, Err(PeerError::Timeout(ttl)) if ttl == Duration::from_millis(100)));
    assert!(started.elapsed() < Duration::from_millis(400), "ACK must not extend the deadline");

    // The late RESP is dropped and nothing is retried.
    thread::sleep(Duration::from_millis(600));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn each_request_invokes_its_handler_exactly_once() {
    let hub = MemoryHub::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let a = builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap();
    let b = builder_over(Arc::new(hub.transport("peer-B")), None)
        .service("count", sleepy(Duration::ZERO, &calls))
        .build()
        .unwrap();
    b.start().unwrap();
    let handle = a.start().unwrap();

    for n in 1..=3 {
        handle.rpc("peer-B", "count", json!({}), 2000).expect("count should answer");
        assert_eq!(calls.load(Ordering::SeqCst), n);
    }
}

#[test]
fn slow_handler_does_not_delay_unrelated_requests() {
    let hub = MemoryHub::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let a = builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap();
    let b = builder_over(Arc::new(hub.transport("peer-B")), None)
        .service("slow", sleepy(Duration::from_secs(1), &calls))
        .service("perf.echo", echo)
        .build()
        .unwrap();
    b.start().unwrap();
    let handle = a.start().unwrap();

    let slow_handle = handle.clone();
    let slow = thread::spawn(move || slow_handle.rpc("peer-B", "slow", json!({}), 5000));
    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));

    let started = Instant::now();
    let reply = handle
        .rpc("peer-B", "perf.echo", json!({ "t0": 1 }), 2000)
        .expect("echo should answer while slow runs");
    assert_eq!(reply["t0"], json!(1));
    assert!(started.elapsed() < Duration::from_millis(500));

    let slow_reply = slow.join().expect("slow caller should not panic").expect("slow should answer");
    assert_eq!(slow_reply["slept_ms"], json!(1000));
}

#[test]
fn unreachable_peer_fails_fast() {
    let hub = MemoryHub::new();
    let a = builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap();
    let handle = a.start().unwrap();

    assert!(matches!(
        handle.rpc("peer-nowhere", "perf.echo", json!({}), 5000),
        Err(PeerError::Transport(_))
    ));
}

#[test]
fn stop_cancels_pending_requests() {
    let hub = MemoryHub::new();
    let a = Arc::new(builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap());
    let handle = a.start().unwrap();
    let silent = hub.transport("peer-S");
    silent.open().unwrap();

    let caller = thread::spawn(move || handle.rpc("peer-S", "perf.echo", json!({}), 30_000));
    thread::sleep(Duration::from_millis(100));
    a.stop();

    let outcome = caller.join().expect("caller thread should not panic");
    assert!(matches!(outcome, Err(PeerError::Cancelled)));
}

#[test]
fn handler_panic_becomes_error_reply() {
    let hub = MemoryHub::new();
    let a = builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap();
    let b = builder_over(Arc::new(hub.transport("peer-B")), None)
        .service("boom", |_: &Value, _: &RequestContext| -> HandlerResult {
            panic!("handler exploded")
        })
        .service("perf.echo", echo)
        .build()
        .unwrap();
    b.start().unwrap();
    let handle = a.start().unwrap();

    let reply = handle.rpc("peer-B", "boom", json!({}), 2000).unwrap();
    assert_eq!(reply, json!({ "ok": false, "error": "handler panicked" }));

    // The worker survived.
    assert!(handle.rpc("peer-B", "perf.echo", json!({}), 2000).is_ok());
}

#[test]
fn non_object_results_are_normalized() {
    let hub = MemoryHub::new();
    let a = builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap();
    let b = builder_over(Arc::new(hub.transport("peer-B")), None)
        .service("count", |_: &Value, _: &RequestContext| -> HandlerResult { Ok(json!(3)) })
        .service("nothing", |_: &Value, _: &RequestContext| -> HandlerResult { Ok(Value::Null) })
        .build()
        .unwrap();
    b.start().unwrap();
    let handle = a.start().unwrap();

    assert_eq!(handle.rpc("peer-B", "count", json!({}), 2000).unwrap(), json!({ "data": 3 }));
    assert_eq!(handle.rpc("peer-B", "nothing", json!({}), 2000).unwrap(), json!({}));
}

#[test]
fn request_context_identifies_caller() {
    let hub = MemoryHub::new();
    let a = builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap();
    let b = builder_over(Arc::new(hub.transport("peer-B")), None)
        .service("whoami", |_: &Value, ctx: &RequestContext| -> HandlerResult {
            Ok(json!({ "source": ctx.source, "key": ctx.key, "ttl_ms": ctx.ttl_ms }))
        })
        .build()
        .unwrap();
    b.start().unwrap();
    let handle = a.start().unwrap();

    let reply = handle.rpc("peer-B", "whoami", json!({}), 1234).unwrap();
    assert_eq!(reply, json!({ "source": "peer-A", "key": "whoami", "ttl_ms": 1234 }));
}

#[test]
fn concurrent_callers_get_their_own_responses() {
    let hub = MemoryHub::new();
    let (a, _b) = start_pair(&hub);
    let handle = a.handle();

    let callers: Vec<_> = (0..16)
        .map(|n| {
            let handle = handle.clone();
            thread::spawn(move || {
                let reply = handle
                    .rpc("peer-B", "math.add", json!({ "a": n, "b": 1 }), 5000)
                    .expect("add should answer");
                (n, reply)
            })
        })
        .collect();

    for caller in callers {
        let (n, reply) = caller.join().unwrap();
        assert_eq!(reply["sum"].as_f64(), Some(f64::from(n + 1)));
    }
}

#[test]
fn publish_without_subscribers_reports_false() {
    let hub = MemoryHub::new();
    let (a, _b) = start_pair(&hub);
    assert!(!a.handle().publish("nobody.listens", json!({ "x": 1 })).unwrap());
}

#[test]
fn publish_reaches_local_subscriber() {
    let hub = MemoryHub::new();
    let log = EventLog::default();
    let a = builder_over(Arc::new(hub.transport("peer-A")), None)
        .subscribe("alerts", log.handler())
        .build()
        .unwrap();
    let handle = a.start().unwrap();

    assert!(handle.publish("alerts", json!({ "level": "warn" })).unwrap());
    assert!(log.wait_for(1, Duration::from_secs(2)));
    assert_eq!(log.events(), vec![("alerts".to_string(), json!({ "level": "warn" }))]);
}

#[test]
fn publish_reaches_remote_subscriber_learned_from_hello() {
    let hub = MemoryHub::new();
    let log = EventLog::default();
    let b = builder_over(Arc::new(hub.transport("peer-B")), Some(Duration::from_millis(50)))
        .subscribe("alerts", log.handler())
        .build()
        .unwrap();
    let a = builder_over(Arc::new(hub.transport("peer-A")), Some(Duration::from_millis(50)))
        .build()
        .unwrap();
    let handle = a.start().unwrap();
    b.start().unwrap();

    assert!(handle.wait_for_peer("peer-B", Duration::from_secs(2)).unwrap());
    assert_eq!(handle.known_topics("peer-B"), vec!["alerts".to_string()]);

    assert!(handle.publish("alerts", json!({ "n": 7 })).unwrap());
    assert!(log.wait_for(1, Duration::from_secs(2)));
    assert_eq!(log.events()[0].1, json!({ "n": 7 }));
}

#[test]
fn unsubscribed_topics_are_ignored_by_receivers() {
    let hub = MemoryHub::new();
    let log = EventLog::default();
    let b = builder_over(Arc::new(hub.transport("peer-B")), None)
        .subscribe("alerts", log.handler())
        .build()
        .unwrap();
    let a = builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap();
    b.start().unwrap();
    let handle = a.start().unwrap();

    handle.publish("metrics", json!({})).unwrap();
    handle.publish("alerts", json!({ "after": true })).unwrap();
    assert!(log.wait_for(1, Duration::from_secs(2)));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(log.events().len(), 1);
    assert_eq!(log.events()[0].0, "alerts");
}

#[test]
fn discovery_populates_keys() {
    let hub = MemoryHub::new();
    let b = builder_over(Arc::new(hub.transport("peer-B")), Some(Duration::from_millis(50)))
        .service("math.add", add)
        .build()
        .unwrap();
    let a = builder_over(Arc::new(hub.transport("peer-A")), Some(Duration::from_millis(50)))
        .build()
        .unwrap();
    let handle = a.start().unwrap();
    b.start().unwrap();

    assert!(handle
        .wait_for_key("peer-B", "math.add", Duration::from_secs(2))
        .unwrap());
    assert!(handle.peers_alive(Duration::from_secs(5)).contains_key("peer-B"));
    assert!(!handle.knows_key("peer-B", "perf.echo"));
}

#[test]
fn services_added_after_start_are_announced() {
    let hub = MemoryHub::new();
    let b = builder_over(Arc::new(hub.transport("peer-B")), Some(Duration::from_millis(50)))
        .build()
        .unwrap();
    let a = builder_over(Arc::new(hub.transport("peer-A")), Some(Duration::from_millis(50)))
        .build()
        .unwrap();
    let handle = a.start().unwrap();
    let b_handle = b.start().unwrap();

    b_handle.add_service("perf.echo", echo);
    assert!(handle
        .wait_for_key("peer-B", "perf.echo", Duration::from_secs(2))
        .unwrap());
    assert!(handle.rpc("peer-B", "perf.echo", json!({ "t0": 1 }), 2000).is_ok());

    assert!(b_handle.remove_service("perf.echo"));
    let reply = handle.rpc("peer-B", "perf.echo", json!({}), 2000).unwrap();
    assert_eq!(reply["ok"], json!(false));
}

#[test]
fn learned_keys_skip_discovery() {
    let hub = MemoryHub::new();
    let (a, _b) = start_pair(&hub);
    let handle = a.handle();

    assert!(!handle
        .wait_for_key("peer-B", "math.add", Duration::from_millis(100))
        .unwrap());
    handle.learn_peer_keys("peer-B", ["math.add"]);
    assert!(handle
        .wait_for_key("peer-B", "math.add", Duration::from_millis(100))
        .unwrap());
}

#[test]
fn misaddressed_envelopes_are_dropped() {
    let hub = MemoryHub::new();
    let (a, _b) = start_pair(&hub);
    let handle = a.handle();

    // A request naming peer-C as destination but delivered to peer-B.
    let rogue = hub.transport("peer-R");
    rogue.open().unwrap();
    let request = peerlink_runtime::Envelope::request("peer-R", "peer-C", "cid-1", "perf.echo", json!({}), 1000);
    rogue.send("peer-B", &request.encode().unwrap()).unwrap();
    assert!(rogue.recv_timeout(Duration::from_millis(200)).unwrap().is_none());

    // peer-B still serves well-addressed traffic.
    assert!(handle.rpc("peer-B", "perf.echo", json!({}), 2000).is_ok());
}

#[test]
fn garbage_bytes_do_not_stop_the_receive_loop() {
    let hub = MemoryHub::new();
    let (a, _b) = start_pair(&hub);

    let rogue = hub.transport("peer-R");
    rogue.open().unwrap();
    rogue.send("peer-B", b"not json at all").unwrap();
    rogue.send("peer-B", br#"{"type":"BOGUS","source":"peer-R"}"#).unwrap();

    assert!(a.handle().rpc("peer-B", "perf.echo", json!({}), 2000).is_ok());
}

#[test]
fn hello_hook_sees_new_peers() {
    use peerlink_runtime::{Hooks, RuntimeHandle};

    #[derive(Clone, Default)]
    struct Greeter(EventLog);
    impl Hooks for Greeter {
        fn on_hello(&self, _runtime: &RuntimeHandle, peer_id: &str) {
            (self.0.handler())("hello", &json!(peer_id));
        }
    }

    let hub = MemoryHub::new();
    let greeter = Greeter::default();
    let a = builder_over(Arc::new(hub.transport("peer-A")), Some(Duration::from_millis(50)))
        .hooks(greeter.clone())
        .build()
        .unwrap();
    let b = builder_over(Arc::new(hub.transport("peer-B")), Some(Duration::from_millis(50)))
        .build()
        .unwrap();
    a.start().unwrap();
    b.start().unwrap();

    assert!(greeter.0.wait_for(1, Duration::from_secs(2)));
    assert!(greeter
        .0
        .events()
        .iter()
        .all(|(_, peer)| peer == &json!("peer-B")));
}

#[test]
fn hello_can_be_sent_on_demand() {
    let hub = MemoryHub::new();
    let b = builder_over(Arc::new(hub.transport("peer-B")), None)
        .service("math.add", add)
        .build()
        .unwrap();
    let a = builder_over(Arc::new(hub.transport("peer-A")), None).build().unwrap();
    let handle = a.start().unwrap();
    let b_handle = b.start().unwrap();

    assert_eq!(b_handle.hello().unwrap(), 1);
    assert!(wait_until(Duration::from_secs(2), || handle.knows_key("peer-B", "math.add")));
}
