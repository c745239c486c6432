use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use peerlink_transport::TransportError;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::discovery;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{PeerError, Result};
use crate::hooks::{EventHandler, Hooks, NoHooks, RequestHandler};
use crate::link::{transport_for, Inbound, Incoming, Transport};
use crate::pool::{Rejected, WorkerPool};
use crate::pubsub::PubSubRouter;
use crate::registry::CapabilityRegistry;
use crate::rpc::{self, RpcEngine, DEFAULT_TTL_MS};
use crate::signal::StopSignal;

/// Interval at which `wait_for_key` / `wait_for_peer` re-check the registry.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runtime lifecycle.
///
/// `Created → Starting → Running → Stopping → Stopped`; stopping a runtime
/// that never started goes straight to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    peer_id: String,
    config: RuntimeConfig,
    transport: Arc<dyn Transport>,
    hooks: Arc<dyn Hooks>,
    state: Mutex<LifecycleState>,
    registry: CapabilityRegistry,
    router: PubSubRouter,
    rpc: RpcEngine,
    requests: Mutex<Option<WorkerPool>>,
    events: Mutex<Option<WorkerPool>>,
    /// Set once `stop` begins.
    stopping: StopSignal,
    /// Set by `request_stop`; `run_until_stopped` waits on it.
    stop_requested: StopSignal,
}

/// Builder for [`PeerRuntime`].
pub struct PeerRuntimeBuilder {
    config: RuntimeConfig,
    transport: Option<Arc<dyn Transport>>,
    hooks: Arc<dyn Hooks>,
    services: Vec<(String, Arc<dyn RequestHandler>)>,
    subscriptions: Vec<(String, Arc<dyn EventHandler>)>,
}

impl PeerRuntimeBuilder {
    /// Use this transport instead of building one from the config.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn hooks(mut self, hooks: impl Hooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Serve `key` with `handler` from the start.
    pub fn service(mut self, key: &str, handler: impl RequestHandler + 'static) -> Self {
        self.services.push((key.to_string(), Arc::new(handler)));
        self
    }

    /// Subscribe `handler` to `topic` from the start.
    pub fn subscribe(mut self, topic: &str, handler: impl EventHandler + 'static) -> Self {
        self.subscriptions.push((topic.to_string(), Arc::new(handler)));
        self
    }

    pub fn build(self) -> Result<PeerRuntime> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => {
                if transport.local_id() != self.config.peer_id {
                    return Err(PeerError::Config(format!(
                        "transport identity '{}' does not match peer_id '{}'",
                        transport.local_id(),
                        self.config.peer_id
                    )));
                }
                transport
            }
            None => transport_for(&self.config)?,
        };

        let inner = Inner {
            peer_id: self.config.peer_id.clone(),
            rpc: RpcEngine::new(&self.config.peer_id),
            config: self.config,
            transport,
            hooks: self.hooks,
            state: Mutex::new(LifecycleState::Created),
            registry: CapabilityRegistry::new(),
            router: PubSubRouter::new(),
            requests: Mutex::new(None),
            events: Mutex::new(None),
            stopping: StopSignal::new(),
            stop_requested: StopSignal::new(),
        };
        for (key, handler) in self.services {
            inner.registry.register_local(&key, handler);
        }
        for (topic, handler) in self.subscriptions {
            inner.router.subscribe(&topic, handler);
        }

        Ok(PeerRuntime {
            inner: Arc::new(inner),
            threads: Mutex::new(Vec::new()),
        })
    }
}

/// A peer: transport, discovery, RPC and pub/sub wired together.
///
/// Owns the background threads. Call [`PeerRuntime::start`], hand the
/// returned [`RuntimeHandle`] to application code, and [`PeerRuntime::stop`]
/// (or drop) when done.
pub struct PeerRuntime {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerRuntime {
    pub fn builder(config: RuntimeConfig) -> PeerRuntimeBuilder {
        PeerRuntimeBuilder {
            config,
            transport: None,
            hooks: Arc::new(NoHooks),
            services: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock()
    }

    /// Open the transport and start the receive loop, worker pools and
    /// discovery. Fails unless the runtime is freshly created.
    pub fn start(&self) -> Result<RuntimeHandle> {
        {
            let mut state = self.inner.state.lock();
            if *state != LifecycleState::Created {
                return Err(PeerError::InvalidState {
                    expected: LifecycleState::Created.as_str(),
                    actual: state.as_str(),
                });
            }
            *state = LifecycleState::Starting;
        }

        if let Err(err) = self.launch() {
            error!(peer_id = %self.inner.peer_id, error = %err, "runtime failed to start");
            self.inner.stopping.trigger();
            self.inner.transport.close();
            self.shutdown_pools();
            self.join_threads();
            *self.inner.state.lock() = LifecycleState::Stopped;
            return Err(err);
        }

        let handle = self.handle();
        if catch_unwind(AssertUnwindSafe(|| self.inner.hooks.on_start(&handle))).is_err() {
            error!(peer_id = %self.inner.peer_id, "on_start hook panicked");
        }

        {
            let mut state = self.inner.state.lock();
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Running;
            }
        }
        info!(
            peer_id = %self.inner.peer_id,
            transport = self.inner.transport.name(),
            keys = ?self.inner.registry.local_keys(),
            topics = ?self.inner.router.topics(),
            "peer runtime running"
        );
        Ok(handle)
    }

    fn launch(&self) -> Result<()> {
        let inner = &self.inner;
        info!(peer_id = %inner.peer_id, transport = inner.transport.name(), "starting peer runtime");
        inner.transport.open()?;

        let requests = WorkerPool::new(
            "peerlink-req",
            inner.config.request_workers,
            inner.config.request_queue,
        )
        .map_err(TransportError::Io)?;
        *inner.requests.lock() = Some(requests);
        let events = WorkerPool::new("peerlink-evt", 1, inner.config.event_queue)
            .map_err(TransportError::Io)?;
        *inner.events.lock() = Some(events);

        let recv_inner = Arc::clone(inner);
        let receiver = thread::Builder::new()
            .name("peerlink-recv".to_string())
            .spawn(move || receive_loop(recv_inner))
            .map_err(TransportError::Io)?;
        self.threads.lock().push(receiver);

        if inner.config.discovery_enabled {
            let disc_inner = Arc::clone(inner);
            let timer = thread::Builder::new()
                .name("peerlink-discovery".to_string())
                .spawn(move || {
                    let config = &disc_inner.config;
                    discovery::run_timer(
                        config.discovery_interval,
                        config.hello_on_start,
                        &disc_inner.stopping,
                        || {
                            if let Err(err) = discovery::announce(
                                &*disc_inner.transport,
                                &disc_inner.registry,
                                &disc_inner.router,
                            ) {
                                debug!(error = %err, "HELLO broadcast failed");
                            }
                        },
                    )
                })
                .map_err(TransportError::Io)?;
            self.threads.lock().push(timer);
        }
        Ok(())
    }

    /// Stop: cancel the discovery timer, close the transport, fail every
    /// pending request with `Cancelled`, run `on_stop`. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            match *state {
                LifecycleState::Created => {
                    *state = LifecycleState::Stopped;
                    self.inner.stopping.trigger();
                    self.inner.stop_requested.trigger();
                    return;
                }
                LifecycleState::Starting | LifecycleState::Running => {
                    *state = LifecycleState::Stopping;
                }
                LifecycleState::Stopping | LifecycleState::Stopped => return,
            }
        }
        info!(peer_id = %self.inner.peer_id, "stopping peer runtime");

        self.inner.stopping.trigger();
        self.inner.stop_requested.trigger();
        self.inner.transport.close();
        let cancelled = self.inner.rpc.cancel_all();
        self.join_threads();
        self.shutdown_pools();

        if catch_unwind(AssertUnwindSafe(|| self.inner.hooks.on_stop())).is_err() {
            error!(peer_id = %self.inner.peer_id, "on_stop hook panicked");
        }

        *self.inner.state.lock() = LifecycleState::Stopped;
        info!(peer_id = %self.inner.peer_id, cancelled, "peer runtime stopped");
    }

    /// Block until [`RuntimeHandle::request_stop`] or [`PeerRuntime::stop`]
    /// is called, then stop.
    pub fn run_until_stopped(&self) {
        self.inner.stop_requested.wait();
        self.stop();
    }

    fn join_threads(&self) {
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!(peer_id = %self.inner.peer_id, "runtime thread panicked");
            }
        }
    }

    fn shutdown_pools(&self) {
        // Handlers may still be running; they finish on their own threads.
        if let Some(mut pool) = self.inner.requests.lock().take() {
            pool.shutdown(false);
        }
        if let Some(mut pool) = self.inner.events.lock().take() {
            pool.shutdown(false);
        }
    }
}

impl Drop for PeerRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable handle for application threads and hooks.
#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("peer_id", &self.inner.peer_id)
            .field("state", &self.state())
            .finish()
    }
}

impl RuntimeHandle {
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock()
    }

    /// Name of the transport family in use.
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Starting | LifecycleState::Running => Ok(()),
            LifecycleState::Stopping | LifecycleState::Stopped => Err(PeerError::Cancelled),
            LifecycleState::Created => Err(PeerError::InvalidState {
                expected: LifecycleState::Running.as_str(),
                actual: LifecycleState::Created.as_str(),
            }),
        }
    }

    /// Call `key` on `dest` and block until the response, the TTL, or stop.
    ///
    /// Application-level failures arrive as `Ok` payloads with `"ok": false`.
    pub fn rpc(&self, dest: &str, key: &str, payload: Value, ttl_ms: u64) -> Result<Value> {
        self.ensure_active()?;
        self.inner.rpc.call(
            &*self.inner.transport,
            || self.inner.stopping.is_set(),
            dest,
            key,
            payload,
            ttl_ms,
        )
    }

    /// [`rpc`](Self::rpc) with the default TTL.
    pub fn rpc_default(&self, dest: &str, key: &str, payload: Value) -> Result<Value> {
        self.rpc(dest, key, payload, DEFAULT_TTL_MS)
    }

    /// Broadcast an event and deliver it to local subscribers.
    ///
    /// Returns true when a local subscriber exists or a remote peer has
    /// advertised the topic. Delivery itself is best-effort.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<bool> {
        self.ensure_active()?;
        let envelope = Envelope::publish(&self.inner.peer_id, topic, payload.clone());
        let reached = self.inner.transport.broadcast(&envelope.encode()?)?;

        let local = self.inner.router.is_subscribed(topic);
        if local {
            deliver_event(&self.inner, topic.to_string(), payload);
        }
        let remote = self.inner.registry.remote_subscribers(topic);
        debug!(%topic, local, remote = remote.len(), reached, "published");
        Ok(local || !remote.is_empty())
    }

    /// Tell the transport how to reach `peer_id`.
    ///
    /// Peer-to-peer transports add or replace the address-book entry;
    /// brokered and in-memory transports route by id and ignore it.
    pub fn connect(&self, peer_id: &str, address: &str) -> Result<()> {
        self.inner.transport.connect(peer_id, address)
    }

    /// Record that `peer_id` serves `keys` without waiting for its HELLO.
    pub fn learn_peer_keys<I, S>(&self, peer_id: &str, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .registry
            .record_remote(peer_id, keys.into_iter().map(Into::into));
    }

    pub fn knows_key(&self, peer_id: &str, key: &str) -> bool {
        self.inner.registry.has_key(peer_id, key)
    }

    /// Keys known for `peer_id`.
    pub fn known_keys(&self, peer_id: &str) -> Vec<String> {
        self.inner.registry.known_keys(peer_id).into_iter().collect()
    }

    /// Topics `peer_id` advertised in its last HELLO.
    pub fn known_topics(&self, peer_id: &str) -> Vec<String> {
        self.inner
            .registry
            .peers()
            .remove(peer_id)
            .map(|record| record.topics.into_iter().collect())
            .unwrap_or_default()
    }

    /// Poll until `peer_id` is known to serve `key`.
    ///
    /// `Ok(false)` on timeout; `Err(Cancelled)` if the runtime stops first.
    pub fn wait_for_key(&self, peer_id: &str, key: &str, timeout: Duration) -> Result<bool> {
        self.wait_until(timeout, || self.knows_key(peer_id, key))
    }

    /// Poll until any HELLO or learned key for `peer_id` has been recorded.
    pub fn wait_for_peer(&self, peer_id: &str, timeout: Duration) -> Result<bool> {
        self.wait_until(timeout, || self.inner.registry.peers().contains_key(peer_id))
    }

    /// A timeout too large to represent as an instant waits without deadline.
    fn wait_until(&self, timeout: Duration, ready: impl Fn() -> bool) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if ready() {
                return Ok(true);
            }
            let now = Instant::now();
            let nap = match deadline {
                Some(deadline) if now >= deadline => return Ok(false),
                Some(deadline) => WAIT_POLL_INTERVAL.min(deadline - now),
                None => WAIT_POLL_INTERVAL,
            };
            if self.inner.stopping.wait_timeout(nap) {
                return Err(PeerError::Cancelled);
            }
        }
    }

    /// Peers seen within `window` and how long ago.
    pub fn peers_alive(&self, window: Duration) -> BTreeMap<String, Duration> {
        self.inner.registry.peers_alive(window)
    }

    /// Serve a new key. Announced with the next HELLO.
    pub fn add_service(&self, key: &str, handler: impl RequestHandler + 'static) {
        self.inner.registry.register_local(key, Arc::new(handler));
    }

    pub fn remove_service(&self, key: &str) -> bool {
        self.inner.registry.unregister_local(key)
    }

    pub fn services(&self) -> Vec<String> {
        self.inner.registry.local_keys()
    }

    pub fn subscribe(&self, topic: &str, handler: impl EventHandler + 'static) {
        self.inner.router.subscribe(topic, Arc::new(handler));
    }

    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.inner.router.unsubscribe(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.router.topics()
    }

    /// Broadcast a HELLO now. Returns how many links it was handed to.
    pub fn hello(&self) -> Result<usize> {
        self.ensure_active()?;
        discovery::announce(
            &*self.inner.transport,
            &self.inner.registry,
            &self.inner.router,
        )
    }

    /// Ask the owner blocked in [`PeerRuntime::run_until_stopped`] to stop.
    pub fn request_stop(&self) {
        self.inner.stop_requested.trigger();
    }
}

fn receive_loop(inner: Arc<Inner>) {
    debug!(peer_id = %inner.peer_id, "receive loop started");
    for inbound in Incoming::new(&*inner.transport, RECV_POLL_INTERVAL) {
        dispatch(&inner, inbound);
    }
    debug!(peer_id = %inner.peer_id, "receive loop stopped");
}

fn dispatch(inner: &Arc<Inner>, inbound: Inbound) {
    let envelope = match Envelope::decode(&inbound.bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(from = %inbound.source, error = %err, "dropping undecodable envelope");
            return;
        }
    };

    if let Some(dest) = envelope.dest.as_deref() {
        if dest != inner.peer_id {
            warn!(
                kind = %envelope.kind,
                %dest,
                from = %envelope.source,
                "dropping envelope addressed to another peer"
            );
            return;
        }
    }

    match envelope.kind {
        EnvelopeKind::Hello => on_hello(inner, &envelope),
        EnvelopeKind::Req => on_request(inner, envelope),
        EnvelopeKind::Ack => inner.rpc.on_ack(&envelope),
        EnvelopeKind::Resp => inner.rpc.on_response(&envelope),
        EnvelopeKind::Pub => {
            let Some(topic) = envelope.key.clone() else {
                return;
            };
            if inner.router.is_subscribed(&topic) {
                deliver_event(inner, topic, envelope.payload.unwrap_or(Value::Null));
            }
        }
    }
}

fn on_hello(inner: &Arc<Inner>, hello: &Envelope) {
    if hello.source == inner.peer_id {
        return;
    }
    discovery::absorb_hello(&inner.registry, hello);

    let hook_inner = Arc::clone(inner);
    let peer = hello.source.clone();
    enqueue_event_job(inner, move || {
        let handle = RuntimeHandle {
            inner: Arc::clone(&hook_inner),
        };
        hook_inner.hooks.on_hello(&handle, &peer);
    });
}

fn on_request(inner: &Arc<Inner>, request: Envelope) {
    let key = request.key.clone().unwrap_or_default();
    let Some(handler) = inner.registry.handler(&key) else {
        debug!(%key, from = %request.source, "request for unknown key");
        rpc::reject_unknown_key(&*inner.transport, &inner.peer_id, &request);
        return;
    };

    let job_inner = Arc::clone(inner);
    let job_request = request.clone();
    let submitted = match inner.requests.lock().as_ref() {
        Some(pool) => pool.try_execute(move || {
            rpc::serve_request(
                &*job_inner.transport,
                &job_inner.peer_id,
                &*handler,
                &job_request,
            )
        }),
        None => Err(Rejected::Closed),
    };

    if let Err(reason) = submitted {
        warn!(%key, from = %request.source, %reason, "request rejected");
        rpc::reject_busy(&*inner.transport, &inner.peer_id, &request);
    }
}

fn deliver_event(inner: &Arc<Inner>, topic: String, payload: Value) {
    let event_inner = Arc::clone(inner);
    enqueue_event_job(inner, move || {
        for handler in event_inner.router.handlers(&topic) {
            if catch_unwind(AssertUnwindSafe(|| handler.on_event(&topic, &payload))).is_err() {
                error!(%topic, "event handler panicked");
            }
        }
        event_inner.hooks.on_event(&topic, &payload);
    });
}

fn enqueue_event_job(inner: &Inner, job: impl FnOnce() + Send + 'static) {
    let submitted = match inner.events.lock().as_ref() {
        Some(pool) => pool.try_execute(job),
        None => Err(Rejected::Closed),
    };
    if let Err(reason) = submitted {
        warn!(peer_id = %inner.peer_id, %reason, "event dropped");
    }
}
