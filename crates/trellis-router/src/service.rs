//! The router responder: client registry, topology events, and the P2P
//! routing fabric.
//!
//! All record mutations and event fan-out are serialized under one mutex.
//! Deliveries happen outside it: P2P sends await on each recipient's
//! bounded queue (per-sender order is preserved because every client's
//! frames are dispatched from one task), while topology events use
//! `try_send` and drop slow subscribers instead of blocking the
//! broadcaster.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use trellis_core::{RegistryError, RequestStream, ServiceRegistry, Status, json};

use crate::messages::{
    ClientFilter, ClientInfo, OnlineClients, PingRequest, PingResponse, RegisterRequest,
    RegisterResponse, RouterMessage, RouterMessageKind, SubscribeRequest, TopologyEvent,
    TopologyEventKind, now_ms,
};

/// Service name the router registers under.
pub const SERVICE_NAME: &str = "trellis.Router";

/// Router tuning. Heartbeat cadence and the liveness timeout are both
/// deliberate configuration, never constants in the logic.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Cadence of router-originated heartbeats on each bound P2P stream,
    /// and of the staleness sweep.
    pub heartbeat_interval: Duration,
    /// A record with no heartbeat or P2P frame for this long is evicted.
    pub client_timeout: Duration,
    /// Bound of each topology subscriber's event queue.
    pub event_queue_depth: usize,
    /// Bound of each client's outbound P2P queue.
    pub p2p_queue_depth: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            heartbeat_interval: Duration::from_secs(20),
            client_timeout: Duration::from_secs(300),
            event_queue_depth: 64,
            p2p_queue_depth: 64,
        }
    }
}

struct ClientRecord {
    info: ClientInfo,
    last_seen: Instant,
    p2p: Option<mpsc::Sender<RouterMessage>>,
}

struct Subscriber {
    tx: mpsc::Sender<TopologyEvent>,
    overflow: Option<oneshot::Sender<Status>>,
}

struct PendingRequest {
    requester: String,
    target: String,
}

#[derive(Default)]
struct RouterState {
    clients: HashMap<String, ClientRecord>,
    subscribers: Vec<Subscriber>,
    /// `request_id → (requester, target)` for in-flight P2P requests.
    pending: HashMap<String, PendingRequest>,
}

/// Counters surfaced by the daemon's `--stats` loop.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub messages_routed: AtomicU64,
    pub events_emitted: AtomicU64,
    pub clients_evicted: AtomicU64,
    pub subscribers_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterMetricsSnapshot {
    pub clients_online: usize,
    pub messages_routed: u64,
    pub events_emitted: u64,
    pub clients_evicted: u64,
    pub subscribers_dropped: u64,
}

struct RouterInner {
    config: RouterConfig,
    state: Mutex<RouterState>,
    metrics: RouterMetrics,
}

/// The router service. Cheap to clone; all clones share the client table.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Router {
            inner: Arc::new(RouterInner {
                config,
                state: Mutex::new(RouterState::default()),
                metrics: RouterMetrics::default(),
            }),
        }
    }

    /// Build a router and spawn its staleness sweep.
    pub fn start(config: RouterConfig) -> Self {
        let router = Router::new(config);
        router.spawn_eviction_loop();
        router
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> RouterMetricsSnapshot {
        let m = &self.inner.metrics;
        RouterMetricsSnapshot {
            clients_online: self.inner.state.lock().clients.len(),
            messages_routed: m.messages_routed.load(Ordering::Relaxed),
            events_emitted: m.events_emitted.load(Ordering::Relaxed),
            clients_evicted: m.clients_evicted.load(Ordering::Relaxed),
            subscribers_dropped: m.subscribers_dropped.load(Ordering::Relaxed),
        }
    }

    /// The responder contract: five methods under [`SERVICE_NAME`].
    pub fn contract(&self) -> Result<ServiceRegistry, RegistryError> {
        let mut registry = ServiceRegistry::new();
        let mut svc = registry.service(SERVICE_NAME)?;

        let router = self.clone();
        svc.unary(
            "register",
            Arc::new(json::<RegisterRequest>()),
            Arc::new(json::<RegisterResponse>()),
            move |_ctx, req: RegisterRequest| {
                let router = router.clone();
                async move { router.register_client(req) }
            },
        )?;

        svc.unary(
            "ping",
            Arc::new(json::<PingRequest>()),
            Arc::new(json::<PingResponse>()),
            |_ctx, _req: PingRequest| async move {
                Ok(PingResponse {
                    server_time_ms: now_ms(),
                })
            },
        )?;

        let router = self.clone();
        svc.unary(
            "getOnlineClients",
            Arc::new(json::<ClientFilter>()),
            Arc::new(json::<OnlineClients>()),
            move |_ctx, filter: ClientFilter| {
                let router = router.clone();
                async move {
                    Ok(OnlineClients {
                        clients: router.online_clients(&filter),
                    })
                }
            },
        )?;

        let router = self.clone();
        svc.server_streaming(
            "subscribeToEvents",
            Arc::new(json::<SubscribeRequest>()),
            Arc::new(json::<TopologyEvent>()),
            move |_ctx, _req: SubscribeRequest| {
                let router = router.clone();
                async move { Ok(router.subscribe()) }
            },
        )?;

        let router = self.clone();
        svc.bidirectional(
            "p2p",
            Arc::new(json::<RouterMessage>()),
            Arc::new(json::<RouterMessage>()),
            move |_ctx, requests: RequestStream<RouterMessage>| {
                let router = router.clone();
                async move { router.open_p2p(requests).await }
            },
        )?;

        Ok(registry)
    }

    pub fn register_client(&self, req: RegisterRequest) -> Result<RegisterResponse, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("client name cannot be empty"));
        }

        let mut events = Vec::new();
        let client_id;
        {
            let mut state = self.inner.state.lock();
            match req.client_id.as_ref().filter(|id| state.clients.contains_key(*id)) {
                // Reconnect with an unexpired record: same id, no join
                // event, but metadata/group changes still fan out.
                Some(id) => {
                    client_id = id.clone();
                    let record = state.clients.get_mut(id).expect("checked above");
                    record.last_seen = Instant::now();
                    record.info.name = req.name;
                    if record.info.metadata != req.metadata {
                        record.info.metadata = req.metadata;
                        events.push(TopologyEvent::delta(
                            TopologyEventKind::ClientMetadataChanged,
                            record.info.clone(),
                        ));
                    }
                    if record.info.groups != req.groups {
                        record.info.groups = req.groups;
                        events.push(TopologyEvent::delta(
                            TopologyEventKind::ClientGroupsChanged,
                            record.info.clone(),
                        ));
                    }
                }
                None => {
                    client_id = Uuid::new_v4().to_string();
                    let info = ClientInfo {
                        id: client_id.clone(),
                        name: req.name,
                        groups: req.groups,
                        metadata: req.metadata,
                    };
                    state.clients.insert(
                        client_id.clone(),
                        ClientRecord {
                            info: info.clone(),
                            last_seen: Instant::now(),
                            p2p: None,
                        },
                    );
                    events.push(TopologyEvent::delta(TopologyEventKind::ClientJoined, info));
                }
            }
            for event in events.drain(..) {
                self.emit_locked(&mut state, event);
            }
        }

        tracing::debug!(client_id = %client_id, "client registered");
        Ok(RegisterResponse { client_id })
    }

    fn online_clients(&self, filter: &ClientFilter) -> Vec<ClientInfo> {
        let state = self.inner.state.lock();
        state
            .clients
            .values()
            .map(|r| &r.info)
            .filter(|info| filter.matches(info))
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.inner.config.event_queue_depth);
        let (overflow_tx, overflow_rx) = oneshot::channel();

        let mut state = self.inner.state.lock();
        let snapshot =
            TopologyEvent::snapshot(state.clients.values().map(|r| r.info.clone()).collect());
        // The queue is fresh and its depth is at least one, so the
        // snapshot always fits; deltas emitted after this point arrive in
        // order behind it.
        let _ = tx.try_send(snapshot);
        state.subscribers.push(Subscriber {
            tx,
            overflow: Some(overflow_tx),
        });

        EventStream {
            rx,
            overflow: Some(overflow_rx),
        }
    }

    /// Bind and drive one client's `p2p` stream.
    async fn open_p2p(
        &self,
        mut requests: RequestStream<RouterMessage>,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<RouterMessage, Status>> + Send>>, Status> {
        let first = match requests.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(status)) => return Err(status),
            None => {
                return Err(Status::failed_precondition(
                    "p2p stream closed before the identity heartbeat",
                ));
            }
        };

        if first.kind != RouterMessageKind::Heartbeat {
            return Err(Status::failed_precondition(
                "first p2p message must be a heartbeat carrying the registered client id",
            ));
        }
        let client_id = first.sender_id.clone();

        let (out_tx, out_rx) = mpsc::channel(self.inner.config.p2p_queue_depth);
        // Weak so the heartbeat task never outlives the binding: once
        // `disconnect` drops the record's sender the stream ends and the
        // upgrade fails.
        let heartbeat_sink = out_tx.downgrade();
        {
            let mut state = self.inner.state.lock();
            let Some(record) = state.clients.get_mut(&client_id) else {
                return Err(Status::failed_precondition(format!(
                    "unknown client id {client_id}; register first"
                )));
            };
            // A reconnect replaces the previous sink; the old stream ends.
            record.p2p = Some(out_tx);
            record.last_seen = Instant::now();
        }

        tracing::debug!(client_id = %client_id, "p2p stream bound");

        // Periodic router heartbeats so idle peers can detect a dead
        // fabric. Ends as soon as the client's stream goes away.
        let heartbeat_interval = self.inner.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(sink) = heartbeat_sink.upgrade() else {
                    return;
                };
                if sink
                    .send(RouterMessage::heartbeat(crate::messages::ROUTER_SENDER_ID))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        // Consume the rest of the request stream on its own task; the
        // response stream below lives independently.
        let router = self.clone();
        let id = client_id.clone();
        tokio::spawn(async move {
            while let Some(item) = requests.next().await {
                match item {
                    Ok(msg) => {
                        router.touch(&id);
                        router.dispatch(&id, msg).await;
                    }
                    Err(status) => {
                        tracing::debug!(client_id = %id, %status, "p2p request stream error");
                        break;
                    }
                }
            }
            router.disconnect(&id).await;
        });

        Ok(Box::pin(ReceiverStream::new(out_rx).map(Ok)))
    }

    fn touch(&self, client_id: &str) {
        let mut state = self.inner.state.lock();
        if let Some(record) = state.clients.get_mut(client_id) {
            record.last_seen = Instant::now();
        }
    }

    /// Route one message from a bound client.
    async fn dispatch(&self, sender_id: &str, msg: RouterMessage) {
        self.inner
            .metrics
            .messages_routed
            .fetch_add(1, Ordering::Relaxed);

        match msg.kind {
            RouterMessageKind::Heartbeat => {
                // Liveness only; `touch` already happened.
            }
            RouterMessageKind::Unicast => {
                let Some(target) = msg.target_id.clone() else {
                    return;
                };
                let sink = self.sink_of(&target);
                match sink {
                    Some(sink) => {
                        let _ = sink.send(msg).await;
                    }
                    // Plain unicast to a missing peer drops silently.
                    None => {
                        tracing::trace!(target = %target, "unicast target not found");
                    }
                }
            }
            RouterMessageKind::P2pRequest => {
                let Some(request_id) = msg.request_id.clone() else {
                    let reply = RouterMessage::response_to(&msg, ROUTER_ID, false, Default::default())
                        .with_error("invalid-argument: p2p-request without request id");
                    self.reply_to(sender_id, reply).await;
                    return;
                };
                let Some(target) = msg.target_id.clone() else {
                    let reply = RouterMessage::response_to(&msg, ROUTER_ID, false, Default::default())
                        .with_error("invalid-argument: p2p-request without target id");
                    self.reply_to(sender_id, reply).await;
                    return;
                };

                let sink = {
                    let mut state = self.inner.state.lock();
                    let sink = state.clients.get(&target).and_then(|r| r.p2p.clone());
                    if sink.is_some() {
                        state.pending.insert(
                            request_id.clone(),
                            PendingRequest {
                                requester: sender_id.to_string(),
                                target: target.clone(),
                            },
                        );
                    }
                    sink
                };

                match sink {
                    Some(sink) => {
                        if sink.send(msg).await.is_err() {
                            // Target died between lookup and delivery.
                            self.inner.state.lock().pending.remove(&request_id);
                            let reply = self.not_found_response(&request_id, &target);
                            self.reply_to(sender_id, reply).await;
                        }
                    }
                    None => {
                        let reply = self.not_found_response(&request_id, &target);
                        self.reply_to(sender_id, reply).await;
                    }
                }
            }
            RouterMessageKind::P2pResponse => {
                let Some(request_id) = msg.request_id.clone() else {
                    return;
                };
                let requester = {
                    let mut state = self.inner.state.lock();
                    match state.pending.remove(&request_id) {
                        Some(pending) => {
                            state.clients.get(&pending.requester).and_then(|r| r.p2p.clone())
                        }
                        // Unknown request id: dropped.
                        None => None,
                    }
                };
                if let Some(sink) = requester {
                    let _ = sink.send(msg).await;
                }
            }
            RouterMessageKind::Multicast => {
                let groups: HashSet<String> =
                    msg.target_groups.clone().unwrap_or_default().into_iter().collect();
                let sinks = {
                    let state = self.inner.state.lock();
                    let mut seen = HashSet::new();
                    state
                        .clients
                        .values()
                        .filter(|r| r.info.id != sender_id)
                        .filter(|r| r.info.groups.iter().any(|g| groups.contains(g)))
                        .filter(|r| seen.insert(r.info.id.clone()))
                        .filter_map(|r| r.p2p.clone())
                        .collect::<Vec<_>>()
                };
                for sink in sinks {
                    let _ = sink.send(msg.clone()).await;
                }
            }
            RouterMessageKind::Broadcast => {
                let sinks = {
                    let state = self.inner.state.lock();
                    state
                        .clients
                        .values()
                        .filter(|r| r.info.id != sender_id)
                        .filter_map(|r| r.p2p.clone())
                        .collect::<Vec<_>>()
                };
                for sink in sinks {
                    let _ = sink.send(msg.clone()).await;
                }
            }
            RouterMessageKind::TopologyEvent => {
                // Router-originated only; clients cannot inject these.
                tracing::trace!(sender = %sender_id, "dropping client topology event");
            }
        }
    }

    fn not_found_response(&self, request_id: &str, target: &str) -> RouterMessage {
        let mut reply = RouterMessage::heartbeat(ROUTER_ID);
        reply.kind = RouterMessageKind::P2pResponse;
        reply.request_id = Some(request_id.to_string());
        reply.success = Some(false);
        reply.error = Some(format!("not-found: no online client with id {target}"));
        reply
    }

    async fn reply_to(&self, client_id: &str, msg: RouterMessage) {
        let sink = self.sink_of(client_id);
        if let Some(sink) = sink {
            let _ = sink.send(msg).await;
        }
    }

    fn sink_of(&self, client_id: &str) -> Option<mpsc::Sender<RouterMessage>> {
        let state = self.inner.state.lock();
        state.clients.get(client_id).and_then(|r| r.p2p.clone())
    }

    /// Remove a client: its sink closes, watchers hear `client-left`, and
    /// requests waiting on it get a synthesized not-found response.
    pub async fn disconnect(&self, client_id: &str) {
        let (info, orphaned) = {
            let mut state = self.inner.state.lock();
            let Some(record) = state.clients.remove(client_id) else {
                return;
            };
            let orphaned: Vec<(String, mpsc::Sender<RouterMessage>, String)> = {
                let ids: Vec<String> = state
                    .pending
                    .iter()
                    .filter(|(_, p)| p.target == client_id)
                    .map(|(rid, _)| rid.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|rid| {
                        let pending = state.pending.remove(&rid)?;
                        let sink = state
                            .clients
                            .get(&pending.requester)
                            .and_then(|r| r.p2p.clone())?;
                        Some((rid, sink, pending.target))
                    })
                    .collect()
            };
            self.emit_locked(
                &mut state,
                TopologyEvent::delta(TopologyEventKind::ClientLeft, record.info.clone()),
            );
            (record.info, orphaned)
        };

        for (rid, sink, target) in orphaned {
            let _ = sink.send(self.not_found_response(&rid, &target)).await;
        }
        tracing::debug!(client_id = %info.id, name = %info.name, "client disconnected");
    }

    /// Fan one event out to every subscriber; slow ones are dropped with
    /// `resource-exhausted` rather than blocking.
    fn emit_locked(&self, state: &mut RouterState, event: TopologyEvent) {
        self.inner
            .metrics
            .events_emitted
            .fetch_add(1, Ordering::Relaxed);
        let metrics = &self.inner.metrics;
        state.subscribers.retain_mut(|sub| {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if let Some(overflow) = sub.overflow.take() {
                        let _ = overflow.send(Status::resource_exhausted(
                            "topology event queue overflow",
                        ));
                    }
                    metrics.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Periodic staleness sweep; period follows the heartbeat interval.
    pub fn spawn_eviction_loop(&self) {
        let router = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(router.inner.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                router.evict_stale().await;
            }
        });
    }

    async fn evict_stale(&self) {
        let timeout = self.inner.config.client_timeout;
        let stale: Vec<String> = {
            let state = self.inner.state.lock();
            state
                .clients
                .iter()
                .filter(|(_, r)| r.last_seen.elapsed() > timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in stale {
            tracing::info!(client_id = %id, "evicting stale client");
            self.inner
                .metrics
                .clients_evicted
                .fetch_add(1, Ordering::Relaxed);
            self.disconnect(&id).await;
        }
    }
}

/// Router-synthesized messages use the router's sender id.
const ROUTER_ID: &str = crate::messages::ROUTER_SENDER_ID;

/// Topology event stream handed to the server-streaming driver. Ends
/// cleanly when the router drops the subscriber, except on overflow where
/// it terminates with `resource-exhausted`.
struct EventStream {
    rx: mpsc::Receiver<TopologyEvent>,
    overflow: Option<oneshot::Receiver<Status>>,
}

impl Stream for EventStream {
    type Item = Result<TopologyEvent, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                let Some(mut overflow) = this.overflow.take() else {
                    return Poll::Ready(None);
                };
                match Pin::new(&mut overflow).poll(cx) {
                    Poll::Ready(Ok(status)) => Poll::Ready(Some(Err(status))),
                    // Dropped without a status: clean unsubscribe.
                    Poll::Ready(Err(_)) => Poll::Ready(None),
                    Poll::Pending => {
                        this.overflow = Some(overflow);
                        Poll::Pending
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(router: &Router, name: &str, groups: &[&str]) -> String {
        router
            .register_client(RegisterRequest {
                client_id: None,
                name: name.into(),
                groups: groups.iter().map(|s| s.to_string()).collect(),
                metadata: HashMap::new(),
            })
            .unwrap()
            .client_id
    }

    #[tokio::test]
    async fn register_allocates_uuid_shaped_ids() {
        let router = Router::new(RouterConfig::default());
        let id = register(&router, "alpha", &[]);
        assert_eq!(Uuid::parse_str(&id).unwrap().get_version_num(), 4);
    }

    #[tokio::test]
    async fn reregister_with_live_id_is_idempotent() {
        let router = Router::new(RouterConfig::default());
        let id = register(&router, "alpha", &[]);

        let again = router
            .register_client(RegisterRequest {
                client_id: Some(id.clone()),
                name: "alpha".into(),
                groups: Vec::new(),
                metadata: HashMap::new(),
            })
            .unwrap();
        assert_eq!(again.client_id, id);
        assert_eq!(router.metrics().clients_online, 1);
    }

    #[tokio::test]
    async fn reregister_with_expired_id_gets_a_fresh_one() {
        let router = Router::new(RouterConfig::default());
        let resp = router
            .register_client(RegisterRequest {
                client_id: Some("stale-id".into()),
                name: "alpha".into(),
                groups: Vec::new(),
                metadata: HashMap::new(),
            })
            .unwrap();
        assert_ne!(resp.client_id, "stale-id");
    }

    #[tokio::test]
    async fn online_clients_filtering() {
        let router = Router::new(RouterConfig::default());
        register(&router, "a", &["g1"]);
        register(&router, "b", &["g2"]);

        let all = router.online_clients(&ClientFilter::default());
        assert_eq!(all.len(), 2);

        let only_g1 = router.online_clients(&ClientFilter {
            groups: vec!["g1".into()],
            ..Default::default()
        });
        assert_eq!(only_g1.len(), 1);
        assert_eq!(only_g1[0].name, "a");
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let router = Router::new(RouterConfig::default());
        let err = router
            .register_client(RegisterRequest::default())
            .unwrap_err();
        assert_eq!(err.code(), trellis_core::StatusCode::InvalidArgument);
    }
}
