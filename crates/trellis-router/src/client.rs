//! Caller-side handle for the router contract.
//!
//! Wraps a [`ClientEndpoint`] with typed calls for registration, liveness,
//! discovery, topology subscriptions, and a P2P connection that correlates
//! requests with responses and pumps heartbeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use trellis_core::{
    CallOptions, ClientEndpoint, RequestSink, ResponseStream, RpcError, Status, StatusCode, json,
};

use crate::messages::{
    ClientFilter, ClientInfo, OnlineClients, PingRequest, PingResponse, RegisterRequest,
    RegisterResponse, RouterMessage, RouterMessageKind, SubscribeRequest, TopologyEvent,
};
use crate::service::SERVICE_NAME;

/// How this client introduces itself to the router.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Previously assigned id, to resume an unexpired record.
    pub client_id: Option<String>,
    pub name: String,
    pub groups: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl RegisterOptions {
    pub fn named(name: impl Into<String>) -> Self {
        RegisterOptions {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outcome of a [`RouterHandle::ping`].
#[derive(Debug, Clone, Copy)]
pub struct RouterPing {
    pub server_time_ms: i64,
    pub round_trip: Duration,
}

/// A registered client's view of the router.
pub struct RouterHandle {
    endpoint: ClientEndpoint,
    client_id: String,
}

impl RouterHandle {
    /// Register (or resume) and return a bound handle.
    pub async fn register(
        endpoint: ClientEndpoint,
        opts: RegisterOptions,
    ) -> Result<Self, RpcError> {
        let response: RegisterResponse = endpoint
            .unary(
                SERVICE_NAME,
                "register",
                Arc::new(json::<RegisterRequest>()),
                Arc::new(json::<RegisterResponse>()),
                &RegisterRequest {
                    client_id: opts.client_id,
                    name: opts.name,
                    groups: opts.groups,
                    metadata: opts.metadata,
                },
                CallOptions::default(),
            )
            .await?;

        Ok(RouterHandle {
            endpoint,
            client_id: response.client_id,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> &ClientEndpoint {
        &self.endpoint
    }

    /// Round-trip to the router; returns its clock and the observed
    /// latency.
    pub async fn ping(&self) -> Result<RouterPing, RpcError> {
        let started = Instant::now();
        let response: PingResponse = self
            .endpoint
            .unary(
                SERVICE_NAME,
                "ping",
                Arc::new(json::<PingRequest>()),
                Arc::new(json::<PingResponse>()),
                &PingRequest {},
                CallOptions::default(),
            )
            .await?;
        Ok(RouterPing {
            server_time_ms: response.server_time_ms,
            round_trip: started.elapsed(),
        })
    }

    /// Snapshot of currently registered clients matching `filter`.
    pub async fn online_clients(&self, filter: ClientFilter) -> Result<Vec<ClientInfo>, RpcError> {
        let response: OnlineClients = self
            .endpoint
            .unary(
                SERVICE_NAME,
                "getOnlineClients",
                Arc::new(json::<ClientFilter>()),
                Arc::new(json::<OnlineClients>()),
                &filter,
                CallOptions::default(),
            )
            .await?;
        Ok(response.clients)
    }

    /// Topology event feed: one snapshot, then deltas.
    pub async fn subscribe_events(&self) -> Result<ResponseStream<TopologyEvent>, RpcError> {
        self.endpoint
            .server_streaming(
                SERVICE_NAME,
                "subscribeToEvents",
                Arc::new(json::<SubscribeRequest>()),
                Arc::new(json::<TopologyEvent>()),
                &SubscribeRequest {},
                CallOptions::default(),
            )
            .await
    }

    /// Open the P2P fabric: binds the stream with an identity heartbeat
    /// and starts the reader and heartbeat pumps.
    pub async fn open_p2p(&self, options: P2pOptions) -> Result<P2pConnection, RpcError> {
        let (sink, responses) = self
            .endpoint
            .duplex(
                SERVICE_NAME,
                "p2p",
                Arc::new(json::<RouterMessage>()),
                Arc::new(json::<RouterMessage>()),
                CallOptions::default(),
            )
            .await?;

        let mut sink = sink;
        sink.send(&RouterMessage::heartbeat(self.client_id.clone()))
            .await?;

        let shared = Arc::new(P2pShared {
            client_id: self.client_id.clone(),
            sink: tokio::sync::Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
        });

        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_queue_depth);

        // Reader: correlates p2p responses, swallows router heartbeats,
        // and forwards everything else to the application.
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let mut responses = responses;
            while let Some(item) = responses.next().await {
                match item {
                    Ok(msg) => match msg.kind {
                        RouterMessageKind::P2pResponse => {
                            let slot = msg
                                .request_id
                                .as_ref()
                                .and_then(|rid| reader_shared.pending.lock().remove(rid));
                            match slot {
                                Some(slot) => {
                                    let _ = slot.send(msg);
                                }
                                None => {
                                    tracing::trace!("dropping response with unknown request id");
                                }
                            }
                        }
                        RouterMessageKind::Heartbeat => {
                            // Router liveness beacon; nothing to do.
                        }
                        _ => {
                            if inbound_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                    },
                    Err(e) => {
                        tracing::debug!(error = %e, "p2p stream ended");
                        break;
                    }
                }
            }
            // Dropping inbound_tx wakes the application's receive loop,
            // and clearing pending resolves in-flight requests with
            // `unavailable` through their dropped slots.
            reader_shared.pending.lock().clear();
        });

        // Client heartbeats keep the record alive.
        let heartbeat_shared = Arc::downgrade(&shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(shared) = heartbeat_shared.upgrade() else {
                    return;
                };
                let beat = RouterMessage::heartbeat(shared.client_id.clone());
                if shared.sink.lock().await.send(&beat).await.is_err() {
                    return;
                }
            }
        });

        Ok(P2pConnection {
            shared,
            inbound: inbound_rx,
            request_timeout: options.request_timeout,
        })
    }
}

/// P2P connection tuning.
#[derive(Debug, Clone)]
pub struct P2pOptions {
    /// Cadence of client-originated heartbeats.
    pub heartbeat_interval: Duration,
    /// Default deadline for [`P2pConnection::request`].
    pub request_timeout: Duration,
    /// Bound of the application-facing delivery queue.
    pub inbound_queue_depth: usize,
}

impl Default for P2pOptions {
    fn default() -> Self {
        P2pOptions {
            heartbeat_interval: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            inbound_queue_depth: 64,
        }
    }
}

struct P2pShared {
    client_id: String,
    sink: tokio::sync::Mutex<RequestSink<RouterMessage>>,
    pending: Mutex<HashMap<String, oneshot::Sender<RouterMessage>>>,
}

/// A bound P2P stream: outbound sends plus the inbound delivery queue.
pub struct P2pConnection {
    shared: Arc<P2pShared>,
    inbound: mpsc::Receiver<RouterMessage>,
    request_timeout: Duration,
}

impl P2pConnection {
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Next delivered message: unicast/broadcast/multicast payloads and
    /// inbound p2p requests. `None` once the stream is gone.
    pub async fn next_message(&mut self) -> Option<RouterMessage> {
        self.inbound.recv().await
    }

    /// Fire-and-forget unicast.
    pub async fn unicast(
        &self,
        target: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), RpcError> {
        let msg = RouterMessage::unicast(self.shared.client_id.clone(), target, payload);
        self.shared.sink.lock().await.send(&msg).await
    }

    /// Deliver to every member of the named groups, except this client.
    pub async fn multicast(
        &self,
        groups: Vec<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), RpcError> {
        let msg = RouterMessage::multicast(self.shared.client_id.clone(), groups, payload);
        self.shared.sink.lock().await.send(&msg).await
    }

    /// Deliver to every other connected client.
    pub async fn broadcast(
        &self,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), RpcError> {
        let msg = RouterMessage::broadcast(self.shared.client_id.clone(), payload);
        self.shared.sink.lock().await.send(&msg).await
    }

    /// Correlated request/response. Resolves with the peer's (or the
    /// router's synthesized) response, or `deadline-exceeded`.
    pub async fn request(
        &self,
        target: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<RouterMessage, RpcError> {
        let request_id = Uuid::new_v4().to_string();
        let (slot_tx, slot_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .insert(request_id.clone(), slot_tx);

        let msg = RouterMessage::request(
            self.shared.client_id.clone(),
            target,
            request_id.clone(),
            payload,
        );
        if let Err(e) = self.shared.sink.lock().await.send(&msg).await {
            self.shared.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, slot_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RpcError::Status(Status::unavailable(
                "p2p stream closed while awaiting response",
            ))),
            Err(_) => {
                self.shared.pending.lock().remove(&request_id);
                Err(RpcError::status(
                    StatusCode::DeadlineExceeded,
                    format!("p2p request {request_id} timed out"),
                ))
            }
        }
    }

    /// Answer an inbound p2p request.
    pub async fn respond(
        &self,
        request: &RouterMessage,
        success: bool,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), RpcError> {
        let msg =
            RouterMessage::response_to(request, self.shared.client_id.clone(), success, payload);
        self.shared.sink.lock().await.send(&msg).await
    }

    /// End this client's participation in the fabric.
    pub async fn close(mut self) -> Result<(), RpcError> {
        self.inbound.close();
        self.shared.sink.lock().await.finish().await
    }
}
