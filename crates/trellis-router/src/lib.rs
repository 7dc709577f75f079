//! Federated client router for trellis RPC.
//!
//! A long-lived responder that lets many clients discover each other,
//! exchange correlated P2P request/response messages, fan out unicast,
//! multicast, and broadcast payloads, and subscribe to topology events.
//! Built entirely on the four call shapes of `trellis-core`.

mod client;
mod messages;
mod service;

pub use client::{P2pConnection, P2pOptions, RegisterOptions, RouterHandle, RouterPing};
pub use messages::{
    ClientFilter, ClientInfo, OnlineClients, PingRequest, PingResponse, ROUTER_SENDER_ID,
    RegisterRequest, RegisterResponse, RouterMessage, RouterMessageKind, SubscribeRequest,
    TopologyEvent, TopologyEventKind, now_ms,
};
pub use service::{
    Router, RouterConfig, RouterMetrics, RouterMetricsSnapshot, SERVICE_NAME,
};
