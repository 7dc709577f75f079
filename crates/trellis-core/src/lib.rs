//! Core types and stream engine for trellis RPC.
//!
//! Trellis carries the four canonical RPC shapes — unary, server-stream,
//! client-stream, bidirectional — over a multiplexed stream protocol that
//! any frame transport can implement. This crate holds the engine: frame
//! model and codec, per-stream state machines, flow control, the caller
//! and responder drivers, the service registry and dispatcher, and the
//! bundled in-process and byte-stream transports.

mod cancel;
mod channel;
mod client;
mod codec;
mod flow;
mod frame;
mod framing;
pub mod metadata;
mod metrics;
mod middleware;
mod server;
mod status;
mod transport;

pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use channel::{
    Channel, ChannelConfig, DEFAULT_STREAM_INBOX, IncomingStreams, RpcStream, StreamReceiver,
    StreamSender, StreamState,
};
pub use client::{
    CallOptions, ClientEndpoint, ClientStreamCall, RequestSink, ResponseStream,
};
pub use codec::{Codec, JsonCodec, PrimitiveValue, RawCodec, json};
pub use flow::{DEFAULT_INITIAL_WINDOW, DEFAULT_WINDOW_CAP, FlowWindow};
pub use frame::{Frame, FrameBody};
pub use framing::{
    DEFAULT_MAX_MESSAGE_BYTES, Decoded, FrameError, MESSAGE_HEADER_LEN, MessageDecoder,
    encode_message,
};
pub use metadata::{Header, Metadata};
pub use metrics::{ChannelMetrics, ChannelMetricsSnapshot};
pub use middleware::{Middleware, MiddlewareChain};
pub use server::{
    BoxFuture, CallContext, MethodEntry, MethodHandler, MethodKind, RegistryError, RequestStream,
    Server, ServiceBuilder, ServiceRegistry, Streaming,
};
pub use status::{CodecError, RpcError, Status, StatusCode, TransportError};
pub use transport::{Side, Transport};

#[cfg(feature = "mem")]
pub use transport::mem::MemTransport;

#[cfg(feature = "stream")]
pub use transport::stream::StreamTransport;

#[cfg(feature = "websocket")]
pub use transport::websocket::WsTransport;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use trellis_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CallContext, CallOptions, Channel, ChannelConfig, ClientEndpoint, Codec, Metadata,
        RpcError, Server, ServiceRegistry, Status, StatusCode, Streaming, Transport, json,
    };
}
