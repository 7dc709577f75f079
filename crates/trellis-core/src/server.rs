//! Responder endpoint: service registry, dispatch loop, and the four
//! responder-side drivers.
//!
//! The registry maps `service → method → MethodEntry`. Registration is
//! typed (codecs and handler shape fixed per method kind) and rejects
//! duplicates. The dispatcher accepts inbound streams, resolves `:path`,
//! and drives each stream with exactly one handler invocation; handler
//! failures become trailers, never endpoint teardown.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::cancel::{CancelHandle, CancelSignal, cancel_pair};
use crate::channel::{Channel, ChannelConfig, IncomingStreams, RpcStream, StreamReceiver, StreamSender};
use crate::codec::Codec;
use crate::frame::FrameBody;
use crate::metadata::Metadata;
use crate::middleware::MiddlewareChain;
use crate::status::Status;
use crate::transport::Transport;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handler-facing stream of decoded request messages.
pub type RequestStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// Lazy sequence a streaming handler produces.
pub type Streaming<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// RPC method kind (streaming semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Single request, single response.
    Unary,
    /// Multiple requests, single response.
    ClientStreaming,
    /// Single request, multiple responses.
    ServerStreaming,
    /// Multiple requests and responses.
    Bidirectional,
}

impl MethodKind {
    pub fn name(self) -> &'static str {
        match self {
            MethodKind::Unary => "unary",
            MethodKind::ClientStreaming => "client-streaming",
            MethodKind::ServerStreaming => "server-streaming",
            MethodKind::Bidirectional => "bidirectional",
        }
    }
}

/// Everything a handler may know about its call.
#[derive(Clone)]
pub struct CallContext {
    service: String,
    method: String,
    kind: MethodKind,
    metadata: Metadata,
    cancel: CancelSignal,
}

impl CallContext {
    pub(crate) fn new(
        service: String,
        method: String,
        kind: MethodKind,
        metadata: Metadata,
        cancel: CancelSignal,
    ) -> Self {
        CallContext {
            service,
            method,
            kind,
            metadata,
            cancel,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Request metadata from the initial frame.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Replace the call metadata (middleware only; payloads are off
    /// limits).
    pub fn replace_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    /// True once the caller cancelled this call.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the caller cancels. Long-running handlers should
    /// select against this and wind down promptly.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Type-erased handler, one variant per call shape.
#[derive(Clone)]
pub enum MethodHandler {
    Unary(Arc<dyn Fn(CallContext, Bytes) -> BoxFuture<Result<Bytes, Status>> + Send + Sync>),
    ServerStreaming(
        Arc<dyn Fn(CallContext, Bytes) -> BoxFuture<Result<ByteStream, Status>> + Send + Sync>,
    ),
    ClientStreaming(
        Arc<dyn Fn(CallContext, ByteStream) -> BoxFuture<Result<Bytes, Status>> + Send + Sync>,
    ),
    Bidirectional(
        Arc<dyn Fn(CallContext, ByteStream) -> BoxFuture<Result<ByteStream, Status>> + Send + Sync>,
    ),
}

impl std::fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MethodHandler").field(&self.kind()).finish()
    }
}

impl MethodHandler {
    fn kind(&self) -> MethodKind {
        match self {
            MethodHandler::Unary(_) => MethodKind::Unary,
            MethodHandler::ServerStreaming(_) => MethodKind::ServerStreaming,
            MethodHandler::ClientStreaming(_) => MethodKind::ClientStreaming,
            MethodHandler::Bidirectional(_) => MethodKind::Bidirectional,
        }
    }
}

/// One registered method.
#[derive(Clone, Debug)]
pub struct MethodEntry {
    kind: MethodKind,
    handler: MethodHandler,
}

impl MethodEntry {
    pub fn kind(&self) -> MethodKind {
        self.kind
    }
}

/// Error type for registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    EmptyServiceName,
    EmptyMethodName,
    /// Duplicate `(service, method)` pair.
    DuplicateMethod { service: String, method: String },
    /// Merging two contracts that share a service name.
    DuplicateService(String),
    /// Declared kind contradicts the handler's shape.
    KindMismatch {
        declared: MethodKind,
        actual: MethodKind,
    },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::EmptyServiceName => write!(f, "service name cannot be empty"),
            RegistryError::EmptyMethodName => write!(f, "method name cannot be empty"),
            RegistryError::DuplicateMethod { service, method } => {
                write!(f, "method {service}/{method} is already registered")
            }
            RegistryError::DuplicateService(name) => {
                write!(f, "service {name} is already registered")
            }
            RegistryError::KindMismatch { declared, actual } => write!(
                f,
                "declared kind {} contradicts handler shape {}",
                declared.name(),
                actual.name()
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// `service → method → handler` map. Read-mostly after startup; the
/// dispatcher shares it behind an `Arc`.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<String, HashMap<String, MethodEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    /// Register methods under `service`. The builder appends to any
    /// methods the service already has; duplicates are rejected per
    /// method.
    pub fn service(&mut self, name: &str) -> Result<ServiceBuilder<'_>, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyServiceName);
        }
        let methods = self.services.entry(name.to_string()).or_default();
        Ok(ServiceBuilder {
            service: name.to_string(),
            methods,
        })
    }

    /// Low-level registration with an already-erased handler.
    pub fn register(
        &mut self,
        service: &str,
        method: &str,
        kind: MethodKind,
        handler: MethodHandler,
    ) -> Result<(), RegistryError> {
        self.service(service)?.register(method, kind, handler)?;
        Ok(())
    }

    /// Flatten another contract's services into this one. Service names
    /// must be distinct; no prefixing is applied.
    pub fn merge(&mut self, other: ServiceRegistry) -> Result<(), RegistryError> {
        for name in other.services.keys() {
            if self.services.contains_key(name) {
                return Err(RegistryError::DuplicateService(name.clone()));
            }
        }
        self.services.extend(other.services);
        Ok(())
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<&MethodEntry> {
        self.services.get(service)?.get(method)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(|s| s.as_str())
    }

    pub fn method_count(&self) -> usize {
        self.services.values().map(|m| m.len()).sum()
    }
}

/// Builder for one service's methods.
#[derive(Debug)]
pub struct ServiceBuilder<'a> {
    service: String,
    methods: &'a mut HashMap<String, MethodEntry>,
}

impl ServiceBuilder<'_> {
    fn register(
        &mut self,
        method: &str,
        kind: MethodKind,
        handler: MethodHandler,
    ) -> Result<&mut Self, RegistryError> {
        if method.is_empty() {
            return Err(RegistryError::EmptyMethodName);
        }
        if handler.kind() != kind {
            return Err(RegistryError::KindMismatch {
                declared: kind,
                actual: handler.kind(),
            });
        }
        if self.methods.contains_key(method) {
            return Err(RegistryError::DuplicateMethod {
                service: self.service.clone(),
                method: method.to_string(),
            });
        }
        self.methods
            .insert(method.to_string(), MethodEntry { kind, handler });
        Ok(self)
    }

    /// Single request, single response.
    pub fn unary<Req, Resp, H, Fut>(
        &mut self,
        method: &str,
        req_codec: Arc<dyn Codec<Req>>,
        resp_codec: Arc<dyn Codec<Resp>>,
        handler: H,
    ) -> Result<&mut Self, RegistryError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased = move |ctx: CallContext, payload: Bytes| -> BoxFuture<Result<Bytes, Status>> {
            let req_codec = req_codec.clone();
            let resp_codec = resp_codec.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let req = req_codec
                    .decode(&payload)
                    .map_err(|e| Status::invalid_argument(e.to_string()))?;
                let resp = handler(ctx, req).await?;
                resp_codec
                    .encode(&resp)
                    .map_err(|e| Status::internal(e.to_string()))
            })
        };
        self.register(
            method,
            MethodKind::Unary,
            MethodHandler::Unary(Arc::new(erased)),
        )
    }

    /// Single request, streamed responses.
    pub fn server_streaming<Req, Resp, H, Fut, S>(
        &mut self,
        method: &str,
        req_codec: Arc<dyn Codec<Req>>,
        resp_codec: Arc<dyn Codec<Resp>>,
        handler: H,
    ) -> Result<&mut Self, RegistryError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased =
            move |ctx: CallContext, payload: Bytes| -> BoxFuture<Result<ByteStream, Status>> {
                let req_codec = req_codec.clone();
                let resp_codec = resp_codec.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let req = req_codec
                        .decode(&payload)
                        .map_err(|e| Status::invalid_argument(e.to_string()))?;
                    let stream = handler(ctx, req).await?;
                    let mapped = stream.map(move |item| {
                        item.and_then(|resp| {
                            resp_codec
                                .encode(&resp)
                                .map_err(|e| Status::internal(e.to_string()))
                        })
                    });
                    Ok(Box::pin(mapped) as ByteStream)
                })
            };
        self.register(
            method,
            MethodKind::ServerStreaming,
            MethodHandler::ServerStreaming(Arc::new(erased)),
        )
    }

    /// Streamed requests, single response.
    pub fn client_streaming<Req, Resp, H, Fut>(
        &mut self,
        method: &str,
        req_codec: Arc<dyn Codec<Req>>,
        resp_codec: Arc<dyn Codec<Resp>>,
        handler: H,
    ) -> Result<&mut Self, RegistryError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: Fn(CallContext, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased =
            move |ctx: CallContext, requests: ByteStream| -> BoxFuture<Result<Bytes, Status>> {
                let req_codec = req_codec.clone();
                let resp_codec = resp_codec.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let typed = decode_requests(requests, req_codec);
                    let resp = handler(ctx, typed).await?;
                    resp_codec
                        .encode(&resp)
                        .map_err(|e| Status::internal(e.to_string()))
                })
            };
        self.register(
            method,
            MethodKind::ClientStreaming,
            MethodHandler::ClientStreaming(Arc::new(erased)),
        )
    }

    /// Streamed requests, streamed responses.
    pub fn bidirectional<Req, Resp, H, Fut, S>(
        &mut self,
        method: &str,
        req_codec: Arc<dyn Codec<Req>>,
        resp_codec: Arc<dyn Codec<Resp>>,
        handler: H,
    ) -> Result<&mut Self, RegistryError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: Fn(CallContext, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased = move |ctx: CallContext,
                           requests: ByteStream|
              -> BoxFuture<Result<ByteStream, Status>> {
            let req_codec = req_codec.clone();
            let resp_codec = resp_codec.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let typed = decode_requests(requests, req_codec);
                let stream = handler(ctx, typed).await?;
                let mapped = stream.map(move |item| {
                    item.and_then(|resp| {
                        resp_codec
                            .encode(&resp)
                            .map_err(|e| Status::internal(e.to_string()))
                    })
                });
                Ok(Box::pin(mapped) as ByteStream)
            })
        };
        self.register(
            method,
            MethodKind::Bidirectional,
            MethodHandler::Bidirectional(Arc::new(erased)),
        )
    }
}

fn decode_requests<Req>(requests: ByteStream, codec: Arc<dyn Codec<Req>>) -> RequestStream<Req>
where
    Req: Send + 'static,
{
    Box::pin(requests.map(move |item| {
        item.and_then(|payload| {
            codec
                .decode(&payload)
                .map_err(|e| Status::invalid_argument(e.to_string()))
        })
    }))
}

/// The responder endpoint: registry + middleware + dispatch loop.
#[derive(Clone)]
pub struct Server {
    registry: Arc<ServiceRegistry>,
    middleware: Arc<MiddlewareChain>,
    config: ChannelConfig,
}

impl Server {
    pub fn new(registry: ServiceRegistry) -> Self {
        Server {
            registry: Arc::new(registry),
            middleware: Arc::new(MiddlewareChain::new()),
            config: ChannelConfig::default(),
        }
    }

    pub fn with_middleware(mut self, chain: MiddlewareChain) -> Self {
        self.middleware = Arc::new(chain);
        self
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Serve one transport until its inbound side ends. Each inbound
    /// stream runs as its own task; handler failures never end the loop.
    pub async fn serve(&self, transport: Transport) {
        let (channel, incoming) = Channel::start(transport, self.config.clone());
        self.serve_channel(&channel, incoming).await;
    }

    /// Serve an already-started channel (for endpoints that also make
    /// outbound calls on it).
    pub async fn serve_channel(&self, _channel: &Channel, mut incoming: IncomingStreams) {
        while let Some(stream) = incoming.next().await {
            let registry = self.registry.clone();
            let middleware = self.middleware.clone();
            tokio::spawn(async move {
                dispatch_stream(stream, registry, middleware).await;
            });
        }
    }
}

async fn dispatch_stream(
    mut stream: RpcStream,
    registry: Arc<ServiceRegistry>,
    middleware: Arc<MiddlewareChain>,
) {
    let stream_id = stream.stream_id();
    let md = match stream.initial_metadata().await {
        Ok(md) => md,
        Err(e) => {
            tracing::debug!(stream_id, error = %e, "inbound stream died before metadata");
            return;
        }
    };

    let Some((service, method)) = md.call_path().map(|(s, m)| (s.to_string(), m.to_string()))
    else {
        let status = Status::invalid_argument("missing or malformed :path header");
        let _ = stream.send_trailer(&status).await;
        return;
    };

    let Some(entry) = registry.lookup(&service, &method).cloned() else {
        tracing::debug!(stream_id, %service, %method, "unknown method");
        let status = Status::unimplemented(format!("unknown method /{service}/{method}"));
        let _ = stream.send_trailer(&status).await;
        return;
    };

    let (cancel_handle, cancel_signal) = cancel_pair();
    let mut ctx = CallContext::new(service.clone(), method.clone(), entry.kind, md, cancel_signal);

    if let Err(status) = middleware.enter(&mut ctx) {
        let _ = stream.send_trailer(&status).await;
        return;
    }

    tracing::trace!(stream_id, %service, %method, kind = entry.kind.name(), "dispatching");
    let (tx, rx) = stream.split();
    let status = drive_call(entry.handler, ctx.clone(), tx, rx, cancel_handle).await;
    middleware.exit(&ctx, &status);
}

/// Outcome of reading the single request of a unary or server-streaming
/// call.
enum SingleRequest {
    Complete(Bytes),
    ShapeError(Status),
    Cancelled,
    Gone,
}

async fn read_single_request(rx: &mut StreamReceiver, cancel: &CancelHandle) -> SingleRequest {
    let mut payload: Option<Bytes> = None;
    loop {
        match rx.recv().await {
            Some(Ok(frame)) => {
                let end = frame.end_stream();
                match frame.into_body() {
                    FrameBody::Message(p) => {
                        if payload.is_some() {
                            return SingleRequest::ShapeError(Status::invalid_argument(
                                "more than one message in a single-request call",
                            ));
                        }
                        if end {
                            return SingleRequest::Complete(p);
                        }
                        payload = Some(p);
                    }
                    FrameBody::End => {
                        return match payload.take() {
                            Some(p) => SingleRequest::Complete(p),
                            None => SingleRequest::ShapeError(Status::invalid_argument(
                                "stream ended before the request message",
                            )),
                        };
                    }
                    FrameBody::Metadata(_) => {
                        if end {
                            // Reset from the caller.
                            cancel.cancel();
                            return SingleRequest::Cancelled;
                        }
                        // Spurious extra headers; ignore.
                    }
                }
            }
            Some(Err(_)) | None => return SingleRequest::Gone,
        }
    }
}

/// Forward inbound request messages into `req_tx` (when present) and fire
/// the cancel handle on a caller reset. Returns only when the inbound side
/// is gone, so it can outlive the request phase as a reset watcher.
async fn pump_requests(
    rx: &mut StreamReceiver,
    req_tx: Option<mpsc::Sender<Result<Bytes, Status>>>,
    cancel: &CancelHandle,
) {
    let mut req_tx = req_tx;
    loop {
        match rx.recv().await {
            Some(Ok(frame)) => {
                let end = frame.end_stream();
                match frame.into_body() {
                    FrameBody::Message(p) => {
                        if let Some(tx) = &req_tx {
                            if tx.send(Ok(p)).await.is_err() {
                                // Handler dropped its request stream; keep
                                // watching for a reset.
                                req_tx = None;
                            }
                        }
                        if end {
                            req_tx = None;
                        }
                    }
                    FrameBody::End => {
                        req_tx = None;
                    }
                    FrameBody::Metadata(_) if end => {
                        cancel.cancel();
                        req_tx = None;
                    }
                    FrameBody::Metadata(_) => {}
                }
            }
            Some(Err(_)) | None => return,
        }
    }
}

async fn drive_call(
    handler: MethodHandler,
    ctx: CallContext,
    mut tx: StreamSender,
    mut rx: StreamReceiver,
    cancel: CancelHandle,
) -> Status {
    match handler {
        MethodHandler::Unary(h) => {
            let payload = match read_single_request(&mut rx, &cancel).await {
                SingleRequest::Complete(p) => p,
                SingleRequest::ShapeError(status) => {
                    let _ = tx.send_trailer(&status).await;
                    return status;
                }
                SingleRequest::Cancelled => return Status::cancelled("caller reset"),
                SingleRequest::Gone => return Status::unavailable("caller gone"),
            };

            let respond = async {
                let result = h(ctx.clone(), payload).await;
                finish_single_response(&mut tx, &cancel, result).await
            };
            tokio::select! {
                status = respond => status,
                _ = pump_requests_noop(&mut rx, &cancel) => {
                    Status::unavailable("transport closed mid-call")
                }
            }
        }

        MethodHandler::ServerStreaming(h) => {
            let payload = match read_single_request(&mut rx, &cancel).await {
                SingleRequest::Complete(p) => p,
                SingleRequest::ShapeError(status) => {
                    let _ = tx.send_trailer(&status).await;
                    return status;
                }
                SingleRequest::Cancelled => return Status::cancelled("caller reset"),
                SingleRequest::Gone => return Status::unavailable("caller gone"),
            };

            let respond = async {
                if tx.send_metadata(Metadata::new(), false).await.is_err() {
                    return Status::unavailable("caller gone");
                }
                match h(ctx.clone(), payload).await {
                    Err(status) => {
                        if !cancel.is_cancelled() {
                            let _ = tx.send_trailer(&status).await;
                        }
                        status
                    }
                    Ok(stream) => write_responses(&mut tx, &ctx, &cancel, stream).await,
                }
            };
            tokio::select! {
                status = respond => status,
                _ = pump_requests_noop(&mut rx, &cancel) => {
                    Status::unavailable("transport closed mid-call")
                }
            }
        }

        MethodHandler::ClientStreaming(h) => {
            let (req_tx, req_rx) = mpsc::channel(DEFAULT_REQUEST_BUFFER);
            let requests: ByteStream = Box::pin(ReceiverStream::new(req_rx));

            let respond = async {
                let result = h(ctx.clone(), requests).await;
                finish_single_response(&mut tx, &cancel, result).await
            };
            tokio::select! {
                status = respond => status,
                _ = pump_requests(&mut rx, Some(req_tx), &cancel) => {
                    Status::unavailable("transport closed mid-call")
                }
            }
        }

        MethodHandler::Bidirectional(h) => {
            let (req_tx, req_rx) = mpsc::channel(DEFAULT_REQUEST_BUFFER);
            let requests: ByteStream = Box::pin(ReceiverStream::new(req_rx));

            let respond = async {
                if tx.send_metadata(Metadata::new(), false).await.is_err() {
                    return Status::unavailable("caller gone");
                }
                match h(ctx.clone(), requests).await {
                    Err(status) => {
                        if !cancel.is_cancelled() {
                            let _ = tx.send_trailer(&status).await;
                        }
                        status
                    }
                    Ok(stream) => write_responses(&mut tx, &ctx, &cancel, stream).await,
                }
            };
            tokio::select! {
                status = respond => status,
                _ = pump_requests(&mut rx, Some(req_tx), &cancel) => {
                    Status::unavailable("transport closed mid-call")
                }
            }
        }
    }
}

const DEFAULT_REQUEST_BUFFER: usize = 16;

async fn pump_requests_noop(rx: &mut StreamReceiver, cancel: &CancelHandle) {
    pump_requests(rx, None, cancel).await
}

/// Emit the single response + trailer of a unary or client-streaming call.
async fn finish_single_response(
    tx: &mut StreamSender,
    cancel: &CancelHandle,
    result: Result<Bytes, Status>,
) -> Status {
    if cancel.is_cancelled() {
        // Stop forwarding output; the caller discards it anyway.
        return Status::cancelled("caller reset");
    }
    match result {
        Ok(payload) => {
            let ok = Status::ok();
            if tx.send_metadata(Metadata::new(), false).await.is_err()
                || tx.send_message(payload, false).await.is_err()
                || tx.send_trailer(&ok).await.is_err()
            {
                return Status::unavailable("caller gone");
            }
            ok
        }
        Err(status) => {
            let _ = tx.send_trailer(&status).await;
            status
        }
    }
}

/// Frame every element of a handler's stream, then close with a trailer.
/// Stops forwarding (and drops the stream) the moment the caller resets.
async fn write_responses(
    tx: &mut StreamSender,
    ctx: &CallContext,
    cancel: &CancelHandle,
    stream: ByteStream,
) -> Status {
    let mut stream = stream;
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = ctx.cancelled() => return Status::cancelled("caller reset"),
        };
        match item {
            Some(Ok(payload)) => {
                if cancel.is_cancelled() {
                    return Status::cancelled("caller reset");
                }
                if tx.send_message(payload, false).await.is_err() {
                    return Status::unavailable("caller gone");
                }
            }
            Some(Err(status)) => {
                if !cancel.is_cancelled() {
                    let _ = tx.send_trailer(&status).await;
                }
                return status;
            }
            None => {
                let ok = Status::ok();
                if !cancel.is_cancelled() && tx.send_trailer(&ok).await.is_err() {
                    return Status::unavailable("caller gone");
                }
                return ok;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::json;

    fn nop_unary(registry: &mut ServiceRegistry, service: &str, method: &str) {
        registry
            .service(service)
            .unwrap()
            .unary(
                method,
                Arc::new(json::<u32>()),
                Arc::new(json::<u32>()),
                |_ctx, n: u32| async move { Ok(n) },
            )
            .unwrap();
    }

    #[test]
    fn duplicate_method_rejected() {
        let mut registry = ServiceRegistry::new();
        nop_unary(&mut registry, "Svc", "M");
        let err = registry
            .service("Svc")
            .unwrap()
            .unary(
                "M",
                Arc::new(json::<u32>()),
                Arc::new(json::<u32>()),
                |_ctx, n: u32| async move { Ok(n) },
            )
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateMethod {
                service: "Svc".into(),
                method: "M".into()
            }
        );
    }

    #[test]
    fn same_method_name_on_two_services_is_fine() {
        let mut registry = ServiceRegistry::new();
        nop_unary(&mut registry, "A", "M");
        nop_unary(&mut registry, "B", "M");
        assert!(registry.lookup("A", "M").is_some());
        assert!(registry.lookup("B", "M").is_some());
        assert_eq!(registry.method_count(), 2);
    }

    #[test]
    fn empty_names_rejected() {
        let mut registry = ServiceRegistry::new();
        assert_eq!(
            registry.service("").unwrap_err(),
            RegistryError::EmptyServiceName
        );
        let err = registry
            .service("Svc")
            .unwrap()
            .unary(
                "",
                Arc::new(json::<u32>()),
                Arc::new(json::<u32>()),
                |_ctx, n: u32| async move { Ok(n) },
            )
            .unwrap_err();
        assert_eq!(err, RegistryError::EmptyMethodName);
    }

    #[test]
    fn kind_mismatch_rejected() {
        let mut registry = ServiceRegistry::new();
        let handler = MethodHandler::Unary(Arc::new(|_ctx, payload| {
            Box::pin(async move { Ok(payload) }) as BoxFuture<Result<Bytes, Status>>
        }));
        let err = registry
            .register("Svc", "M", MethodKind::ServerStreaming, handler)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::KindMismatch {
                declared: MethodKind::ServerStreaming,
                actual: MethodKind::Unary
            }
        );
    }

    #[test]
    fn merge_flattens_sub_contracts() {
        let mut parent = ServiceRegistry::new();
        nop_unary(&mut parent, "Parent", "M");

        let mut sub = ServiceRegistry::new();
        nop_unary(&mut sub, "Sub", "M");

        parent.merge(sub).unwrap();
        assert!(parent.lookup("Parent", "M").is_some());
        assert!(parent.lookup("Sub", "M").is_some());
    }

    #[test]
    fn merge_rejects_shared_service_names() {
        let mut parent = ServiceRegistry::new();
        nop_unary(&mut parent, "Shared", "A");

        let mut sub = ServiceRegistry::new();
        nop_unary(&mut sub, "Shared", "B");

        assert_eq!(
            parent.merge(sub).unwrap_err(),
            RegistryError::DuplicateService("Shared".into())
        );
    }

    #[test]
    fn lookup_misses() {
        let mut registry = ServiceRegistry::new();
        nop_unary(&mut registry, "Svc", "M");
        assert!(registry.lookup("Svc", "Nope").is_none());
        assert!(registry.lookup("Nope", "M").is_none());
    }
}
