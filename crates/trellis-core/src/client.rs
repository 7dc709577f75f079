//! Caller-side endpoint and the four call drivers.
//!
//! Every call occupies exactly one stream: initial metadata with the call
//! path goes out first, then the request message(s), then the caller waits
//! on the responder's frames until the trailer. Shape violations fail the
//! call with `invalid-argument`; a missing trailer is `internal`; a caller
//! timeout cancels the stream and surfaces `deadline-exceeded`.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelConfig, RpcStream, StreamReceiver, StreamSender};
use crate::codec::Codec;
use crate::frame::FrameBody;
use crate::metadata::Metadata;
use crate::status::{RpcError, Status, StatusCode};
use crate::transport::Transport;

/// Per-call knobs.
#[derive(Default, Clone)]
pub struct CallOptions {
    /// Overall deadline for the call. Expiry cancels the stream and the
    /// caller sees `deadline-exceeded`.
    pub timeout: Option<Duration>,
    /// Extra headers appended to the initial metadata frame.
    pub metadata: Metadata,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }
}

/// Outbound-call endpoint over one channel.
#[derive(Clone)]
pub struct ClientEndpoint {
    channel: Channel,
}

impl ClientEndpoint {
    /// Wrap an already-started channel.
    pub fn new(channel: Channel) -> Self {
        ClientEndpoint { channel }
    }

    /// Start a channel on `transport` and use it for outbound calls only.
    /// Streams the peer tries to initiate are refused by the engine.
    pub fn connect(transport: Transport, config: ChannelConfig) -> Self {
        let (channel, _incoming) = Channel::start(transport, config);
        ClientEndpoint { channel }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Close the underlying channel (and transport).
    pub fn close(&self) {
        self.channel.close();
    }

    async fn open_call<Req>(
        &self,
        service: &str,
        method: &str,
        codec: &dyn Codec<Req>,
        opts: &CallOptions,
    ) -> Result<RpcStream, RpcError> {
        let mut stream = self.channel.open_stream();
        let md = Metadata::for_call(service, method, codec.content_type(), &opts.metadata);
        stream.send_metadata(md, false).await?;
        Ok(stream)
    }

    /// One request, one response.
    pub async fn unary<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        req_codec: Arc<dyn Codec<Req>>,
        resp_codec: Arc<dyn Codec<Resp>>,
        request: &Req,
        opts: CallOptions,
    ) -> Result<Resp, RpcError> {
        let deadline = opts.deadline();
        let stream = self.open_call(service, method, req_codec.as_ref(), &opts).await?;
        let (mut tx, mut rx) = stream.split();

        let payload = req_codec.encode(request)?;
        tx.send_message(payload, true).await?;

        let read = read_single_response(&mut rx);
        let result = match deadline {
            None => read.await,
            Some(deadline) => match tokio::time::timeout_at(deadline, read).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = tx.cancel().await;
                    return Err(RpcError::Status(Status::deadline_exceeded(format!(
                        "call to /{service}/{method} timed out"
                    ))));
                }
            },
        };
        let (payload, _trailer) = match result {
            Ok(v) => v,
            Err(e) => {
                // A shape violation leaves the stream open on the peer's
                // side; reset it.
                if e.code() == StatusCode::InvalidArgument {
                    let _ = tx.cancel().await;
                }
                return Err(e);
            }
        };
        Ok(resp_codec.decode(&payload)?)
    }

    /// One request, a stream of responses terminated by the trailer.
    pub async fn server_streaming<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        req_codec: Arc<dyn Codec<Req>>,
        resp_codec: Arc<dyn Codec<Resp>>,
        request: &Req,
        opts: CallOptions,
    ) -> Result<ResponseStream<Resp>, RpcError> {
        let deadline = opts.deadline();
        let stream = self.open_call(service, method, req_codec.as_ref(), &opts).await?;
        let (mut tx, rx) = stream.split();

        let payload = req_codec.encode(request)?;
        tx.send_message(payload, true).await?;

        Ok(ResponseStream::new(tx, rx, resp_codec, deadline))
    }

    /// A stream of requests pushed through a sink, one response.
    pub async fn client_streaming<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        req_codec: Arc<dyn Codec<Req>>,
        resp_codec: Arc<dyn Codec<Resp>>,
        opts: CallOptions,
    ) -> Result<ClientStreamCall<Req, Resp>, RpcError> {
        let deadline = opts.deadline();
        let stream = self.open_call(service, method, req_codec.as_ref(), &opts).await?;
        let (tx, rx) = stream.split();

        Ok(ClientStreamCall {
            sink: RequestSink {
                sender: tx,
                codec: req_codec,
            },
            receiver: rx,
            resp_codec,
            deadline,
            service: service.to_string(),
            method: method.to_string(),
        })
    }

    /// Both sides stream until each ends its half; the trailer closes the
    /// call.
    pub async fn duplex<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        req_codec: Arc<dyn Codec<Req>>,
        resp_codec: Arc<dyn Codec<Resp>>,
        opts: CallOptions,
    ) -> Result<(RequestSink<Req>, ResponseStream<Resp>), RpcError> {
        let deadline = opts.deadline();
        let stream = self.open_call(service, method, req_codec.as_ref(), &opts).await?;
        let (tx, rx) = stream.split();

        Ok((
            RequestSink {
                sender: tx,
                codec: req_codec,
            },
            ResponseStream::new_without_sender(rx, resp_codec, deadline),
        ))
    }
}

/// Read initial headers (if any), exactly one message, and the trailer.
async fn read_single_response(rx: &mut StreamReceiver) -> Result<(Bytes, Status), RpcError> {
    let mut message: Option<Bytes> = None;
    loop {
        match rx.recv().await {
            Some(Ok(frame)) => {
                let end = frame.end_stream();
                match frame.into_body() {
                    FrameBody::Metadata(md) => {
                        if !end {
                            // Initial response headers.
                            continue;
                        }
                        let Some(status) = Status::from_trailer(&md) else {
                            return Err(missing_status());
                        };
                        if !status.is_ok() {
                            return Err(RpcError::Status(status));
                        }
                        let Some(payload) = message else {
                            return Err(RpcError::Status(Status::invalid_argument(
                                "stream ended before the response message",
                            )));
                        };
                        return Ok((payload, status));
                    }
                    FrameBody::Message(payload) => {
                        if message.is_some() {
                            return Err(RpcError::Status(Status::invalid_argument(
                                "more than one message in a single-response call",
                            )));
                        }
                        message = Some(payload);
                        if end {
                            // Message bundled with end but no status header.
                            return Err(missing_status());
                        }
                    }
                    FrameBody::End => {
                        return Err(missing_status());
                    }
                }
            }
            Some(Err(e)) => return Err(e),
            None => return Err(missing_status()),
        }
    }
}

fn missing_status() -> RpcError {
    RpcError::Status(Status::internal("stream ended without a trailer status"))
}

/// Push half of a client-streaming or bidi call.
pub struct RequestSink<Req> {
    sender: StreamSender,
    codec: Arc<dyn Codec<Req>>,
}

impl<Req> RequestSink<Req> {
    /// Encode and send one request message.
    pub async fn send(&mut self, item: &Req) -> Result<(), RpcError> {
        let payload = self.codec.encode(item)?;
        self.sender.send_message(payload, false).await
    }

    /// Close this send half with a bare end-of-stream marker.
    pub async fn finish(&mut self) -> Result<(), RpcError> {
        self.sender.finish().await
    }

    /// Cancel the whole call.
    pub async fn cancel(&mut self) -> Result<(), RpcError> {
        self.sender.cancel().await
    }
}

/// A client-streaming call: push requests, then settle for one response.
pub struct ClientStreamCall<Req, Resp> {
    sink: RequestSink<Req>,
    receiver: StreamReceiver,
    resp_codec: Arc<dyn Codec<Resp>>,
    deadline: Option<Instant>,
    service: String,
    method: String,
}

impl<Req, Resp> ClientStreamCall<Req, Resp> {
    /// Push one request message.
    pub async fn send(&mut self, item: &Req) -> Result<(), RpcError> {
        self.sink.send(item).await
    }

    /// End the request stream and await the single response.
    pub async fn finish(mut self) -> Result<Resp, RpcError> {
        self.sink.finish().await?;

        let read = read_single_response(&mut self.receiver);
        let result = match self.deadline {
            None => read.await,
            Some(deadline) => match tokio::time::timeout_at(deadline, read).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = self.sink.cancel().await;
                    return Err(RpcError::Status(Status::deadline_exceeded(format!(
                        "call to /{}/{} timed out",
                        self.service, self.method
                    ))));
                }
            },
        };
        let (payload, _trailer) = match result {
            Ok(v) => v,
            Err(e) => {
                if e.code() == StatusCode::InvalidArgument {
                    let _ = self.sink.cancel().await;
                }
                return Err(e);
            }
        };
        Ok(self.resp_codec.decode(&payload)?)
    }

    /// Abandon the call.
    pub async fn cancel(mut self) -> Result<(), RpcError> {
        self.sink.cancel().await
    }
}

/// Lazy, finite, non-restartable stream of decoded responses.
///
/// Ends after the trailer; a non-OK trailer surfaces as the final `Err`
/// item. Dropping the stream before the trailer cancels the call.
pub struct ResponseStream<Resp> {
    receiver: StreamReceiver,
    /// Present on server-streaming calls so the reset on early drop has a
    /// sender to travel through; bidi callers hold their own sink instead.
    sender: Option<StreamSender>,
    codec: Arc<dyn Codec<Resp>>,
    deadline: Option<Instant>,
    done: bool,
}

impl<Resp> ResponseStream<Resp> {
    fn new(
        sender: StreamSender,
        receiver: StreamReceiver,
        codec: Arc<dyn Codec<Resp>>,
        deadline: Option<Instant>,
    ) -> Self {
        ResponseStream {
            receiver,
            sender: Some(sender),
            codec,
            deadline,
            done: false,
        }
    }

    fn new_without_sender(
        receiver: StreamReceiver,
        codec: Arc<dyn Codec<Resp>>,
        deadline: Option<Instant>,
    ) -> Self {
        ResponseStream {
            receiver,
            sender: None,
            codec,
            deadline,
            done: false,
        }
    }

    /// Next decoded response, or `None` after an OK trailer.
    pub async fn next(&mut self) -> Option<Result<Resp, RpcError>> {
        if self.done {
            return None;
        }
        let item = match self.deadline {
            None => self.next_inner().await,
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, self.next_inner()).await {
                    Ok(item) => item,
                    Err(_) => {
                        self.done = true;
                        self.cancel_quietly();
                        return Some(Err(RpcError::Status(Status::deadline_exceeded(
                            "response stream timed out",
                        ))));
                    }
                }
            }
        };
        if matches!(item, None | Some(Err(_))) {
            self.done = true;
        }
        item
    }

    async fn next_inner(&mut self) -> Option<Result<Resp, RpcError>> {
        loop {
            match self.receiver.recv().await {
                Some(Ok(frame)) => {
                    let end = frame.end_stream();
                    match frame.into_body() {
                        FrameBody::Metadata(md) => {
                            if !end {
                                continue; // initial response headers
                            }
                            let Some(status) = Status::from_trailer(&md) else {
                                return Some(Err(missing_status()));
                            };
                            if status.is_ok() {
                                return None;
                            }
                            return Some(Err(RpcError::Status(status)));
                        }
                        FrameBody::Message(payload) => {
                            if end {
                                // A message bundled with end_stream never
                                // carries the status header; the trailer
                                // must be its own frame.
                                return Some(Err(missing_status()));
                            }
                            return Some(self.codec.decode(&payload).map_err(RpcError::from));
                        }
                        FrameBody::End => {
                            return Some(Err(missing_status()));
                        }
                    }
                }
                Some(Err(e)) => return Some(Err(e)),
                None => return Some(Err(missing_status())),
            }
        }
    }

    /// Stop consuming and cancel the call.
    pub async fn cancel(&mut self) -> Result<(), RpcError> {
        self.done = true;
        match &mut self.sender {
            Some(sender) => sender.cancel().await,
            None => Ok(()),
        }
    }

    fn cancel_quietly(&mut self) {
        if let Some(sender) = &mut self.sender {
            sender.cancel_from_drop();
        }
    }
}

impl<Resp> Drop for ResponseStream<Resp> {
    fn drop(&mut self) {
        if !self.done {
            // Consumer walked away mid-stream: propagate cancellation.
            self.cancel_quietly();
        }
    }
}

impl<Resp> Stream for ResponseStream<Resp> {
    type Item = Result<Resp, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            match this.receiver.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(missing_status())));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Some(Ok(frame))) => {
                    let end = frame.end_stream();
                    match frame.into_body() {
                        FrameBody::Metadata(md) => {
                            if !end {
                                continue;
                            }
                            this.done = true;
                            return match Status::from_trailer(&md) {
                                None => Poll::Ready(Some(Err(missing_status()))),
                                Some(status) if status.is_ok() => Poll::Ready(None),
                                Some(status) => {
                                    Poll::Ready(Some(Err(RpcError::Status(status))))
                                }
                            };
                        }
                        FrameBody::Message(payload) => {
                            if end {
                                this.done = true;
                                return Poll::Ready(Some(Err(missing_status())));
                            }
                            let item = this.codec.decode(&payload).map_err(RpcError::from);
                            return Poll::Ready(Some(item));
                        }
                        FrameBody::End => {
                            this.done = true;
                            return Poll::Ready(Some(Err(missing_status())));
                        }
                    }
                }
            }
        }
    }
}
