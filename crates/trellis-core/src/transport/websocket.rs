//! WebSocket transport: one wire frame per binary message.
//!
//! Reuses the byte encoding from [`super::stream`]; text, ping and pong
//! messages are ignored, a close message is the clean end-of-input signal.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_core::Stream;
use futures_util::sink::Sink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::framing::DEFAULT_MAX_MESSAGE_BYTES;
use crate::status::TransportError;
use crate::transport::{Side, TransportBackend};
use crate::Frame;

use super::stream::{decode_frame, encode_frame};

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    side: Side,
    sink: AsyncMutex<WsSink>,
    source: AsyncMutex<WsSource>,
    closed: AtomicBool,
    max_message_bytes: AtomicUsize,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("side", &self.inner.side)
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    pub fn new<S>(ws: WebSocketStream<S>, side: Side) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        WsTransport {
            inner: Arc::new(WsInner {
                side,
                sink: AsyncMutex::new(Box::pin(sink)),
                source: AsyncMutex::new(Box::pin(source)),
                closed: AtomicBool::new(false),
                max_message_bytes: AtomicUsize::new(DEFAULT_MAX_MESSAGE_BYTES),
            }),
        }
    }

    pub fn set_max_message_bytes(&self, max: usize) {
        self.inner.max_message_bytes.store(max, Ordering::Release);
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl TransportBackend for WsTransport {
    fn side(&self) -> Side {
        self.inner.side
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }
        let max = self.inner.max_message_bytes.load(Ordering::Acquire);
        let wire = encode_frame(&frame, max)?;

        let mut sink = self.inner.sink.lock().await;
        sink.send(Message::binary(wire))
            .await
            .map_err(ws_to_transport_error)
    }

    async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }
        let max = self.inner.max_message_bytes.load(Ordering::Acquire);

        let mut source = self.inner.source.lock().await;
        loop {
            match source.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return decode_frame(&data[..], max).map(Some);
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // text/ping/pong keepalive noise
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(None);
                }
                Some(Err(WsError::Io(e))) => return Err(TransportError::Io(e)),
                Some(Err(e)) => return Err(TransportError::Decode(e.to_string())),
            }
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

fn ws_to_transport_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(e) => TransportError::Io(e),
        other => TransportError::Decode(other.to_string()),
    }
}
