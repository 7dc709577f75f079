//! Transport enum and internal backend trait.
//!
//! The public API is the [`Transport`] enum. Each backend lives in its own
//! module under `transport/` and implements the internal
//! [`TransportBackend`] trait; the enum forwards with a plain `match`.
//!
//! A transport moves whole [`Frame`]s between two peers. It guarantees
//! per-stream ordering and clean end-of-input signalling (`recv` returns
//! `None`); everything above that — stream states, call shapes, trailers —
//! belongs to the engine.

use crate::Frame;
use crate::status::TransportError;

/// Which end of the channel this transport half is. The initiator opens
/// odd-numbered streams, the acceptor even-numbered ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Acceptor,
}

impl Side {
    /// First stream id this side may allocate.
    pub fn first_stream_id(self) -> u32 {
        match self {
            Side::Initiator => 1,
            Side::Acceptor => 2,
        }
    }

    pub fn peer(self) -> Side {
        match self {
            Side::Initiator => Side::Acceptor,
            Side::Acceptor => Side::Initiator,
        }
    }

    /// Whether `stream_id` was allocated by this side.
    pub fn owns_stream(self, stream_id: u32) -> bool {
        match self {
            Side::Initiator => stream_id % 2 == 1,
            Side::Acceptor => stream_id % 2 == 0 && stream_id != 0,
        }
    }
}

pub(crate) trait TransportBackend: Send + Sync + 'static {
    fn side(&self) -> Side;
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<Option<Frame>, TransportError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[derive(Clone, Debug)]
pub enum Transport {
    #[cfg(feature = "mem")]
    Mem(mem::MemTransport),
    #[cfg(feature = "stream")]
    Stream(stream::StreamTransport),
    #[cfg(feature = "websocket")]
    WebSocket(websocket::WsTransport),
}

impl Transport {
    pub fn side(&self) -> Side {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.side(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.side(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.side(),
        }
    }

    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.send(frame).await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.send(frame).await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.send(frame).await,
        }
    }

    /// Receive the next frame. `Ok(None)` is the clean end-of-input
    /// signal: the peer closed and everything it sent has been drained.
    pub async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.recv().await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.recv().await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.recv().await,
        }
    }

    pub fn close(&self) {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => TransportBackend::close(t),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => TransportBackend::close(t),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => TransportBackend::close(t),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.is_closed(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.is_closed(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.is_closed(),
        }
    }

    /// Paired in-process loopback halves (initiator, acceptor).
    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    /// Wrap a byte stream (TCP socket, duplex pipe) in the framed adapter.
    #[cfg(feature = "stream")]
    pub fn stream<S>(io: S, side: Side) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Transport::Stream(stream::StreamTransport::new(io, side))
    }

    /// Paired framed transports over an in-memory duplex pipe.
    #[cfg(feature = "stream")]
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamTransport::pair();
        (Transport::Stream(a), Transport::Stream(b))
    }

    #[cfg(feature = "websocket")]
    pub fn websocket<S>(ws: tokio_tungstenite::WebSocketStream<S>, side: Side) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Transport::WebSocket(websocket::WsTransport::new(ws, side))
    }
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;
#[cfg(feature = "websocket")]
pub mod websocket;
