//! The stream engine: multiplexed per-stream state machines on top of one
//! transport.
//!
//! A [`Channel`] owns the inbound demultiplex task for its transport,
//! allocates stream ids (odd from the pair initiator, even from the
//! acceptor, strictly increasing, never reused), and hands out
//! [`RpcStream`] handles. Frames for one stream reach their consumer in
//! send order through a bounded inbox; a full inbox suspends the demux
//! task, which in turn suspends the peer's sender through transport flow
//! control.
//!
//! A stream's routing entry lives as long as either of its halves: a reset
//! can still reach a responder that long ago consumed the request's
//! end-of-stream, and frames for fully-dropped streams are discarded
//! silently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::frame::{Frame, FrameBody};
use crate::framing::DEFAULT_MAX_MESSAGE_BYTES;
use crate::metadata::Metadata;
use crate::metrics::{ChannelMetrics, ChannelMetricsSnapshot};
use crate::status::{RpcError, Status, StatusCode, TransportError};
use crate::transport::Transport;

/// Frames buffered per stream before the demultiplexer suspends.
pub const DEFAULT_STREAM_INBOX: usize = 16;

/// Queue depth for not-yet-accepted inbound streams.
const INCOMING_DEPTH: usize = 32;

/// Engine configuration shared by every stream on a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Authoritative per-message byte cap, enforced on send and again by
    /// the frame codec on receive.
    pub max_message_bytes: usize,
    /// Bound of each stream's inbound frame queue.
    pub stream_inbox_frames: usize,
    /// Debug label used in tracing fields.
    pub label: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            stream_inbox_frames: DEFAULT_STREAM_INBOX,
            label: None,
        }
    }
}

/// Life of one stream, as visible to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

struct StreamCell {
    inbox: mpsc::Sender<Result<Frame, RpcError>>,
    cancelled: Arc<AtomicBool>,
}

struct ChannelShared {
    config: ChannelConfig,
    next_id: AtomicU32,
    streams: Mutex<HashMap<u32, StreamCell>>,
    metrics: Arc<ChannelMetrics>,
    shutdown: Notify,
    closed: AtomicBool,
}

impl ChannelShared {
    fn remove_stream(&self, id: u32) {
        self.streams.lock().remove(&id);
    }
}

/// Removes the routing entry once both halves of a stream are gone.
struct StreamGuard {
    id: u32,
    shared: Arc<ChannelShared>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.shared.remove_stream(self.id);
    }
}

/// Handle to the engine for one transport. Cloneable; the engine lives
/// until every clone is gone or [`Channel::close`] is called.
#[derive(Clone)]
pub struct Channel {
    transport: Arc<Transport>,
    shared: Arc<ChannelShared>,
}

/// Streams initiated by the peer, in arrival order.
pub struct IncomingStreams {
    rx: mpsc::Receiver<RpcStream>,
}

impl IncomingStreams {
    pub async fn next(&mut self) -> Option<RpcStream> {
        self.rx.recv().await
    }
}

impl Channel {
    /// Wrap a transport and start its demultiplex task.
    pub fn start(transport: Transport, config: ChannelConfig) -> (Self, IncomingStreams) {
        let side = transport.side();
        let transport = Arc::new(transport);
        let shared = Arc::new(ChannelShared {
            next_id: AtomicU32::new(side.first_stream_id()),
            config,
            streams: Mutex::new(HashMap::new()),
            metrics: Arc::new(ChannelMetrics::default()),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_DEPTH);

        tokio::spawn(demux_loop(transport.clone(), shared.clone(), incoming_tx));

        (
            Channel { transport, shared },
            IncomingStreams { rx: incoming_rx },
        )
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> ChannelMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Open a locally-initiated stream. The first frame sent on it must be
    /// initial metadata carrying the call path.
    pub fn open_stream(&self) -> RpcStream {
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        self.shared
            .metrics
            .streams_opened
            .fetch_add(1, Ordering::Relaxed);
        let (inbox_tx, inbox_rx) = mpsc::channel(self.shared.config.stream_inbox_frames);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.shared.streams.lock().insert(
            id,
            StreamCell {
                inbox: inbox_tx,
                cancelled: cancelled.clone(),
            },
        );
        build_stream(id, self.transport.clone(), self.shared.clone(), inbox_rx, cancelled)
    }

    /// Close the whole channel: the transport is closed, the demux task
    /// stops, and every open stream fails with `unavailable`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.transport.close();
        self.shared.shutdown.notify_waiters();
    }
}

fn build_stream(
    id: u32,
    transport: Arc<Transport>,
    shared: Arc<ChannelShared>,
    inbox_rx: mpsc::Receiver<Result<Frame, RpcError>>,
    cancelled: Arc<AtomicBool>,
) -> RpcStream {
    let guard = Arc::new(StreamGuard {
        id,
        shared: shared.clone(),
    });
    RpcStream {
        sender: StreamSender {
            id,
            transport,
            shared,
            cancelled: cancelled.clone(),
            half_closed: false,
            _guard: guard.clone(),
        },
        receiver: StreamReceiver {
            id,
            rx: inbox_rx,
            cancelled,
            saw_end: false,
            _guard: guard,
        },
    }
}

async fn demux_loop(
    transport: Arc<Transport>,
    shared: Arc<ChannelShared>,
    incoming_tx: mpsc::Sender<RpcStream>,
) {
    let remote_side = transport.side().peer();
    loop {
        let shutdown = shared.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        let received = tokio::select! {
            received = transport.recv() => received,
            _ = shutdown => {
                fail_open_streams(&shared, None);
                return;
            }
        };

        match received {
            Ok(Some(frame)) => {
                shared
                    .metrics
                    .record_received(frame.is_message(), frame.flow_weight());
                route_frame(&transport, &shared, &incoming_tx, remote_side, frame).await;
            }
            Ok(None) => {
                // Peer closed cleanly; any stream still waiting on a
                // trailer ends without one and its driver reports that.
                tracing::debug!(label = ?shared.config.label, "transport input ended");
                fail_open_streams(&shared, None);
                return;
            }
            Err(e) => {
                tracing::debug!(label = ?shared.config.label, error = %e, "transport failed");
                fail_open_streams(&shared, Some(e));
                shared.closed.store(true, Ordering::Release);
                return;
            }
        }
    }
}

async fn route_frame(
    transport: &Arc<Transport>,
    shared: &Arc<ChannelShared>,
    incoming_tx: &mpsc::Sender<RpcStream>,
    remote_side: crate::transport::Side,
    frame: Frame,
) {
    let id = frame.stream_id();

    let existing = {
        let streams = shared.streams.lock();
        streams
            .get(&id)
            .map(|cell| (cell.inbox.clone(), cell.cancelled.clone()))
    };

    if let Some((inbox, cancelled)) = existing {
        if cancelled.load(Ordering::Acquire) {
            // Frames after local cancellation are discarded silently.
            return;
        }
        // Suspending here is the backpressure path: a full inbox parks the
        // demux task, which stops acking transport flow control.
        if inbox.send(Ok(frame)).await.is_err() {
            tracing::trace!(stream_id = id, "receiver gone, frame dropped");
        }
        return;
    }

    // Unknown stream: only an initial metadata frame from the peer's id
    // space opens a new one. Everything else is a late frame for a stream
    // that was already torn down.
    if remote_side.owns_stream(id) && frame.is_metadata() && !frame.end_stream() {
        let (inbox_tx, inbox_rx) = mpsc::channel(shared.config.stream_inbox_frames);
        let cancelled = Arc::new(AtomicBool::new(false));
        inbox_tx
            .send(Ok(frame))
            .await
            .expect("fresh inbox has capacity");
        shared.streams.lock().insert(
            id,
            StreamCell {
                inbox: inbox_tx,
                cancelled: cancelled.clone(),
            },
        );
        shared
            .metrics
            .streams_accepted
            .fetch_add(1, Ordering::Relaxed);

        let stream = build_stream(id, transport.clone(), shared.clone(), inbox_rx, cancelled);
        if incoming_tx.send(stream).await.is_err() {
            tracing::debug!(stream_id = id, "no dispatcher for inbound stream");
            shared.remove_stream(id);
        }
    } else {
        tracing::trace!(stream_id = id, "dropping unroutable frame");
    }
}

fn fail_open_streams(shared: &Arc<ChannelShared>, error: Option<TransportError>) {
    let cells: Vec<StreamCell> = {
        let mut streams = shared.streams.lock();
        streams.drain().map(|(_, cell)| cell).collect()
    };
    if cells.is_empty() {
        return;
    }
    if error.is_some() {
        shared
            .metrics
            .streams_failed
            .fetch_add(cells.len() as u64, Ordering::Relaxed);
    }
    for cell in cells {
        if error.is_some() {
            let status = Status::unavailable("transport closed with streams in flight");
            let _ = cell.inbox.try_send(Err(RpcError::Status(status)));
        }
        // Dropping the inbox sender ends the receiver's input.
    }
}

/// The send half of one stream.
pub struct StreamSender {
    id: u32,
    transport: Arc<Transport>,
    shared: Arc<ChannelShared>,
    cancelled: Arc<AtomicBool>,
    half_closed: bool,
    _guard: Arc<StreamGuard>,
}

impl StreamSender {
    pub fn stream_id(&self) -> u32 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn max_message_bytes(&self) -> usize {
        self.shared.config.max_message_bytes
    }

    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.half_closed {
            return Err(RpcError::status(
                StatusCode::Internal,
                "send on a closed stream half",
            ));
        }
        if self.is_cancelled() {
            return Err(RpcError::Status(Status::cancelled("stream was cancelled")));
        }
        Ok(())
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), RpcError> {
        let is_message = frame.is_message();
        let weight = frame.flow_weight();
        if frame.end_stream() {
            self.half_closed = true;
        }
        self.transport.send(frame).await?;
        self.shared.metrics.record_sent(is_message, weight);
        Ok(())
    }

    /// Send a metadata frame; `end_stream` makes it a trailer.
    pub async fn send_metadata(&mut self, md: Metadata, end_stream: bool) -> Result<(), RpcError> {
        self.ensure_open()?;
        self.send_frame(Frame::metadata_frame(self.id, md, end_stream))
            .await
    }

    /// Send one message payload.
    pub async fn send_message(&mut self, payload: Bytes, end_stream: bool) -> Result<(), RpcError> {
        self.ensure_open()?;
        let max = self.shared.config.max_message_bytes;
        if payload.len() > max {
            return Err(RpcError::Status(Status::resource_exhausted(format!(
                "message of {} bytes exceeds cap of {max}",
                payload.len()
            ))));
        }
        self.send_frame(Frame::message(self.id, payload, end_stream))
            .await
    }

    /// Half-close without a payload.
    pub async fn finish(&mut self) -> Result<(), RpcError> {
        self.ensure_open()?;
        self.send_frame(Frame::end(self.id)).await
    }

    /// Terminal trailer. Always closes this send half.
    pub async fn send_trailer(&mut self, status: &Status) -> Result<(), RpcError> {
        self.ensure_open()?;
        self.send_frame(Frame::trailer(self.id, status)).await
    }

    /// Cancel the call: emits a reset marker (valid even after this half
    /// finished sending) and discards any inbound frames still in flight.
    pub async fn cancel(&mut self) -> Result<(), RpcError> {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.half_closed = true;
        // Best effort: the transport may already be gone.
        let _ = self.transport.send(Frame::reset(self.id)).await;
        Ok(())
    }

    /// Synchronous best-effort cancellation, used from `Drop` impls.
    pub(crate) fn cancel_from_drop(&mut self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.half_closed = true;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let transport = self.transport.clone();
            let id = self.id;
            handle.spawn(async move {
                let _ = transport.send(Frame::reset(id)).await;
            });
        }
    }
}

impl Drop for StreamSender {
    fn drop(&mut self) {
        // A sender dropped before its half closed is an implicit cancel.
        if !self.half_closed {
            self.cancel_from_drop();
        }
    }
}

/// The receive half of one stream.
pub struct StreamReceiver {
    id: u32,
    rx: mpsc::Receiver<Result<Frame, RpcError>>,
    cancelled: Arc<AtomicBool>,
    saw_end: bool,
    _guard: Arc<StreamGuard>,
}

impl StreamReceiver {
    pub fn stream_id(&self) -> u32 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether an `end_stream` frame has been observed.
    pub fn saw_end(&self) -> bool {
        self.saw_end
    }

    /// Next inbound frame. `None` once the channel is gone (transport
    /// closed) or the call was cancelled locally. An `end_stream` frame is
    /// not terminal for the receiver itself: a reset may still follow it.
    pub async fn recv(&mut self) -> Option<Result<Frame, RpcError>> {
        if self.is_cancelled() {
            // Discard anything already queued.
            while self.rx.try_recv().is_ok() {}
            return None;
        }
        let item = self.rx.recv().await?;
        if let Ok(frame) = &item {
            if frame.end_stream() {
                self.saw_end = true;
            }
        }
        Some(item)
    }

    /// Poll-flavoured [`recv`](Self::recv), for `Stream` impls.
    pub fn poll_recv(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Frame, RpcError>>> {
        use std::task::Poll;
        if self.is_cancelled() {
            while self.rx.try_recv().is_ok() {}
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if let Ok(frame) = &item {
                    if frame.end_stream() {
                        self.saw_end = true;
                    }
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One logical RPC call: a send half and a receive half.
pub struct RpcStream {
    sender: StreamSender,
    receiver: StreamReceiver,
}

impl RpcStream {
    pub fn stream_id(&self) -> u32 {
        self.sender.id
    }

    /// Split into independently-owned halves for concurrent send/receive.
    pub fn split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }

    pub fn state(&self) -> StreamState {
        match (self.sender.half_closed, self.receiver.saw_end) {
            (false, false) => StreamState::Open,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (true, true) => StreamState::Closed,
        }
    }

    pub async fn send_metadata(&mut self, md: Metadata, end_stream: bool) -> Result<(), RpcError> {
        self.sender.send_metadata(md, end_stream).await
    }

    pub async fn send_message(&mut self, payload: Bytes, end_stream: bool) -> Result<(), RpcError> {
        self.sender.send_message(payload, end_stream).await
    }

    pub async fn finish(&mut self) -> Result<(), RpcError> {
        self.sender.finish().await
    }

    pub async fn send_trailer(&mut self, status: &Status) -> Result<(), RpcError> {
        self.sender.send_trailer(status).await
    }

    pub async fn cancel(&mut self) -> Result<(), RpcError> {
        self.sender.cancel().await
    }

    pub async fn recv(&mut self) -> Option<Result<Frame, RpcError>> {
        self.receiver.recv().await
    }

    /// First frame of an inbound stream, which the engine guarantees to be
    /// the initiator's call metadata.
    pub async fn initial_metadata(&mut self) -> Result<Metadata, RpcError> {
        match self.receiver.recv().await {
            Some(Ok(frame)) => match frame.into_body() {
                FrameBody::Metadata(md) => Ok(md),
                _ => Err(RpcError::status(
                    StatusCode::Internal,
                    "stream opened without initial metadata",
                )),
            },
            Some(Err(e)) => Err(e),
            None => Err(RpcError::Transport(TransportError::Closed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata;

    fn mem_channels() -> (Channel, IncomingStreams, Channel, IncomingStreams) {
        let (a, b) = Transport::mem_pair();
        let (ch_a, inc_a) = Channel::start(a, ChannelConfig::default());
        let (ch_b, inc_b) = Channel::start(b, ChannelConfig::default());
        (ch_a, inc_a, ch_b, inc_b)
    }

    #[tokio::test]
    async fn initiator_ids_are_odd_and_increasing() {
        let (ch_a, _inc_a, ch_b, _inc_b) = mem_channels();
        let ids: Vec<u32> = (0..3).map(|_| ch_a.open_stream().stream_id()).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        let ids: Vec<u32> = (0..3).map(|_| ch_b.open_stream().stream_id()).collect();
        assert_eq!(ids, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn metadata_first_frame_opens_peer_stream() {
        let (ch_a, _inc_a, _ch_b, mut inc_b) = mem_channels();

        let mut local = ch_a.open_stream();
        local
            .send_metadata(Metadata::new().with(metadata::PATH, "/Svc/M"), false)
            .await
            .unwrap();
        local
            .send_message(Bytes::from_static(b"req"), true)
            .await
            .unwrap();

        let mut remote = inc_b.next().await.unwrap();
        assert_eq!(remote.stream_id(), 1);
        let md = remote.initial_metadata().await.unwrap();
        assert_eq!(md.get(metadata::PATH), Some("/Svc/M"));

        let frame = remote.recv().await.unwrap().unwrap();
        assert_eq!(frame.payload().unwrap().as_ref(), b"req");
        assert!(frame.end_stream());
        assert!(remote.receiver.saw_end());
    }

    #[tokio::test]
    async fn frames_on_one_stream_keep_order_across_interleaving() {
        let (ch_a, _inc_a, _ch_b, mut inc_b) = mem_channels();

        let mut s1 = ch_a.open_stream();
        let mut s2 = ch_a.open_stream();
        s1.send_metadata(Metadata::new().with(metadata::PATH, "/S/a"), false)
            .await
            .unwrap();
        s2.send_metadata(Metadata::new().with(metadata::PATH, "/S/b"), false)
            .await
            .unwrap();

        // Interleave messages across the two streams.
        for i in 0..5u8 {
            s1.send_message(Bytes::from(vec![1, i]), false).await.unwrap();
            s2.send_message(Bytes::from(vec![2, i]), false).await.unwrap();
        }

        let mut r1 = inc_b.next().await.unwrap();
        let mut r2 = inc_b.next().await.unwrap();
        r1.initial_metadata().await.unwrap();
        r2.initial_metadata().await.unwrap();

        for i in 0..5u8 {
            let f = r1.recv().await.unwrap().unwrap();
            assert_eq!(f.payload().unwrap().as_ref(), &[1, i]);
        }
        for i in 0..5u8 {
            let f = r2.recv().await.unwrap().unwrap();
            assert_eq!(f.payload().unwrap().as_ref(), &[2, i]);
        }
    }

    #[tokio::test]
    async fn oversized_send_is_resource_exhausted() {
        let (a, _b) = Transport::mem_pair();
        let (ch_a, _inc) = Channel::start(
            a,
            ChannelConfig {
                max_message_bytes: 8,
                ..ChannelConfig::default()
            },
        );
        let mut s = ch_a.open_stream();
        s.send_metadata(Metadata::new(), false).await.unwrap();
        let err = s
            .send_message(Bytes::from(vec![0u8; 9]), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::ResourceExhausted);
    }

    #[tokio::test]
    async fn cancellation_discards_late_frames() {
        let (ch_a, _inc_a, _ch_b, mut inc_b) = mem_channels();

        let mut local = ch_a.open_stream();
        local
            .send_metadata(Metadata::new().with(metadata::PATH, "/S/m"), false)
            .await
            .unwrap();

        let mut remote = inc_b.next().await.unwrap();
        remote.initial_metadata().await.unwrap();

        // Responder keeps producing while the caller cancels.
        remote
            .send_message(Bytes::from_static(b"late"), false)
            .await
            .unwrap();
        local.cancel().await.unwrap();
        remote
            .send_message(Bytes::from_static(b"later"), false)
            .await
            .unwrap();

        // All inbound frames after cancellation vanish.
        assert!(local.recv().await.is_none());

        // The responder sees the reset trailer with status cancelled.
        loop {
            let frame = remote.recv().await.unwrap().unwrap();
            if let Some(status) = frame.trailer_status() {
                assert_eq!(status.code(), StatusCode::Cancelled);
                break;
            }
        }
    }

    #[tokio::test]
    async fn reset_after_request_end_still_reaches_responder() {
        let (ch_a, _inc_a, _ch_b, mut inc_b) = mem_channels();

        let mut local = ch_a.open_stream();
        local
            .send_metadata(Metadata::new().with(metadata::PATH, "/Seq/Count"), false)
            .await
            .unwrap();
        // Full request: one message with end_stream, as a streaming caller
        // would send.
        local
            .send_message(Bytes::from_static(b"3"), true)
            .await
            .unwrap();

        let mut remote = inc_b.next().await.unwrap();
        remote.initial_metadata().await.unwrap();
        let req = remote.recv().await.unwrap().unwrap();
        assert!(req.end_stream());

        // The caller changes its mind after its half closed.
        local.cancel().await.unwrap();

        let frame = remote.recv().await.unwrap().unwrap();
        assert_eq!(
            frame.trailer_status().unwrap().code(),
            StatusCode::Cancelled
        );
    }

    #[tokio::test]
    async fn transport_failure_fails_open_streams_with_unavailable() {
        let (a, b) = Transport::mem_pair();
        let (ch_a, _inc_a) = Channel::start(a, ChannelConfig::default());
        let (ch_b, mut inc_b) = Channel::start(b, ChannelConfig::default());

        let mut local = ch_a.open_stream();
        local
            .send_metadata(Metadata::new().with(metadata::PATH, "/S/m"), false)
            .await
            .unwrap();
        let mut remote = inc_b.next().await.unwrap();
        remote.initial_metadata().await.unwrap();

        // Tear the channel down from the other side without a trailer.
        ch_b.close();

        match local.recv().await {
            // Clean end-of-input: the driver above reports the missing
            // trailer; an explicit unavailable error is equally valid.
            None => {}
            Some(Err(e)) => assert_eq!(e.code(), StatusCode::Unavailable),
            Some(Ok(frame)) => panic!("unexpected frame {frame:?}"),
        }
        let _ = ch_a;
    }

    #[tokio::test]
    async fn send_after_end_is_an_engine_error() {
        let (ch_a, _inc_a, _ch_b, _inc_b) = mem_channels();
        let mut s = ch_a.open_stream();
        s.send_metadata(Metadata::new(), false).await.unwrap();
        s.send_message(Bytes::from_static(b"x"), true).await.unwrap();
        let err = s
            .send_message(Bytes::from_static(b"y"), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
    }

    #[tokio::test]
    async fn dropping_a_stream_sends_an_implicit_reset() {
        let (ch_a, _inc_a, _ch_b, mut inc_b) = mem_channels();

        let mut local = ch_a.open_stream();
        local
            .send_metadata(Metadata::new().with(metadata::PATH, "/S/m"), false)
            .await
            .unwrap();
        let mut remote = inc_b.next().await.unwrap();
        remote.initial_metadata().await.unwrap();

        drop(local);

        let frame = remote.recv().await.unwrap().unwrap();
        assert_eq!(
            frame.trailer_status().unwrap().code(),
            StatusCode::Cancelled
        );
    }
}
