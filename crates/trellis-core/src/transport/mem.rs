//! In-process loopback transport.
//!
//! A factory produces two halves whose outbound frames become the peer's
//! inbound frames through a bounded queue. Semantics match a network
//! transport: ordered per stream, flow-controlled, and closing one side
//! drains pending frames before the peer sees end-of-input.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::flow::{DEFAULT_INITIAL_WINDOW, DEFAULT_WINDOW_CAP, FlowWindow};
use crate::status::TransportError;
use crate::transport::{Side, TransportBackend};
use crate::Frame;

const QUEUE_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

struct MemInner {
    side: Side,
    /// Taken (dropped) on close so the peer drains and then sees
    /// end-of-input instead of an error.
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    /// Budget for frames we send; shared with the peer's `recv_window`.
    send_window: Arc<FlowWindow>,
    /// Budget the peer draws on; we refill it as we consume frames.
    recv_window: Arc<FlowWindow>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MemInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemInner")
            .field("side", &self.side)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl MemTransport {
    /// A connected pair with default window sizes: (initiator, acceptor).
    pub fn pair() -> (Self, Self) {
        Self::pair_with_windows(DEFAULT_INITIAL_WINDOW, DEFAULT_WINDOW_CAP)
    }

    /// A connected pair with explicit flow-window sizing, for tests that
    /// need to exercise window exhaustion with small payloads.
    pub fn pair_with_windows(initial: usize, cap: usize) -> (Self, Self) {
        let (tx_to_b, rx_at_b) = mpsc::channel(QUEUE_DEPTH);
        let (tx_to_a, rx_at_a) = mpsc::channel(QUEUE_DEPTH);

        let window_ab = Arc::new(FlowWindow::new(initial, cap));
        let window_ba = Arc::new(FlowWindow::new(initial, cap));

        let a = MemTransport {
            inner: Arc::new(MemInner {
                side: Side::Initiator,
                tx: Mutex::new(Some(tx_to_b)),
                rx: tokio::sync::Mutex::new(rx_at_a),
                send_window: window_ab.clone(),
                recv_window: window_ba.clone(),
                closed: AtomicBool::new(false),
            }),
        };
        let b = MemTransport {
            inner: Arc::new(MemInner {
                side: Side::Acceptor,
                tx: Mutex::new(Some(tx_to_a)),
                rx: tokio::sync::Mutex::new(rx_at_b),
                send_window: window_ba,
                recv_window: window_ab,
                closed: AtomicBool::new(false),
            }),
        };
        (a, b)
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl TransportBackend for MemTransport {
    fn side(&self) -> Side {
        self.inner.side
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let weight = frame.flow_weight();
        if weight > 0 {
            self.inner
                .send_window
                .acquire(weight)
                .await
                .map_err(|status| TransportError::OverWindowCap(status.message().to_string()))?;
        }

        let tx = {
            let guard = self.inner.tx.lock();
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(TransportError::Closed);
        };

        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        let frame = {
            let mut rx = self.inner.rx.lock().await;
            rx.recv().await
        };
        match frame {
            Some(frame) => {
                let weight = frame.flow_weight();
                if weight > 0 {
                    self.inner.recv_window.release(weight);
                }
                Ok(Some(frame))
            }
            // All senders dropped: the peer closed and we drained its
            // outbound queue. End-of-input, not an error.
            None => Ok(None),
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}
