//! Channel-level flow control.
//!
//! One byte window per direction of a channel. Senders acquire the payload
//! size before a message frame goes out and suspend while the window is
//! empty; the receiving side releases bytes back as frames are handed to
//! consumers. When a single message is larger than the whole current
//! window the window grows, up to a hard cap; messages larger than the cap
//! fail with `resource-exhausted`.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::status::{Status, StatusCode};

/// Default initial window: 10 MiB.
pub const DEFAULT_INITIAL_WINDOW: usize = 10 * 1024 * 1024;

/// Default growth cap: 100 MiB.
pub const DEFAULT_WINDOW_CAP: usize = 100 * 1024 * 1024;

#[derive(Debug)]
struct WindowState {
    /// Current window size; grows toward `cap`, never shrinks.
    limit: usize,
    /// Bytes currently available to senders.
    available: usize,
}

/// A byte budget shared between a sender and the matching receiver.
#[derive(Debug)]
pub struct FlowWindow {
    state: Mutex<WindowState>,
    notify: Notify,
    cap: usize,
}

impl FlowWindow {
    pub fn new(initial: usize, cap: usize) -> Self {
        let initial = initial.min(cap);
        FlowWindow {
            state: Mutex::new(WindowState {
                limit: initial,
                available: initial,
            }),
            notify: Notify::new(),
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Current available budget; test and stats use only.
    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Acquire `n` bytes, suspending until the window can cover them.
    ///
    /// A request larger than the cap can never succeed and fails
    /// immediately with `resource-exhausted`.
    pub async fn acquire(&self, n: usize) -> Result<(), Status> {
        if n > self.cap {
            return Err(Status::new(
                StatusCode::ResourceExhausted,
                format!("message of {n} bytes exceeds flow window cap of {}", self.cap),
            ));
        }

        loop {
            // Register for notification before checking, so a release
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if n > state.limit {
                    // One message would exceed the whole window: grow it.
                    let grown = n.min(self.cap);
                    state.available += grown - state.limit;
                    state.limit = grown;
                }
                if state.available >= n {
                    state.available -= n;
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Return `n` bytes to the window.
    pub fn release(&self, n: usize) {
        let mut state = self.state.lock();
        state.available = (state.available + n).min(state.limit);
        drop(state);
        self.notify.notify_waiters();
    }
}

impl Default for FlowWindow {
    fn default() -> Self {
        FlowWindow::new(DEFAULT_INITIAL_WINDOW, DEFAULT_WINDOW_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_within_window_is_immediate() {
        let window = FlowWindow::new(100, 1000);
        window.acquire(60).await.unwrap();
        window.acquire(40).await.unwrap();
        assert_eq!(window.available(), 0);
    }

    #[tokio::test]
    async fn exhausted_window_suspends_until_release() {
        let window = Arc::new(FlowWindow::new(10, 1000));
        window.acquire(10).await.unwrap();

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.acquire(5).await })
        };

        // The waiter cannot make progress yet.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        window.release(10);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn single_large_message_grows_the_window() {
        let window = FlowWindow::new(10, 1000);
        // 500 > limit of 10: the window grows instead of deadlocking.
        window.acquire(500).await.unwrap();
        window.release(500);
        assert_eq!(window.available(), 500);
    }

    #[tokio::test]
    async fn growth_stops_at_the_cap() {
        let window = FlowWindow::new(10, 100);
        window.acquire(100).await.unwrap();
        let err = window.acquire(101).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::ResourceExhausted);
    }

    #[tokio::test]
    async fn release_never_exceeds_limit() {
        let window = FlowWindow::new(50, 1000);
        window.release(500);
        assert_eq!(window.available(), 50);
    }
}
