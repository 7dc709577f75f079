//! Per-channel counters.
//!
//! Cheap atomics bumped on the hot path; snapshots are taken by stats
//! loops and the diagnostics client. Never backpressures anything.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ChannelMetrics {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub streams_opened: AtomicU64,
    pub streams_accepted: AtomicU64,
    pub streams_failed: AtomicU64,
}

/// Non-atomic copy of [`ChannelMetrics`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelMetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub streams_opened: u64,
    pub streams_accepted: u64,
    pub streams_failed: u64,
}

impl ChannelMetrics {
    pub fn record_sent(&self, is_message: bool, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        if is_message {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
            self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn record_received(&self, is_message: bool, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        if is_message {
            self.messages_received.fetch_add(1, Ordering::Relaxed);
            self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ChannelMetricsSnapshot {
        ChannelMetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_accepted: self.streams_accepted.load(Ordering::Relaxed),
            streams_failed: self.streams_failed.load(Ordering::Relaxed),
        }
    }
}
