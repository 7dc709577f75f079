//! Diagnostics sidechannel for trellis RPC.
//!
//! A symmetric contract over the same call shapes as everything else:
//! producers buffer events in a bounded ring, sample and level-filter at
//! source, and flush on an interval with retry; the collector side fans
//! accepted events into a pluggable sink.

use std::time::{SystemTime, UNIX_EPOCH};

mod client;
mod events;
mod service;

pub use client::{DiagnosticsClient, DiagnosticsConfig};
pub use events::{DiagnosticEvent, DiagnosticKind, EventBatch, FlushAck, LogLevel};
pub use service::{DiagnosticsSink, MemorySink, SERVICE_NAME, diagnostics_service};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
