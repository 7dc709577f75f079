//! Diagnostic event model.
//!
//! Events are append-only and fire-and-forget from the producer's point
//! of view; nothing here persists anything.

use serde::{Deserialize, Serialize};

pub use crate::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    Log,
    Trace,
    Latency,
    Stream,
    Error,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// One diagnostic event of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEvent {
    pub kind: DiagnosticKind,
    /// Producing component, e.g. an endpoint label.
    pub source: String,
    /// Log severity; only meaningful for `kind == Log`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    pub timestamp: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DiagnosticEvent {
    fn base(kind: DiagnosticKind, source: impl Into<String>, payload: serde_json::Value) -> Self {
        DiagnosticEvent {
            kind,
            source: source.into(),
            level: None,
            timestamp: now_ms(),
            payload,
        }
    }

    pub fn log(source: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        let mut event = DiagnosticEvent::base(
            DiagnosticKind::Log,
            source,
            serde_json::json!({ "message": message.into() }),
        );
        event.level = Some(level);
        event
    }

    pub fn trace(
        source: impl Into<String>,
        name: impl Into<String>,
        attributes: serde_json::Value,
    ) -> Self {
        DiagnosticEvent::base(
            DiagnosticKind::Trace,
            source,
            serde_json::json!({ "name": name.into(), "attributes": attributes }),
        )
    }

    pub fn latency(source: impl Into<String>, operation: impl Into<String>, millis: f64) -> Self {
        DiagnosticEvent::base(
            DiagnosticKind::Latency,
            source,
            serde_json::json!({ "operation": operation.into(), "millis": millis }),
        )
    }

    pub fn stream_metric(
        source: impl Into<String>,
        stream_id: u32,
        frames: u64,
        bytes: u64,
    ) -> Self {
        DiagnosticEvent::base(
            DiagnosticKind::Stream,
            source,
            serde_json::json!({ "streamId": stream_id, "frames": frames, "bytes": bytes }),
        )
    }

    pub fn error_metric(
        source: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        DiagnosticEvent::base(
            DiagnosticKind::Error,
            source,
            serde_json::json!({ "code": code.into(), "message": message.into() }),
        )
    }

    pub fn resource(source: impl Into<String>, cpu_percent: f64, memory_bytes: u64) -> Self {
        DiagnosticEvent::base(
            DiagnosticKind::Resource,
            source,
            serde_json::json!({ "cpuPercent": cpu_percent, "memoryBytes": memory_bytes }),
        )
    }
}

/// Unary flush payload for non-log events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    pub events: Vec<DiagnosticEvent>,
}

/// Responder acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushAck {
    pub accepted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_event_carries_level_and_message() {
        let event = DiagnosticEvent::log("endpoint-a", LogLevel::Warning, "slow peer");
        assert_eq!(event.kind, DiagnosticKind::Log);
        assert_eq!(event.level, Some(LogLevel::Warning));
        assert_eq!(event.payload["message"], "slow peer");
    }

    #[test]
    fn levels_order_by_severity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Critical);
    }

    #[test]
    fn event_json_roundtrip() {
        let event = DiagnosticEvent::latency("endpoint-a", "unary/Echo", 12.5);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"latency\""));
        let back: DiagnosticEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn non_log_events_omit_level() {
        let json = serde_json::to_string(&DiagnosticEvent::resource("a", 1.0, 2)).unwrap();
        assert!(!json.contains("level"));
    }
}
