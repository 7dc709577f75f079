//! Collector-side contract: receives diagnostic events and hands them to
//! a pluggable sink. Nothing is persisted here; storage belongs to
//! whatever sink a deployment wires in.

use std::sync::Arc;

use futures_util::StreamExt;
use trellis_core::{RegistryError, RequestStream, ServiceRegistry, Status, json};

use crate::events::{DiagnosticEvent, DiagnosticKind, EventBatch, FlushAck};

/// Service name the collector registers under.
pub const SERVICE_NAME: &str = "trellis.Diagnostics";

/// Receives accepted events. Implementations must be cheap; they run on
/// the dispatch path.
pub trait DiagnosticsSink: Send + Sync + 'static {
    fn on_event(&self, event: &DiagnosticEvent);
}

/// Build the collector contract around a sink.
pub fn diagnostics_service(
    sink: Arc<dyn DiagnosticsSink>,
) -> Result<ServiceRegistry, RegistryError> {
    let mut registry = ServiceRegistry::new();
    let mut svc = registry.service(SERVICE_NAME)?;

    let s = sink.clone();
    svc.client_streaming(
        "streamLogs",
        Arc::new(json::<DiagnosticEvent>()),
        Arc::new(json::<FlushAck>()),
        move |_ctx, mut events: RequestStream<DiagnosticEvent>| {
            let sink = s.clone();
            async move {
                let mut accepted = 0usize;
                while let Some(event) = events.next().await {
                    let event = event?;
                    if event.kind != DiagnosticKind::Log {
                        return Err(Status::invalid_argument(
                            "streamLogs accepts only log events",
                        ));
                    }
                    sink.on_event(&event);
                    accepted += 1;
                }
                Ok(FlushAck { accepted })
            }
        },
    )?;

    let s = sink.clone();
    svc.unary(
        "sendMetrics",
        Arc::new(json::<EventBatch>()),
        Arc::new(json::<FlushAck>()),
        move |_ctx, batch: EventBatch| {
            let sink = s.clone();
            async move {
                for event in &batch.events {
                    sink.on_event(event);
                }
                Ok(FlushAck {
                    accepted: batch.events.len(),
                })
            }
        },
    )?;

    let s = sink.clone();
    svc.unary(
        "traceEvent",
        Arc::new(json::<DiagnosticEvent>()),
        Arc::new(json::<FlushAck>()),
        move |_ctx, event: DiagnosticEvent| {
            let sink = s.clone();
            async move {
                expect_kind(&event, DiagnosticKind::Trace)?;
                sink.on_event(&event);
                Ok(FlushAck { accepted: 1 })
            }
        },
    )?;

    // Per-kind metric endpoints.
    for (method, kind) in [
        ("reportLatency", DiagnosticKind::Latency),
        ("reportError", DiagnosticKind::Error),
        ("reportResource", DiagnosticKind::Resource),
        ("reportStream", DiagnosticKind::Stream),
    ] {
        let s = sink.clone();
        svc.unary(
            method,
            Arc::new(json::<DiagnosticEvent>()),
            Arc::new(json::<FlushAck>()),
            move |_ctx, event: DiagnosticEvent| {
                let sink = s.clone();
                async move {
                    expect_kind(&event, kind)?;
                    sink.on_event(&event);
                    Ok(FlushAck { accepted: 1 })
                }
            },
        )?;
    }

    Ok(registry)
}

fn expect_kind(event: &DiagnosticEvent, kind: DiagnosticKind) -> Result<(), Status> {
    if event.kind != kind {
        return Err(Status::invalid_argument(format!(
            "expected a {kind:?} event, got {:?}",
            event.kind
        )));
    }
    Ok(())
}

/// Sink that remembers everything; test and demo use.
#[derive(Default)]
pub struct MemorySink {
    events: parking_lot::Mutex<Vec<DiagnosticEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(MemorySink::default())
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl DiagnosticsSink for MemorySink {
    fn on_event(&self, event: &DiagnosticEvent) {
        self.events.lock().push(event.clone());
    }
}
