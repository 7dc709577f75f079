//! Collecting client: ring buffer, sampling, periodic flush with retry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use trellis_core::{CallOptions, ClientEndpoint, RpcError, json};

use crate::events::{DiagnosticEvent, DiagnosticKind, EventBatch, FlushAck, LogLevel};
use crate::service::SERVICE_NAME;

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Identifies this producer in every event.
    pub source: String,
    /// Ring buffer size; the oldest event is dropped on overflow.
    pub buffer_capacity: usize,
    /// Cadence of the background flush loop.
    pub flush_interval: Duration,
    /// Per-kind uniform sampling rate in `0.0..=1.0`; kinds not listed
    /// pass through unsampled.
    pub sampling: HashMap<DiagnosticKind, f64>,
    /// Log events below this level are dropped at source.
    pub min_log_level: LogLevel,
    /// Send attempts per flush before the batch is dropped.
    pub max_retry_count: u32,
    /// Base delay of the exponential backoff between attempts.
    pub retry_backoff: Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        DiagnosticsConfig {
            source: "trellis".to_string(),
            buffer_capacity: 100,
            flush_interval: Duration::from_secs(5),
            sampling: HashMap::new(),
            min_log_level: LogLevel::Debug,
            max_retry_count: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

struct ClientInner {
    endpoint: ClientEndpoint,
    config: DiagnosticsConfig,
    queue: Mutex<VecDeque<DiagnosticEvent>>,
    /// Events lost to ring overflow or exhausted retries.
    dropped: AtomicU64,
}

/// Buffers diagnostic events and ships them to a collector endpoint.
#[derive(Clone)]
pub struct DiagnosticsClient {
    inner: Arc<ClientInner>,
}

impl DiagnosticsClient {
    pub fn new(endpoint: ClientEndpoint, config: DiagnosticsConfig) -> Self {
        DiagnosticsClient {
            inner: Arc::new(ClientInner {
                endpoint,
                config,
                queue: Mutex::new(VecDeque::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.inner.config
    }

    /// Events lost so far (overflow + failed flushes).
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Queue one event, applying level filtering and sampling.
    pub fn emit(&self, event: DiagnosticEvent) {
        if event.kind == DiagnosticKind::Log {
            if let Some(level) = event.level {
                if level < self.inner.config.min_log_level {
                    return;
                }
            }
        }
        if let Some(&rate) = self.inner.config.sampling.get(&event.kind) {
            if rand::thread_rng().r#gen::<f64>() >= rate {
                return;
            }
        }

        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.config.buffer_capacity {
            queue.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(DiagnosticEvent::log(
            self.inner.config.source.clone(),
            level,
            message,
        ));
    }

    pub fn latency(&self, operation: impl Into<String>, millis: f64) {
        self.emit(DiagnosticEvent::latency(
            self.inner.config.source.clone(),
            operation,
            millis,
        ));
    }

    pub fn error_metric(&self, code: impl Into<String>, message: impl Into<String>) {
        self.emit(DiagnosticEvent::error_metric(
            self.inner.config.source.clone(),
            code,
            message,
        ));
    }

    pub fn resource(&self, cpu_percent: f64, memory_bytes: u64) {
        self.emit(DiagnosticEvent::resource(
            self.inner.config.source.clone(),
            cpu_percent,
            memory_bytes,
        ));
    }

    pub fn stream_metric(&self, stream_id: u32, frames: u64, bytes: u64) {
        self.emit(DiagnosticEvent::stream_metric(
            self.inner.config.source.clone(),
            stream_id,
            frames,
            bytes,
        ));
    }

    pub fn trace(&self, name: impl Into<String>, attributes: serde_json::Value) {
        self.emit(DiagnosticEvent::trace(
            self.inner.config.source.clone(),
            name,
            attributes,
        ));
    }

    /// Drain and ship the buffer: logs through the `streamLogs` stream,
    /// traces through `traceEvent`, everything else batched through
    /// `sendMetrics`. Returns the number of events delivered.
    pub async fn flush(&self) -> Result<usize, RpcError> {
        let batch: Vec<DiagnosticEvent> = {
            let mut queue = self.inner.queue.lock();
            queue.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let total = batch.len();
        match self.try_flush_with_retry(&batch).await {
            Ok(()) => Ok(total),
            Err(e) => {
                self.inner
                    .dropped
                    .fetch_add(total as u64, Ordering::Relaxed);
                tracing::warn!(error = %e, dropped = total, "diagnostics flush failed, batch dropped");
                Err(e)
            }
        }
    }

    async fn try_flush_with_retry(&self, batch: &[DiagnosticEvent]) -> Result<(), RpcError> {
        let mut attempt = 0u32;
        loop {
            match self.send_batch(batch).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.inner.config.max_retry_count {
                        return Err(e);
                    }
                    let delay = self.inner.config.retry_backoff * 2u32.pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_batch(&self, batch: &[DiagnosticEvent]) -> Result<(), RpcError> {
        let logs: Vec<&DiagnosticEvent> = batch
            .iter()
            .filter(|e| e.kind == DiagnosticKind::Log)
            .collect();
        let traces: Vec<&DiagnosticEvent> = batch
            .iter()
            .filter(|e| e.kind == DiagnosticKind::Trace)
            .collect();
        let metrics: Vec<DiagnosticEvent> = batch
            .iter()
            .filter(|e| !matches!(e.kind, DiagnosticKind::Log | DiagnosticKind::Trace))
            .cloned()
            .collect();

        if !logs.is_empty() {
            let mut call = self
                .inner
                .endpoint
                .client_streaming(
                    SERVICE_NAME,
                    "streamLogs",
                    Arc::new(json::<DiagnosticEvent>()),
                    Arc::new(json::<FlushAck>()),
                    CallOptions::default(),
                )
                .await?;
            for event in logs {
                call.send(event).await?;
            }
            call.finish().await?;
        }

        for event in traces {
            let _: FlushAck = self
                .inner
                .endpoint
                .unary(
                    SERVICE_NAME,
                    "traceEvent",
                    Arc::new(json::<DiagnosticEvent>()),
                    Arc::new(json::<FlushAck>()),
                    event,
                    CallOptions::default(),
                )
                .await?;
        }

        if !metrics.is_empty() {
            let _: FlushAck = self
                .inner
                .endpoint
                .unary(
                    SERVICE_NAME,
                    "sendMetrics",
                    Arc::new(json::<EventBatch>()),
                    Arc::new(json::<FlushAck>()),
                    &EventBatch { events: metrics },
                    CallOptions::default(),
                )
                .await?;
        }

        Ok(())
    }

    /// Background flush on the configured interval.
    pub fn spawn_flush_loop(&self) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.inner.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let _ = client.flush().await;
            }
        })
    }
}
