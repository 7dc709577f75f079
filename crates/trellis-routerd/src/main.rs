//! Standalone router daemon.
//!
//! Binds the configured listeners, serves the router contract on every
//! accepted connection, and optionally logs periodic stats. Exits 0 on
//! ctrl-c, non-zero on bind failure or a fatal configuration error.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use trellis_core::{Server, Side, Transport};
use trellis_router::{Router, RouterConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    Http2,
    Websocket,
    Memory,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            // tracing has no critical level; error is the closest.
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "trellis-routerd", about = "Federated trellis router daemon")]
struct Args {
    /// Interface to bind network listeners on.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Primary listen port.
    #[arg(long, default_value_t = 7600)]
    port: u16,

    /// Listener kinds to start; repeatable.
    #[arg(long = "transport", value_enum, default_values = ["websocket"])]
    transports: Vec<TransportKind>,

    /// Seconds without a heartbeat before a client record is evicted.
    #[arg(long = "client-timeout", default_value_t = 300)]
    client_timeout: u64,

    /// Seconds between router heartbeats on each P2P stream.
    #[arg(long = "heartbeat-interval", default_value_t = 20)]
    heartbeat_interval: u64,

    /// Log periodic routing stats.
    #[arg(long)]
    stats: bool,

    #[arg(long = "log-level", value_enum, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_filter())),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<(), String> {
    if args.transports.is_empty() {
        return Err("no transports configured".into());
    }
    if args.transports.contains(&TransportKind::Http2) {
        return Err(
            "the http2 adapter is not linked into this build; use --transport websocket".into(),
        );
    }

    let router = Router::start(RouterConfig {
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        client_timeout: Duration::from_secs(args.client_timeout),
        ..RouterConfig::default()
    });
    let server = Server::new(
        router
            .contract()
            .map_err(|e| format!("router contract: {e}"))?,
    );

    // Loopback halves stay alive until shutdown.
    let mut loopbacks = Vec::new();
    for kind in &args.transports {
        match kind {
            TransportKind::Websocket => {
                let addr = format!("{}:{}", args.host, args.port);
                let listener = tokio::net::TcpListener::bind(&addr)
                    .await
                    .map_err(|e| format!("failed to bind {addr}: {e}"))?;
                tracing::info!(%addr, "websocket listener up");
                let server = server.clone();
                tokio::spawn(accept_websocket(listener, server));
            }
            TransportKind::Memory => {
                // In-process loopback, mostly useful for smoke runs with
                // --stats.
                let (client_side, server_side) = Transport::mem_pair();
                loopbacks.push(client_side);
                tracing::info!("in-process loopback transport up");
                let server = server.clone();
                tokio::spawn(async move { server.serve(server_side).await });
            }
            TransportKind::Http2 => unreachable!("rejected above"),
        }
    }

    if args.stats {
        let router = router.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                let stats = router.metrics();
                tracing::info!(
                    clients = stats.clients_online,
                    routed = stats.messages_routed,
                    events = stats.events_emitted,
                    evicted = stats.clients_evicted,
                    "router stats"
                );
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to wait for ctrl-c: {e}"))?;
    tracing::info!("shutting down");
    drop(loopbacks);
    Ok(())
}

async fn accept_websocket(listener: tokio::net::TcpListener, server: Server) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let server = server.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(socket).await {
                Ok(ws) => {
                    tracing::debug!(%peer, "websocket connection up");
                    let transport = Transport::websocket(ws, Side::Acceptor);
                    server.serve(transport).await;
                    tracing::debug!(%peer, "connection closed");
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "websocket handshake failed");
                }
            }
        });
    }
}
