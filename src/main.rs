//! jsonrpc-hub: JSON-RPC server over TCP and Unix sockets
//!
//! Serves NUL-delimited JSON-RPC and its WebSocket-framed variant on the
//! same ports, with a publish/subscribe notify channel alongside. The demo
//! method set is small; it exists to exercise the transport end to end.
//!
//! Usage:
//!   jsonrpc-hub                                  # 127.0.0.1:7070, auto-detected framing
//!   jsonrpc-hub --port 8080 --mode websocket     # WebSocket only
//!   jsonrpc-hub --unix /tmp/hub.sock --no-tcp    # Unix socket only

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use jrpc_protocol::RpcError;
use jrpc_server::{RpcServer, parse_params};
use jrpc_transport::{
    CancellationToken, ConnectionId, Hooks, Listener, Notifier, PeerAddr, ProtocolMode,
    TransportConfig, TransportServer,
};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

const CLOCK_SERVICE: &str = "clock";
const CLOCK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "jsonrpc-hub", about = "jsonrpc-hub: JSON-RPC over TCP, Unix sockets and WebSocket")]
struct Cli {
    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Also listen on this Unix domain socket
    #[arg(long)]
    unix: Option<PathBuf>,

    /// Do not open the TCP listener
    #[arg(long)]
    no_tcp: bool,

    /// Framing on accepted connections: json, websocket or auto
    #[arg(long, default_value = "auto")]
    mode: ProtocolMode,

    /// Buffered request bytes at which pending input is dropped
    #[arg(long, default_value_t = 100_000_000)]
    max_request_len: usize,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn transport_config(&self) -> TransportConfig {
        let mut listeners = Vec::new();
        if !self.no_tcp {
            listeners.push(Listener::tcp(self.host.clone(), self.port));
        }
        if let Some(ref path) = self.unix {
            listeners.push(Listener::unix(path.clone()));
        }
        TransportConfig {
            listeners,
            mode: self.mode,
            max_request_len: self.max_request_len,
            ..TransportConfig::default()
        }
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let (writer, ansi) = match cli.log_file {
        Some(ref log_path) => {
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
            eprintln!("Logging to {}", log_path.display());
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(ansi)
            .init();
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Demo methods
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counter {
    value: i64,
}

fn demo_router() -> Result<RpcServer> {
    let mut router = RpcServer::new();

    router.register_function("hello", |params: &Value| match params {
        Value::Array(items) => Ok(items.first().cloned().unwrap_or(Value::Null)),
        other => Ok(other.clone()),
    });
    router.register_function("echo", |params: &Value| Ok(params.clone()));

    router.register_class_object("Counter", Counter::default());
    router.register_member_function("Counter.incr", |counter: &mut Counter, params: &Value| {
        let (step,): (Option<i64>,) = match params {
            Value::Array(items) if items.is_empty() => (None,),
            Value::Null => (None,),
            other => parse_params(other)?,
        };
        counter.value = counter
            .value
            .checked_add(step.unwrap_or(1))
            .ok_or_else(|| RpcError::invalid_params("counter overflow"))?;
        Ok(json!(counter.value))
    })?;
    router.register_member_function("Counter.get", |counter: &mut Counter, _: &Value| {
        Ok(json!(counter.value))
    })?;

    Ok(router)
}

// ─────────────────────────────────────────────────────────────────────────────
// Hooks
// ─────────────────────────────────────────────────────────────────────────────

/// Publishes the `clock` service and traces connection churn.
struct DemoHooks {
    last_tick: Option<Instant>,
}

impl Hooks for DemoHooks {
    fn on_client_connected(&mut self, id: ConnectionId, peer: &PeerAddr) {
        debug!("Demo hooks: {id} from {peer}");
    }

    fn on_client_closed(&mut self, id: ConnectionId) {
        debug!("Demo hooks: {id} gone");
    }

    fn on_processed(&mut self, notifier: &mut Notifier<'_>) {
        if self.last_tick.is_some_and(|last| last.elapsed() < CLOCK_PERIOD) {
            return;
        }
        self.last_tick = Some(Instant::now());
        if notifier.subscriber_count(CLOCK_SERVICE) == 0 {
            return;
        }
        let tick = json!({
            "service": CLOCK_SERVICE,
            "time": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = notifier.dispatch(CLOCK_SERVICE, &tick) {
            warn!("Clock notification failed: {e}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let mut server = TransportServer::bind(cli.transport_config()).context("Failed to start transport")?;
    server.register_notify_services([CLOCK_SERVICE])?;

    println!();
    println!("  jsonrpc-hub");
    println!();
    if let Some(addr) = server.local_addr() {
        println!("  TCP:        {addr}");
    }
    if let Some(path) = server.unix_path() {
        println!("  Unix:       {}", path.display());
    }
    println!("  Mode:       {:?}", cli.mode);
    println!("  Notify:     {CLOCK_SERVICE}");
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    let mut router = demo_router()?;
    let mut hooks = DemoHooks { last_tick: None };
    let cancel = CancellationToken::new();

    let loop_cancel = cancel.clone();
    let mut event_loop = tokio::task::spawn_blocking(move || {
        server.serve(&mut router, &mut hooks, &loop_cancel)
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Shutting down");
            cancel.cancel();
            event_loop.await??;
        }
        finished = &mut event_loop => {
            finished??;
        }
    }

    println!("  Server stopped.");
    Ok(())
}
