//! crucible-worker - sandboxed code execution worker.
//!
//! Dials the backend (or accepts backend connections) and serves one
//! build-env: requests arrive over a framed duplex channel, sources are
//! staged to disk, and the resolved stage chain runs under the sandbox
//! wrapper with output streamed back. All request logic lives in the
//! library crate; this binary wires up the CLI, logging, the health
//! endpoint, and the connection loops.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crucible_core::rules::{BuildStages, RulesStore};
use crucible_worker::config::WorkerConfig;
use crucible_worker::transport::handle_connection;

/// Delay between reconnect attempts in dial mode.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// crucible worker - drives user sources through sandboxed build stages
#[derive(Parser, Debug)]
#[command(name = "crucible-worker")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory with .json or .yaml rules files
    #[arg(long, value_name = "DIR")]
    rules_dir: PathBuf,

    /// Name of the build-env (rules file stem) served by this worker
    #[arg(long, value_name = "NAME")]
    build_env: String,

    /// Backend address to dial (mutually exclusive with --listen-addr)
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "listen_addr")]
    backend_addr: Option<String>,

    /// Listen interface and port
    #[arg(long, value_name = "IP:PORT", default_value = "0.0.0.0:1556")]
    listen_addr: String,

    /// Verbosity level: panic, fatal, error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Address of the HTTP health endpoint
    #[arg(long, value_name = "IP:PORT", default_value = "0.0.0.0:9100")]
    health_addr: String,

    /// Staging directory for ingested source files
    #[arg(long, value_name = "DIR", default_value = "/tmp/sources")]
    sources_dir: PathBuf,

    /// Combined decoded source size budget per request, in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 8000)]
    sources_size_limit: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let store = RulesStore::load_dir(&args.rules_dir).context("failed to load rules")?;
    let rules: Arc<BuildStages> = Arc::new(
        store
            .get(&args.build_env)
            .map(Clone::clone)
            .with_context(|| {
                format!(
                    "build-env {:?} not found in {}",
                    args.build_env,
                    args.rules_dir.display()
                )
            })?,
    );
    info!(
        build_env = %args.build_env,
        stages = rules.stages().len(),
        "rules loaded"
    );

    let config = Arc::new(WorkerConfig {
        sources_dir: args.sources_dir,
        sources_size_limit_bytes: args.sources_size_limit,
    });
    config.check().context("config error")?;

    tokio::spawn(serve_health(args.health_addr.clone()));

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let serve = async {
        match args.backend_addr {
            Some(backend_addr) => dial_backend(backend_addr, rules, config).await,
            None => accept_backends(args.listen_addr, rules, config).await,
        }
    };

    tokio::select! {
        result = serve => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            Ok(())
        }
    }
}

fn init_tracing(level: &str) -> Result<()> {
    // panic/fatal are accepted for CLI parity and map onto error.
    let level = match level {
        "panic" | "fatal" => "error",
        "error" | "warn" | "info" | "debug" | "trace" => level,
        other => bail!("failed to parse log-level {other:?}"),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

/// Dial the backend and reconnect forever with a fixed backoff.
async fn dial_backend(
    addr: String,
    rules: Arc<BuildStages>,
    config: Arc<WorkerConfig>,
) -> Result<()> {
    info!("auto-connect to backend mode, will dial to: {addr}");

    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!("connected to the backend {addr}");
                handle_connection(stream, Arc::clone(&rules), Arc::clone(&config)).await;
                info!("backend connection closed");
            }
            Err(e) => {
                error!("failed to connect to {addr}: {e}");
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Accept backend connections; each one gets its own handler task.
async fn accept_backends(
    addr: String,
    rules: Arc<BuildStages>,
    config: Arc<WorkerConfig>,
) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    info!("stay and listen mode, listening on: {addr}");

    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        info!(%peer, "backend connected");
        tokio::spawn(handle_connection(
            stream,
            Arc::clone(&rules),
            Arc::clone(&config),
        ));
    }
}

async fn serve_health(addr: String) {
    let app = Router::new().route("/health", get(|| async { StatusCode::OK }));
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind health endpoint on {addr}: {e}");
            return;
        }
    };
    info!("health endpoint listening on {addr}");
    if let Err(e) = axum::serve(listener, app).await {
        error!("health endpoint failed: {e}");
    }
}
