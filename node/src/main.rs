// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # ZKredit Node
//!
//! Entry point for the `zkredit-node` binary. Parses CLI arguments, sets up
//! logging and metrics, loads the engine from disk, and serves the REST API.
//!
//! - `run`: start the engine
//! - `init`: create the data directory and the engine signing key
//! - `status`: query a running node's status endpoint
//! - `version`: print build version information

mod api;
mod cli;
mod devnet;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use zkredit_protocol::clock::SystemClock;
use zkredit_protocol::config::{EngineConfig, ENGINE_VERSION};
use zkredit_protocol::crypto::EngineKeypair;
use zkredit_protocol::ledger::AssetLedger;
use zkredit_protocol::storage::Store;
use zkredit_protocol::Orchestrator;

use cli::{Commands, ZkreditNodeCli};
use devnet::{DevChainConnector, DevProver};
use logging::LogFormat;
use metrics::NodeMetrics;

/// Engine key file inside the data directory.
const KEY_FILE: &str = "engine.key";

/// How often the entity gauges are refreshed and lapsed authorizations
/// released.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ZkreditNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Loads the engine and serves the API and metrics until shutdown.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        logging::DEFAULT_FILTER,
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting zkredit-node"
    );

    let config = load_config(args.config.as_deref())?;
    let keypair = match &args.signing_key {
        Some(hex_key) => EngineKeypair::from_hex(hex_key).context("invalid --signing-key")?,
        None => read_key_file(&args.data_dir.join(KEY_FILE))?,
    };

    // --- Persistent storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let store = Store::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    // --- Engine ---
    let clock = SystemClock::shared();
    let chain = Arc::new(DevChainConnector::new(keypair.public_key()));
    let ledger = Arc::new(
        AssetLedger::new(store.clone(), clock.clone()).context("failed to load asset ledger")?,
    );
    let prover = Arc::new(DevProver::new(
        Arc::clone(&ledger),
        Duration::from_millis(args.dev_prover_delay_ms),
    ));
    let engine = Arc::new(
        Orchestrator::assemble(
            ledger,
            store,
            clock,
            config,
            keypair,
            chain.clone(),
            prover,
        )
        .context("failed to load engine")?,
    );
    tracing::warn!("using in-process devnet chain connector and prover");
    tracing::info!(public_key = %engine.public_key(), "engine signing key loaded");

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    node_metrics.observe_stats(&engine.stats());

    let app_state = api::AppState {
        version: format!("{} (engine {})", env!("CARGO_PKG_VERSION"), ENGINE_VERSION),
        started_at: chrono::Utc::now(),
        engine: Arc::clone(&engine),
        metrics: Arc::clone(&node_metrics),
        devnet: Some(chain),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {api_addr}"))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Maintenance ---
    let engine_ref = Arc::clone(&engine);
    let metrics_ref = Arc::clone(&node_metrics);
    let maintenance_loop = tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            interval.tick().await;
            engine_ref.release_lapsed_authorizations();
            metrics_ref.observe_stats(&engine_ref.stats());
        }
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    maintenance_loop.abort();
    if let Err(e) = engine.flush() {
        tracing::error!(error = %e, "failed to flush store on shutdown");
    }
    tracing::info!("zkredit-node stopped");
    Ok(())
}

/// Reads an [`EngineConfig`] from a JSON file, or the defaults.
fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    tracing::info!(path = %path.display(), "engine config loaded");
    Ok(config)
}

fn read_key_file(path: &Path) -> Result<EngineKeypair> {
    if !path.exists() {
        bail!(
            "no engine key at {}; run `zkredit-node init` first or pass --signing-key",
            path.display()
        );
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read engine key {}", path.display()))?;
    EngineKeypair::from_hex(&raw).with_context(|| format!("invalid engine key in {}", path.display()))
}

fn write_key_file(path: &Path, keypair: &EngineKeypair) -> Result<()> {
    std::fs::write(path, keypair.secret_hex())
        .with_context(|| format!("failed to write engine key to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Creates the data directory and a fresh engine signing key.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("zkredit_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path: PathBuf = data_dir.join(KEY_FILE);
    if key_path.exists() && !args.force {
        bail!(
            "{} already exists; pass --force to replace it (outstanding tokens will stop verifying)",
            key_path.display()
        );
    }

    let keypair = EngineKeypair::generate();
    write_key_file(&key_path, &keypair)?;
    let public_key = keypair.public_key().to_hex();
    tracing::info!(public_key = %public_key, key_path = %key_path.display(), "engine key generated");

    println!("Node initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Engine key     : {}", key_path.display());
    println!("  Public key     : {}", public_key);
    Ok(())
}

/// Queries a running node's `/status` and prints it.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let body = http_get(&url).await?;
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{body}"),
    }
    Ok(())
}

/// Plain-HTTP GET over a raw TCP stream. Enough for `status`; no TLS.
async fn http_get(url: &str) -> Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (host, port, path) = split_url(url)?;
    let addr = format!("{host}:{port}");
    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;

    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);

    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_else(|| response.to_string());
    Ok(body)
}

/// Splits `http://host[:port][/path]` into its parts. Port defaults to 80.
fn split_url(url: &str) -> Result<(String, u16, String)> {
    if url.starts_with("https://") {
        bail!("https is not supported by `status`; use plain http");
    }
    let rest = url.strip_prefix("http://").unwrap_or(url);
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .with_context(|| format!("bad port in {url}"))?,
        ),
        None => (authority, 80),
    };
    if host.is_empty() {
        bail!("missing host in {url}");
    }
    Ok((host.to_string(), port, path.to_string()))
}

fn print_version() {
    println!("zkredit-node {}", env!("CARGO_PKG_VERSION"));
    println!("engine       {}", ENGINE_VERSION);
    println!("rustc        {}", option_env!("RUSTC_VERSION").unwrap_or("unknown"));
}

/// Waits for Ctrl+C or SIGTERM. A handler that fails to install is logged
/// and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
