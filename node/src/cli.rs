//! # CLI Interface
//!
//! Command-line arguments for `zkredit-node`, built with `clap` derive.
//! Subcommands: `run`, `init`, `status` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use zkredit_protocol::config::{DEFAULT_API_PORT, DEFAULT_METRICS_PORT};

/// ZKredit engine node.
///
/// Hosts the credit and authorization engine behind a REST API, with
/// Prometheus metrics and in-process devnet collaborators.
#[derive(Parser, Debug)]
#[command(
    name = "zkredit-node",
    about = "ZKredit engine node",
    version,
    propagate_version = true
)]
pub struct ZkreditNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine and serve the API.
    Run(RunArgs),
    /// Create the data directory and generate the engine signing key.
    Init(InitArgs),
    /// Query the status of a running node.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Engine configuration file (JSON). Defaults apply when omitted.
    #[arg(long, short = 'c', env = "ZKREDIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory holding the database and the engine key.
    #[arg(long, short = 'd', env = "ZKREDIT_DATA_DIR", default_value = "./zkredit-data")]
    pub data_dir: PathBuf,

    /// Port for the REST API.
    #[arg(long, env = "ZKREDIT_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "ZKREDIT_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "ZKREDIT_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Hex-encoded Ed25519 engine signing key.
    ///
    /// Read from `engine.key` in the data directory when omitted.
    #[arg(long, env = "ZKREDIT_SIGNING_KEY")]
    pub signing_key: Option<String>,

    /// Simulated prover latency for the devnet prover, in milliseconds.
    #[arg(long, env = "ZKREDIT_DEV_PROVER_DELAY_MS", default_value_t = 250)]
    pub dev_prover_delay_ms: u64,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "ZKREDIT_DATA_DIR", default_value = "./zkredit-data")]
    pub data_dir: PathBuf,

    /// Overwrite an existing engine key.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// API endpoint of the running node.
    #[arg(long, default_value = "http://127.0.0.1:9841")]
    pub api_url: String,
}
