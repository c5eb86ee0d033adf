// ABOUTME: CLI argument parsing and command routing for stdb-probe
//
// Provides command-line tools for:
// - Decoding a hex frame into its value tree (decode)
// - Printing the subscribe frame a query list would produce (subscribe-frame)
// - Validating a client config file (check-config)

pub mod check_config;
pub mod decode;
pub mod frame;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Inspect BSATN frames and client configuration
#[derive(Parser)]
#[command(name = "stdb-probe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Tracing filter, e.g. `debug` or `stdb_client=trace`
    #[arg(long, global = true, default_value = "stdb_client=info")]
    pub log_level: String,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Decode a hex-encoded frame
    Decode(DecodeArgs),

    /// Print the subscribe frame for a list of queries
    SubscribeFrame(FrameArgs),

    /// Load and validate a TOML client config
    CheckConfig(CheckConfigArgs),
}

/// Arguments for the decode command
#[derive(clap::Args)]
pub struct DecodeArgs {
    /// Frame bytes as hex; whitespace is ignored
    pub hex: String,

    /// Interpret the value as a server message
    #[arg(long)]
    pub server: bool,
}

/// Arguments for the subscribe-frame command
#[derive(clap::Args)]
pub struct FrameArgs {
    /// Queries to subscribe to
    #[arg(required = true)]
    pub queries: Vec<String>,

    /// Force the batched multi-query frame
    #[arg(long, conflicts_with = "single")]
    pub multi: bool,

    /// Force one frame per query
    #[arg(long)]
    pub single: bool,

    /// Request id to stamp on the first frame
    #[arg(long, default_value_t = 1)]
    pub request_id: u32,

    /// Query id to stamp on every frame
    #[arg(long, default_value_t = 1)]
    pub query_id: u32,

    /// Batch when more than this many queries are given
    #[arg(long, default_value_t = 5)]
    pub threshold: usize,
}

/// Arguments for the check-config command
#[derive(clap::Args)]
pub struct CheckConfigArgs {
    /// Path to the TOML file
    pub path: PathBuf,
}
