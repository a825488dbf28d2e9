//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Standalone mode (default) - run the benchmark with local worker processes
    Standalone,
    /// Worker mode - serve rounds over stdin/stdout (spawned by standalone mode)
    Worker,
    /// Agent mode - register in the coordination store and serve rounds from it
    Agent,
    /// Coordinator mode - run the benchmark on registered agents
    Coordinator,
    /// Store mode - run the TCP coordination store
    Store,
}

/// TxPulse - load generation and benchmarking for distributed ledgers
#[derive(Parser, Debug)]
#[command(name = "txpulse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode
    #[arg(long, value_enum, default_value = "standalone")]
    pub mode: ExecutionMode,

    /// Benchmark configuration file (standalone and coordinator modes)
    #[arg(value_name = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Coordination store address (agent and coordinator modes)
    #[arg(long, env = "TXPULSE_STORE")]
    pub store: Option<String>,

    /// Address the coordination store listens on (store mode only)
    #[arg(long, default_value = "127.0.0.1:2181")]
    pub listen: String,

    /// Root node of the store layout
    #[arg(long)]
    pub root: Option<String>,

    /// Number of local workers, or agents to wait for
    #[arg(short = 'c', long)]
    pub clients: Option<usize>,

    /// Seconds to pause between rounds
    #[arg(long)]
    pub pause: Option<u64>,

    /// Write a JSON report to this file
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    /// Address for the confirmation listener (enables confirmation settings)
    #[arg(long)]
    pub confirmation_listen: Option<String>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, env = "TXPULSE_LOG", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
