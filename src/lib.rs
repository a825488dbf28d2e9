//! TxPulse - load generation and benchmarking for distributed ledgers
//!
//! TxPulse drives transaction workloads against a ledger adapter at a
//! controlled rate and reports throughput and latency per round.
//!
//! # Architecture
//!
//! - **Rate controllers**: fixed, linear, PID, composite, record/replay and more
//! - **Workers**: run one client's share of a round and stream progress back
//! - **Local mode**: a pool of worker processes on this host
//! - **Distributed mode**: agents on other hosts meet the coordinator in a
//!   hierarchical coordination store
//! - **Statistics**: per-worker results merged into round totals, latency
//!   percentiles from an HDR histogram

pub mod adapter;
pub mod config;
pub mod coordinator;
pub mod distributed;
pub mod flow;
pub mod output;
pub mod protocol;
pub mod rate;
pub mod stats;
pub mod tx;
pub mod util;
pub mod worker;

pub use config::BenchConfig;
pub use tx::TxStatus;

/// Result type used throughout TxPulse
pub type Result<T> = anyhow::Result<T>;
