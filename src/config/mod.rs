//! Configuration module
//!
//! Handles CLI argument parsing, the TOML benchmark file, and validation.
//!
//! # Example
//!
//! ```toml
//! [clients]
//! type = "local"
//! number = 4
//!
//! [adapter]
//! name = "mock"
//! latency_ms = 20
//!
//! [test]
//! name = "simple"
//!
//! [[test.rounds]]
//! label = "open"
//! tx_number = [1000, 2000]
//! rate_control = [
//!     { type = "fixed-rate", opts = { tps = 100 } },
//!     { type = "fixed-rate", opts = { tps = 200 } },
//! ]
//! callback = "simple-open"
//! arguments = { money = 10000 }
//! ```

pub mod cli;
pub mod toml;
pub mod validator;

use crate::protocol::RateControlSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Complete benchmark configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub clients: ClientsConfig,
    pub adapter: AdapterConfig,
    pub test: TestConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// How workers are provided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    /// Child processes on this host
    #[default]
    Local,
    /// Agents registered in a coordination store
    Distributed,
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMode::Local => write!(f, "local"),
            ClientMode::Distributed => write!(f, "distributed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientsConfig {
    #[serde(rename = "type", default)]
    pub mode: ClientMode,

    /// Local worker processes, or agents to wait for in distributed mode
    #[serde(default = "default_clients")]
    pub number: usize,

    /// Coordination store address (distributed mode)
    #[serde(default)]
    pub store: Option<String>,

    /// Root node of the store layout
    #[serde(default = "default_root")]
    pub root: String,

    /// Seconds to wait for agents to register
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,

    /// Command launching a local worker; defaults to this executable in worker mode
    #[serde(default)]
    pub worker_command: Option<Vec<String>>,

    /// Out-of-band commit confirmation (local mode)
    #[serde(default)]
    pub confirmation: Option<ConfirmationConfig>,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            mode: ClientMode::default(),
            number: default_clients(),
            store: None,
            root: default_root(),
            agent_timeout_secs: default_agent_timeout(),
            worker_command: None,
            confirmation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// Address the confirmation listener binds to
    pub listen: String,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

/// Backend adapter selection; every key besides `name` is passed to the adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub name: String,

    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl AdapterConfig {
    /// The adapter reference carried in round messages
    pub fn reference(&self) -> String {
        if self.options.is_empty() {
            return self.name.clone();
        }
        let mut object = self.options.clone();
        object.insert("name".to_string(), serde_json::Value::String(self.name.clone()));
        serde_json::Value::Object(object).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default = "default_test_name")]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Seconds to pause between rounds
    #[serde(default = "default_pause")]
    pub pause_secs: u64,

    pub rounds: Vec<RoundConfig>,
}

/// One labelled test; expands into one round per `tx_number`/`tx_duration` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundConfig {
    pub label: String,

    #[serde(default)]
    pub tx_number: Vec<u64>,

    /// Seconds
    #[serde(default)]
    pub tx_duration: Vec<u64>,

    /// One per round, or empty for the default fixed rate
    #[serde(default)]
    pub rate_control: Vec<RateControlSpec>,

    /// Leading/trailing transactions (count rounds) or seconds (duration rounds) to drop
    #[serde(default)]
    pub trim: u64,

    #[serde(default)]
    pub arguments: serde_json::Value,

    /// Workload name
    pub callback: String,

    /// Report raw submissions for out-of-band confirmation
    #[serde(default)]
    pub confirmation: bool,
}

impl RoundConfig {
    /// Number of rounds this test expands into
    pub fn round_count(&self) -> usize {
        self.tx_number.len().max(self.tx_duration.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Write a JSON report here
    #[serde(default)]
    pub json: Option<PathBuf>,
}

fn default_clients() -> usize {
    1
}

fn default_root() -> String {
    crate::distributed::agent::DEFAULT_ROOT.to_string()
}

fn default_agent_timeout() -> u64 {
    60
}

fn default_retry_interval() -> u64 {
    5
}

fn default_test_name() -> String {
    "benchmark".to_string()
}

fn default_pause() -> u64 {
    5
}
