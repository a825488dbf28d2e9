//! Backend adapter and workload contracts
//!
//! An [`Adapter`] hides the ledger-specific SDK: it installs contracts, prepares
//! per-client material and submits transactions, reporting each outcome as a
//! [`TxStatus`]. A [`Workload`] is the user-defined callback that decides what a
//! single iteration submits through the adapter.
//!
//! # Architecture
//!
//! Both are resolved by name from the round message: `config` selects the
//! adapter through an [`AdapterRegistry`], `cb` selects the workload through a
//! [`WorkloadRegistry`]. The worker runner depends only on these traits.
//!
//! The `config` reference is either a bare adapter name (`"mock"`) or a JSON
//! object carrying the name and its options (`{"name":"mock","latency_ms":20}`).
//!
//! # Lifecycle
//!
//! Coordinator side, once per benchmark:
//! 1. [`Adapter::init`]
//! 2. [`Adapter::install_smart_contract`]
//! 3. [`Adapter::prepare_clients`] (one material entry per client)
//!
//! Worker side, once per round:
//! 1. [`Adapter::get_context`]
//! 2. [`Workload::init`], then [`Workload::run`] once per iteration
//! 3. [`Workload::end`] and [`Adapter::release_context`]

pub mod mock;
pub mod workloads;

use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::Result;
use anyhow::Context as _;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-round execution context handed out by an adapter
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterContext {
    /// Round label the context was requested for
    pub name: String,

    /// 0-based client index
    pub client_idx: usize,

    /// Adapter-specific state (client material, connection hints, ...)
    pub data: serde_json::Value,
}

/// Ledger backend contract
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn init(&self) -> Result<()>;

    async fn install_smart_contract(&self) -> Result<()>;

    /// Material for each of `number` clients, indexed by client
    async fn prepare_clients(&self, number: usize) -> Result<Vec<serde_json::Value>>;

    async fn get_context(&self, name: &str, args: &serde_json::Value, client_idx: usize) -> Result<AdapterContext>;

    async fn release_context(&self, context: AdapterContext) -> Result<()>;

    /// Submit a transaction; transaction-level failures are reported in the
    /// returned statuses, not as errors
    async fn invoke_smart_contract(
        &self,
        context: &AdapterContext,
        contract_id: &str,
        version: &str,
        args: &serde_json::Value,
        timeout_secs: u64,
    ) -> Result<Vec<TxStatus>>;

    async fn query_state(
        &self,
        context: &AdapterContext,
        contract_id: &str,
        version: &str,
        key: &str,
        fcn: Option<&str>,
    ) -> Result<Vec<TxStatus>>;

    /// Add adapter-specific figures to computed statistics
    fn get_default_tx_stats(&self, _stats: &mut TxStats, _results: &[TxStatus]) {}
}

/// User-defined workload driven by the worker runner
#[async_trait]
pub trait Workload: Send + Sync {
    /// Optional description printed when a round starts
    fn info(&self) -> &str {
        ""
    }

    async fn init(&self, adapter: Arc<dyn Adapter>, context: AdapterContext, args: &serde_json::Value) -> Result<()>;

    /// Perform one iteration
    async fn run(&self) -> Result<Vec<TxStatus>>;

    /// Called once with every result of the round
    async fn end(&self, results: &[TxStatus]) -> Result<()>;
}

/// Constructor for a named adapter, given its options
pub type AdapterFactory = fn(&serde_json::Value) -> Result<Arc<dyn Adapter>>;

/// Constructor for a named workload
pub type WorkloadFactory = fn() -> Arc<dyn Workload>;

/// Split an adapter reference into its name and options
pub fn parse_adapter_ref(reference: &str) -> Result<(String, serde_json::Value)> {
    let trimmed = reference.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value =
            serde_json::from_str(trimmed).context("Failed to parse adapter configuration")?;
        let name = value
            .get("name")
            .and_then(|n| n.as_str())
            .context("Adapter configuration has no 'name'")?
            .to_string();
        Ok((name, value))
    } else {
        Ok((trimmed.to_string(), serde_json::Value::Null))
    }
}

/// Adapter constructors keyed by name
#[derive(Clone)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(mock::NAME, mock::create);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: AdapterFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the adapter a round's `config` reference points at
    pub fn create(&self, reference: &str) -> Result<Arc<dyn Adapter>> {
        let (name, opts) = parse_adapter_ref(reference)?;
        let factory = self
            .factories
            .get(&name)
            .with_context(|| format!("Unknown adapter '{}'", name))?;
        factory(&opts)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Workload constructors keyed by callback name
#[derive(Clone)]
pub struct WorkloadRegistry {
    factories: HashMap<String, WorkloadFactory>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(workloads::OPEN, workloads::open);
        registry.register(workloads::QUERY, workloads::query);
        registry.register(workloads::TRANSFER, workloads::transfer);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: WorkloadFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn Workload>> {
        let factory = self
            .factories
            .get(name)
            .with_context(|| format!("Unknown workload callback '{}'", name))?;
        Ok(factory())
    }
}

impl Default for WorkloadRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_adapter_ref() {
        let (name, opts) = parse_adapter_ref("mock").unwrap();
        assert_eq!(name, "mock");
        assert!(opts.is_null());

        let (name, opts) = parse_adapter_ref(r#"{"name":"mock","latency_ms":20}"#).unwrap();
        assert_eq!(name, "mock");
        assert_eq!(opts["latency_ms"], 20);

        assert!(parse_adapter_ref(r#"{"latency_ms":20}"#).is_err());
        assert!(parse_adapter_ref("{broken").is_err());
    }

    #[test]
    fn test_registries() {
        let adapters = AdapterRegistry::default();
        assert!(adapters.create("mock").is_ok());
        assert!(adapters.create("fabric").is_err());

        let workloads = WorkloadRegistry::default();
        assert!(workloads.contains(workloads::OPEN));
        assert!(workloads.create("simple-query").is_ok());
        assert!(workloads.create("nope").is_err());
    }
}
