//! Mock adapter for testing
//!
//! Simulates a ledger without any network access. Each invocation completes
//! after a configurable latency and succeeds or fails according to a configured
//! failure ratio, which makes it suitable for exercising the harness itself and
//! for deterministic tests.
//!
//! # Options
//!
//! - `latency_ms`: base latency of every invocation (default 0, instantaneous)
//! - `jitter_ms`: uniform random extra latency added on top
//! - `failure_rate`: fraction of transactions reported as failed
//! - `error_rate`: fraction of invocations that error out entirely
//!
//! # Example
//!
//! ```
//! use txpulse::adapter::{Adapter, mock::MockAdapter};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let adapter = MockAdapter::new();
//! let ctx = adapter.get_context("round", &serde_json::Value::Null, 0).await.unwrap();
//! let results = adapter
//!     .invoke_smart_contract(&ctx, "simple", "v0", &serde_json::json!({"verb": "open"}), 30)
//!     .await
//!     .unwrap();
//! assert!(results[0].is_committed());
//! # }
//! ```

use super::{Adapter, AdapterContext};
use crate::tx::TxStatus;
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const NAME: &str = "mock";

/// Behaviour of the mock ledger
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub latency_ms: u64,
    pub jitter_ms: u64,
    pub failure_rate: f64,
    pub error_rate: f64,
}

/// Simulated ledger backend
#[derive(Debug, Clone)]
pub struct MockAdapter {
    config: MockConfig,

    /// Source of transaction ids
    next_id: Arc<AtomicU64>,

    /// Number of invocations seen, for verification
    invocations: Arc<AtomicU64>,

    /// Number of released contexts, for verification
    released: Arc<AtomicU64>,
}

impl MockAdapter {
    /// An instantaneous, always successful ledger
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            next_id: Arc::new(AtomicU64::new(0)),
            invocations: Arc::new(AtomicU64::new(0)),
            released: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Latency for the next call and whether it fails, drawn up front
    fn draw(&self) -> (Duration, bool, bool) {
        let mut rng = rand::thread_rng();
        let jitter = if self.config.jitter_ms > 0 {
            rng.gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        let failed = self.config.failure_rate > 0.0 && rng.gen_bool(self.config.failure_rate.min(1.0));
        let errored = self.config.error_rate > 0.0 && rng.gen_bool(self.config.error_rate.min(1.0));
        (Duration::from_millis(self.config.latency_ms + jitter), failed, errored)
    }

    async fn simulate(&self, context: &AdapterContext, payload: serde_json::Value) -> Result<Vec<TxStatus>> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let id = format!("mock-{}-{}", context.client_idx, self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut status = TxStatus::new(id);

        let (latency, failed, errored) = self.draw();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if errored {
            anyhow::bail!("mock ledger unavailable");
        }

        status.set_result(payload);
        if failed {
            status.set_failed();
            status.set_error_message(0, "mock transaction rejected");
        } else {
            status.set_success();
        }
        Ok(vec![status])
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

pub fn create(opts: &serde_json::Value) -> Result<Arc<dyn Adapter>> {
    let config = if opts.is_null() {
        MockConfig::default()
    } else {
        serde_json::from_value(opts.clone()).context("Invalid mock adapter options")?
    };
    for (name, rate) in [("failure_rate", config.failure_rate), ("error_rate", config.error_rate)] {
        if !(0.0..=1.0).contains(&rate) {
            anyhow::bail!("mock adapter option '{}' must be within [0, 1], got {}", name, rate);
        }
    }
    Ok(Arc::new(MockAdapter::with_config(config)))
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        NAME
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn install_smart_contract(&self) -> Result<()> {
        Ok(())
    }

    async fn prepare_clients(&self, number: usize) -> Result<Vec<serde_json::Value>> {
        Ok((0..number)
            .map(|i| serde_json::json!({ "identity": format!("user{}", i) }))
            .collect())
    }

    async fn get_context(&self, name: &str, args: &serde_json::Value, client_idx: usize) -> Result<AdapterContext> {
        Ok(AdapterContext {
            name: name.to_string(),
            client_idx,
            data: args.clone(),
        })
    }

    async fn release_context(&self, _context: AdapterContext) -> Result<()> {
        self.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn invoke_smart_contract(
        &self,
        context: &AdapterContext,
        contract_id: &str,
        version: &str,
        args: &serde_json::Value,
        _timeout_secs: u64,
    ) -> Result<Vec<TxStatus>> {
        let payload = serde_json::json!({
            "contract": contract_id,
            "version": version,
            "args": args,
        });
        self.simulate(context, payload).await
    }

    async fn query_state(
        &self,
        context: &AdapterContext,
        contract_id: &str,
        version: &str,
        key: &str,
        fcn: Option<&str>,
    ) -> Result<Vec<TxStatus>> {
        let payload = serde_json::json!({
            "contract": contract_id,
            "version": version,
            "key": key,
            "fcn": fcn.unwrap_or("query"),
        });
        self.simulate(context, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::Status;

    async fn context(adapter: &MockAdapter) -> AdapterContext {
        adapter.get_context("test", &serde_json::Value::Null, 3).await.unwrap()
    }

    #[tokio::test]
    async fn test_mock_adapter_basic() {
        let adapter = MockAdapter::new();
        let ctx = context(&adapter).await;
        assert_eq!(ctx.client_idx, 3);

        let results = adapter
            .invoke_smart_contract(&ctx, "simple", "v0", &serde_json::json!(["open", "a1", 100]), 30)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status(), Status::Success);
        assert!(results[0].id().starts_with("mock-3-"));
        assert_eq!(results[0].result()["contract"], "simple");
        assert_eq!(adapter.invocation_count(), 1);

        adapter.release_context(ctx).await.unwrap();
        assert_eq!(adapter.released_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_adapter_failure() {
        let adapter = MockAdapter::with_config(MockConfig { failure_rate: 1.0, ..MockConfig::default() });
        let ctx = context(&adapter).await;
        let results = adapter.query_state(&ctx, "simple", "v0", "a1", None).await.unwrap();
        assert_eq!(results[0].status(), Status::Failed);
        assert_eq!(results[0].error_message(0), Some("mock transaction rejected"));
    }

    #[tokio::test]
    async fn test_mock_adapter_error() {
        let adapter = MockAdapter::with_config(MockConfig { error_rate: 1.0, ..MockConfig::default() });
        let ctx = context(&adapter).await;
        assert!(adapter.query_state(&ctx, "simple", "v0", "a1", None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_adapter_latency() {
        let adapter = MockAdapter::with_config(MockConfig { latency_ms: 250, ..MockConfig::default() });
        let ctx = context(&adapter).await;
        let start = tokio::time::Instant::now();
        adapter.invoke_smart_contract(&ctx, "c", "v", &serde_json::Value::Null, 1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_unique_ids_and_clients() {
        let adapter = MockAdapter::new();
        let ctx = context(&adapter).await;
        let a = adapter.query_state(&ctx, "c", "v", "k", None).await.unwrap();
        let b = adapter.query_state(&ctx, "c", "v", "k", None).await.unwrap();
        assert_ne!(a[0].id(), b[0].id());
        assert_eq!(adapter.prepare_clients(3).await.unwrap().len(), 3);
    }

    #[test]
    fn test_create_from_options() {
        assert!(create(&serde_json::Value::Null).is_ok());
        assert!(create(&serde_json::json!({"name": "mock", "latency_ms": 5, "failure_rate": 0.2})).is_ok());
        assert!(create(&serde_json::json!({"failure_rate": 2.0})).is_err());
        assert!(create(&serde_json::json!({"latency_ms": "slow"})).is_err());
    }
}
