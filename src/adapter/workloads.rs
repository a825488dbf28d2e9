//! Built-in workloads
//!
//! Small account-based workloads that run against any adapter:
//!
//! - `simple-open`: open a new account per iteration with an initial balance
//! - `simple-query`: query a random account out of `accounts`
//! - `simple-transfer`: move a random amount between two random accounts
//!
//! Arguments come from the round's `args` table: `money` (initial balance,
//! default 10000), `accounts` (accounts per client to draw from, default 1000),
//! `contract` and `version` (default `simple`/`v0`).

use super::{Adapter, AdapterContext, Workload};
use crate::tx::TxStatus;
use crate::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

pub const OPEN: &str = "simple-open";
pub const QUERY: &str = "simple-query";
pub const TRANSFER: &str = "simple-transfer";

const TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Open,
    Query,
    Transfer,
}

/// Arguments shared by the built-in workloads
#[derive(Debug, Clone, PartialEq)]
struct SimpleArgs {
    money: u64,
    accounts: u64,
    contract: String,
    version: String,
}

impl SimpleArgs {
    fn parse(args: &serde_json::Value) -> Self {
        let number = |name: &str, default: u64| {
            args.get(name)
                .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                .unwrap_or(default)
        };
        let text = |name: &str, default: &str| {
            args.get(name)
                .and_then(|v| v.as_str())
                .unwrap_or(default)
                .to_string()
        };
        Self {
            money: number("money", 10_000),
            accounts: number("accounts", 1_000).max(1),
            contract: text("contract", "simple"),
            version: text("version", "v0"),
        }
    }
}

struct Bound {
    adapter: Arc<dyn Adapter>,
    context: AdapterContext,
    args: SimpleArgs,
}

/// Account workload parameterized by its verb
pub struct SimpleWorkload {
    verb: Verb,
    bound: OnceLock<Bound>,
    opened: AtomicU64,
}

impl SimpleWorkload {
    fn new(verb: Verb) -> Self {
        Self {
            verb,
            bound: OnceLock::new(),
            opened: AtomicU64::new(0),
        }
    }

    fn account_name(client_idx: usize, n: u64) -> String {
        format!("c{}_{}", client_idx, n)
    }
}

pub fn open() -> Arc<dyn Workload> {
    Arc::new(SimpleWorkload::new(Verb::Open))
}

pub fn query() -> Arc<dyn Workload> {
    Arc::new(SimpleWorkload::new(Verb::Query))
}

pub fn transfer() -> Arc<dyn Workload> {
    Arc::new(SimpleWorkload::new(Verb::Transfer))
}

#[async_trait]
impl Workload for SimpleWorkload {
    fn info(&self) -> &str {
        match self.verb {
            Verb::Open => "opening accounts",
            Verb::Query => "querying accounts",
            Verb::Transfer => "transferring between accounts",
        }
    }

    async fn init(&self, adapter: Arc<dyn Adapter>, context: AdapterContext, args: &serde_json::Value) -> Result<()> {
        let bound = Bound {
            adapter,
            context,
            args: SimpleArgs::parse(args),
        };
        if self.bound.set(bound).is_err() {
            anyhow::bail!("workload initialized twice");
        }
        Ok(())
    }

    async fn run(&self) -> Result<Vec<TxStatus>> {
        let Some(bound) = self.bound.get() else {
            anyhow::bail!("workload used before init");
        };
        let client = bound.context.client_idx;
        let args = &bound.args;

        match self.verb {
            Verb::Open => {
                let n = self.opened.fetch_add(1, Ordering::Relaxed);
                let payload = serde_json::json!(["open", Self::account_name(client, n), args.money]);
                bound
                    .adapter
                    .invoke_smart_contract(&bound.context, &args.contract, &args.version, &payload, TIMEOUT_SECS)
                    .await
            }
            Verb::Query => {
                let n = rand::thread_rng().gen_range(0..args.accounts);
                let account = Self::account_name(client, n);
                bound
                    .adapter
                    .query_state(&bound.context, &args.contract, &args.version, &account, None)
                    .await
            }
            Verb::Transfer => {
                let (from, to, amount) = {
                    let mut rng = rand::thread_rng();
                    (
                        rng.gen_range(0..args.accounts),
                        rng.gen_range(0..args.accounts),
                        rng.gen_range(1..=100u64),
                    )
                };
                let payload = serde_json::json!([
                    "transfer",
                    Self::account_name(client, from),
                    Self::account_name(client, to),
                    amount
                ]);
                bound
                    .adapter
                    .invoke_smart_contract(&bound.context, &args.contract, &args.version, &payload, TIMEOUT_SECS)
                    .await
            }
        }
    }

    async fn end(&self, _results: &[TxStatus]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;

    async fn bound(workload: &Arc<dyn Workload>, args: serde_json::Value) -> Arc<MockAdapter> {
        let adapter = Arc::new(MockAdapter::new());
        let ctx = adapter.get_context("t", &serde_json::Value::Null, 1).await.unwrap();
        workload.init(adapter.clone(), ctx, &args).await.unwrap();
        adapter
    }

    #[test]
    fn test_args_defaults() {
        let args = SimpleArgs::parse(&serde_json::Value::Null);
        assert_eq!(args.money, 10_000);
        assert_eq!(args.accounts, 1_000);
        assert_eq!(args.contract, "simple");

        let args = SimpleArgs::parse(&serde_json::json!({"money": "50", "accounts": 0, "version": "v2"}));
        assert_eq!(args.money, 50);
        assert_eq!(args.accounts, 1);
        assert_eq!(args.version, "v2");
    }

    #[tokio::test]
    async fn test_open_uses_fresh_accounts() {
        let workload = open();
        let adapter = bound(&workload, serde_json::json!({"money": 7})).await;

        let first = workload.run().await.unwrap();
        let second = workload.run().await.unwrap();
        assert_eq!(first[0].result()["args"], serde_json::json!(["open", "c1_0", 7]));
        assert_eq!(second[0].result()["args"], serde_json::json!(["open", "c1_1", 7]));
        assert_eq!(adapter.invocation_count(), 2);
    }

    #[tokio::test]
    async fn test_query_and_transfer() {
        let q = query();
        bound(&q, serde_json::json!({"accounts": 5})).await;
        let results = q.run().await.unwrap();
        assert!(results[0].result()["key"].as_str().unwrap().starts_with("c1_"));

        let t = transfer();
        bound(&t, serde_json::Value::Null).await;
        let results = t.run().await.unwrap();
        assert_eq!(results[0].result()["args"][0], "transfer");
    }

    #[tokio::test]
    async fn test_run_before_init_fails() {
        assert!(open().run().await.is_err());
    }

    #[tokio::test]
    async fn test_double_init_fails() {
        let workload = open();
        bound(&workload, serde_json::Value::Null).await;
        let adapter = Arc::new(MockAdapter::new());
        let ctx = adapter.get_context("t", &serde_json::Value::Null, 0).await.unwrap();
        assert!(workload.init(adapter, ctx, &serde_json::Value::Null).await.is_err());
    }
}
