//! Fixed backlog
//!
//! Keeps roughly `unfinished_per_client` transactions in flight. Until the first
//! successes arrive the client sleeps a fixed amount per submission; afterwards
//! it sleeps for `(backlog - target) * average latency`.

use super::{Options, RateControlError, RateController, RateControllerRegistry};
use crate::protocol::RoundMessage;
use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::util::time::sleep_millis;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

pub const TYPE: &str = "fixed-backlog";

#[derive(Debug, Clone)]
pub struct FixedBacklog {
    /// Sleep (ms) used while no latency information is available
    sleep_time: f64,
    unfinished_per_client: f64,
}

impl FixedBacklog {
    pub fn new(sleep_time: f64, unfinished_per_client: f64) -> Self {
        Self { sleep_time, unfinished_per_client }
    }

    /// Sleep (ms) for the current state
    fn pause(&self, idx: u64, result_stats: &[TxStats]) -> f64 {
        let cumulative = match result_stats.first() {
            Some(s) if s.succ > 0 && s.delay.is_some() => s,
            _ => return self.sleep_time,
        };

        let complete = cumulative.total() as f64;
        let unfinished = idx as f64 - complete;
        if unfinished < self.unfinished_per_client {
            return 0.0;
        }

        let avg_delay_ms = cumulative.delay.as_ref().map_or(0.0, |d| d.sum / complete * 1000.0);
        let error = unfinished - self.unfinished_per_client;
        debug!(error, "Transaction backlog error");
        error * avg_delay_ms
    }
}

pub fn create(
    opts: &serde_json::Value,
    _: &RateControllerRegistry,
) -> Result<Box<dyn RateController>, RateControlError> {
    let o = Options::new(TYPE, opts);
    Ok(Box::new(FixedBacklog::new(
        o.f64_or("sleep_time", 10.0)?,
        o.f64_or("unfinished_per_client", 10.0)?,
    )))
}

#[async_trait]
impl RateController for FixedBacklog {
    fn init(&mut self, _: &RoundMessage) -> Result<(), RateControlError> {
        Ok(())
    }

    async fn apply_rate_control(&mut self, _: Instant, idx: u64, _: &[TxStatus], result_stats: &[TxStats]) {
        sleep_millis(self.pause(idx, result_stats)).await;
    }

    async fn end(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(n: u64, latency_ms: u64) -> TxStats {
        let results: Vec<TxStatus> = (0..n)
            .map(|i| {
                let mut tx = TxStatus::with_create_time(i.to_string(), 1_000);
                tx.set_success_at(1_000 + latency_ms);
                tx
            })
            .collect();
        TxStats::from_results(&results, false)
    }

    #[test]
    fn test_waits_for_first_success() {
        let c = FixedBacklog::new(10.0, 5.0);
        assert_eq!(c.pause(3, &[]), 10.0);
        assert_eq!(c.pause(3, &[TxStats::null()]), 10.0);
    }

    #[test]
    fn test_below_target() {
        let c = FixedBacklog::new(10.0, 5.0);
        assert_eq!(c.pause(8, &[completed(4, 200)]), 0.0);
    }

    #[test]
    fn test_sleep_scales_with_error_and_latency() {
        let c = FixedBacklog::new(10.0, 5.0);
        // backlog 10, error 5, average latency 200ms
        let pause = c.pause(14, &[completed(4, 200)]);
        assert!((pause - 1_000.0).abs() < 1e-6, "pause = {}", pause);
    }
}
