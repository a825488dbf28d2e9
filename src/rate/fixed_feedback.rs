//! Fixed rate with backlog feedback
//!
//! Paces like the fixed-rate controller, and once a client has submitted
//! `unfinished_per_client` transactions it also throttles on the backlog:
//!
//! - a backlog under half the threshold adds no delay
//! - a report window without any success adds an escalating pause of
//!   `n * sleep_time`, where `n` counts consecutive such windows (capped)
//! - otherwise the pause is `k * sleep_time` for the largest `k` such that the
//!   backlog is at least `k` thresholds (capped)
//!
//! Time spent in backlog pauses is excluded from the fixed-rate schedule so the
//! client does not burst to catch up afterwards.

use super::fixed::MIN_SLEEP_MS;
use super::{sleep_time_per_client, Options, RateControlError, RateController, RateControllerRegistry};
use crate::protocol::RoundMessage;
use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::util::time::{elapsed_millis, sleep_millis};
use async_trait::async_trait;
use tokio::time::Instant;

pub const TYPE: &str = "fixed-feedback-rate";

/// Tunables of the backlog throttle
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackParams {
    /// Base pause in milliseconds
    pub sleep_time: f64,
    /// Backlog threshold per client
    pub unfinished_per_client: f64,
    /// Largest multiple applied for consecutive zero-success windows
    pub zero_success_max_multiple: u32,
    /// Largest backlog multiple checked
    pub backlog_max_multiple: u32,
    /// Fraction of the threshold below which no pause is applied
    pub idle_ratio: f64,
}

impl Default for FeedbackParams {
    fn default() -> Self {
        Self {
            sleep_time: 100.0,
            unfinished_per_client: 7000.0,
            zero_success_max_multiple: 30,
            backlog_max_multiple: 10,
            idle_ratio: 0.5,
        }
    }
}

#[derive(Debug)]
pub struct FixedFeedbackRate {
    tps: f64,
    params: FeedbackParams,

    /// Fixed-rate interval in milliseconds
    interval: f64,
    zero_succ_count: u32,
    total_sleep_time: f64,
}

impl FixedFeedbackRate {
    pub fn new(tps: f64, params: FeedbackParams) -> Self {
        Self {
            tps,
            params,
            interval: 0.0,
            zero_succ_count: 0,
            total_sleep_time: 0.0,
        }
    }

    /// Backlog pause for the current state, in milliseconds
    fn backlog_pause(&mut self, idx: u64, result_stats: &[TxStats]) -> Option<f64> {
        let cumulative = result_stats.first()?;
        let unfinished = idx as f64 - cumulative.total() as f64;
        let threshold = self.params.unfinished_per_client;

        if unfinished < threshold * self.params.idle_ratio {
            return None;
        }

        if let Some(window) = result_stats.get(1) {
            if window.succ == 0 {
                self.zero_succ_count += 1;
                let multiple = self.zero_succ_count.min(self.params.zero_success_max_multiple);
                if multiple > 0 {
                    return Some(multiple as f64 * self.params.sleep_time);
                }
            }
        }
        self.zero_succ_count = 0;

        (1..=self.params.backlog_max_multiple)
            .rev()
            .find(|k| unfinished >= *k as f64 * threshold)
            .map(|k| k as f64 * self.params.sleep_time)
    }
}

pub fn create(
    opts: &serde_json::Value,
    _: &RateControllerRegistry,
) -> Result<Box<dyn RateController>, RateControlError> {
    let o = Options::new(TYPE, opts);
    let defaults = FeedbackParams::default();
    let params = FeedbackParams {
        sleep_time: o.f64_or("sleep_time", defaults.sleep_time)?,
        unfinished_per_client: o.f64_or("unfinished_per_client", defaults.unfinished_per_client)?,
        zero_success_max_multiple: o
            .f64_or("zero_success_max_multiple", defaults.zero_success_max_multiple as f64)?
            as u32,
        backlog_max_multiple: o.f64_or("backlog_max_multiple", defaults.backlog_max_multiple as f64)? as u32,
        idle_ratio: o.f64_or("idle_ratio", defaults.idle_ratio)?,
    };
    Ok(Box::new(FixedFeedbackRate::new(o.f64("tps")?.unwrap_or(0.0), params)))
}

#[async_trait]
impl RateController for FixedFeedbackRate {
    fn init(&mut self, msg: &RoundMessage) -> Result<(), RateControlError> {
        self.interval = sleep_time_per_client(self.tps, msg);
        self.zero_succ_count = 0;
        self.total_sleep_time = 0.0;
        Ok(())
    }

    async fn apply_rate_control(&mut self, start: Instant, idx: u64, _: &[TxStatus], result_stats: &[TxStats]) {
        if self.interval == 0.0 {
            return;
        }

        let diff = self.interval * idx as f64 - (elapsed_millis(start) - self.total_sleep_time);
        if diff > MIN_SLEEP_MS {
            sleep_millis(diff).await;
            return;
        }

        if (idx as f64) < self.params.unfinished_per_client {
            return;
        }

        if let Some(pause) = self.backlog_pause(idx, result_stats) {
            self.total_sleep_time += pause;
            sleep_millis(pause).await;
        }
    }

    async fn end(&mut self) -> crate::Result<()> {
        Ok(())
    }
}
