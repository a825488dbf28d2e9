//! Fixed-rate pacing
//!
//! Each client submits at `tps / totalClients`. The controller compares the
//! ideal submission time of transaction `idx` with the time actually elapsed
//! and sleeps off any lead of more than 5ms. Falling behind never produces a
//! negative sleep; the client simply catches up.

use super::{sleep_time_per_client, Options, RateControlError, RateController, RateControllerRegistry};
use crate::protocol::RoundMessage;
use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::util::time::{elapsed_millis, sleep_millis};
use async_trait::async_trait;
use tokio::time::Instant;

pub const TYPE: &str = "fixed-rate";

/// Leads smaller than this are not worth a timer
pub(crate) const MIN_SLEEP_MS: f64 = 5.0;

#[derive(Debug)]
pub struct FixedRate {
    tps: f64,
    /// Per-client interval in milliseconds (0 disables pacing)
    sleep_time: f64,
}

impl FixedRate {
    pub fn new(tps: f64) -> Self {
        Self { tps, sleep_time: 0.0 }
    }

    pub fn sleep_time(&self) -> f64 {
        self.sleep_time
    }
}

pub fn create(
    opts: &serde_json::Value,
    _: &RateControllerRegistry,
) -> Result<Box<dyn RateController>, RateControlError> {
    let tps = Options::new(TYPE, opts).f64("tps")?.unwrap_or(0.0);
    Ok(Box::new(FixedRate::new(tps)))
}

#[async_trait]
impl RateController for FixedRate {
    fn init(&mut self, msg: &RoundMessage) -> Result<(), RateControlError> {
        self.sleep_time = sleep_time_per_client(self.tps, msg);
        Ok(())
    }

    async fn apply_rate_control(&mut self, start: Instant, idx: u64, _: &[TxStatus], _: &[TxStats]) {
        if self.sleep_time == 0.0 {
            return;
        }
        let diff = self.sleep_time * idx as f64 - elapsed_millis(start);
        if diff > MIN_SLEEP_MS {
            sleep_millis(diff).await;
        }
    }

    async fn end(&mut self) -> crate::Result<()> {
        Ok(())
    }
}
