//! Linear rate ramp
//!
//! Interpolates the inter-submission sleep between a starting and a finishing
//! TPS. Count-bounded rounds interpolate over the transaction index,
//! duration-bounded rounds over the elapsed time.

use super::fixed::MIN_SLEEP_MS;
use super::{Options, RateControlError, RateController, RateControllerRegistry};
use crate::protocol::{RoundLength, RoundMessage};
use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::util::time::{elapsed_millis, sleep_millis};
use async_trait::async_trait;
use tokio::time::Instant;

pub const TYPE: &str = "linear-rate";

#[derive(Debug, Clone)]
pub struct LinearRate {
    starting_tps: f64,
    finishing_tps: f64,

    starting_sleep_time: f64,
    gradient: f64,
    by_index: bool,
}

impl LinearRate {
    pub fn new(starting_tps: f64, finishing_tps: f64) -> Self {
        Self {
            starting_tps,
            finishing_tps,
            starting_sleep_time: 0.0,
            gradient: 0.0,
            by_index: true,
        }
    }

    /// Sleep time (ms) for a transaction index and elapsed time
    pub fn interpolate(&self, idx: u64, elapsed_ms: f64) -> f64 {
        let x = if self.by_index { idx as f64 } else { elapsed_ms };
        self.starting_sleep_time + x * self.gradient
    }
}

pub fn create(
    opts: &serde_json::Value,
    _: &RateControllerRegistry,
) -> Result<Box<dyn RateController>, RateControlError> {
    let o = Options::new(TYPE, opts);
    let starting = o.require_f64("startingTps")?;
    let finishing = o.require_f64("finishingTps")?;
    for (name, value) in [("startingTps", starting), ("finishingTps", finishing)] {
        if value <= 0.0 {
            return Err(RateControlError::InvalidOption {
                controller: TYPE,
                option: name.to_string(),
                reason: "must be positive".to_string(),
            });
        }
    }
    Ok(Box::new(LinearRate::new(starting, finishing)))
}

#[async_trait]
impl RateController for LinearRate {
    fn init(&mut self, msg: &RoundMessage) -> Result<(), RateControlError> {
        let clients = msg.client_count() as f64;
        self.starting_sleep_time = 1000.0 / (self.starting_tps / clients);
        let finishing_sleep_time = 1000.0 / (self.finishing_tps / clients);

        let (span, by_index) = match msg.length() {
            Ok(RoundLength::Count(numb)) => (numb as f64, true),
            Ok(RoundLength::Duration(seconds)) => (seconds as f64 * 1000.0, false),
            Err(e) => {
                return Err(RateControlError::IncompatibleRound {
                    controller: TYPE,
                    label: msg.label.clone(),
                    reason: e.to_string(),
                })
            }
        };
        self.by_index = by_index;
        self.gradient = if span > 0.0 {
            (finishing_sleep_time - self.starting_sleep_time) / span
        } else {
            0.0
        };
        Ok(())
    }

    async fn apply_rate_control(&mut self, start: Instant, idx: u64, _: &[TxStatus], _: &[TxStats]) {
        let sleep = self.interpolate(idx, elapsed_millis(start));
        if sleep > MIN_SLEEP_MS {
            sleep_millis(sleep).await;
        }
    }

    async fn end(&mut self) -> crate::Result<()> {
        Ok(())
    }
}
