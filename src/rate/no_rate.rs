//! Zero-rate controller
//!
//! Lets a client submit a single transaction and then idle for whatever is left
//! of the round. Only meaningful for duration-bounded rounds.

use super::{RateControlError, RateController, RateControllerRegistry};
use crate::protocol::{RoundLength, RoundMessage};
use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::util::time::{elapsed_millis, sleep_millis};
use async_trait::async_trait;
use tokio::time::Instant;

pub const TYPE: &str = "zero-rate";

#[derive(Debug, Default)]
pub struct NoRate {
    /// Round duration in milliseconds
    duration_ms: f64,
}

pub fn create(
    _: &serde_json::Value,
    _: &RateControllerRegistry,
) -> Result<Box<dyn RateController>, RateControlError> {
    Ok(Box::new(NoRate::default()))
}

#[async_trait]
impl RateController for NoRate {
    fn init(&mut self, msg: &RoundMessage) -> Result<(), RateControlError> {
        match msg.length() {
            Ok(RoundLength::Duration(seconds)) => {
                self.duration_ms = seconds as f64 * 1000.0;
                Ok(())
            }
            _ => Err(RateControlError::IncompatibleRound {
                controller: TYPE,
                label: msg.label.clone(),
                reason: "only duration-based rounds are supported".to_string(),
            }),
        }
    }

    async fn apply_rate_control(&mut self, start: Instant, _: u64, _: &[TxStatus], _: &[TxStats]) {
        sleep_millis(self.duration_ms - elapsed_millis(start)).await;
    }

    async fn end(&mut self) -> crate::Result<()> {
        Ok(())
    }
}
