//! Trace replay
//!
//! Reproduces a recorded submission schedule: transaction `idx` is released at
//! the recorded offset from the round start. Indices past the end of the trace
//! fall back to a fixed default sleep.

use super::{
    resolve_path_template, Options, RateControlError, RateController, RateControllerRegistry, TraceFormat,
};
use crate::protocol::RoundMessage;
use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::util::time::{elapsed_millis, sleep_millis};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

pub const TYPE: &str = "replay-rate";

const MIN_SLEEP_MS: f64 = 5.0;

#[derive(Debug)]
pub struct ReplayRate {
    path_template: String,
    format: TraceFormat,
    default_sleep_time: f64,
    log_warnings: bool,
    records: Vec<u32>,
}

impl ReplayRate {
    pub fn new(path_template: impl Into<String>, format: TraceFormat) -> Self {
        Self {
            path_template: path_template.into(),
            format,
            default_sleep_time: 20.0,
            log_warnings: false,
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[u32] {
        &self.records
    }
}

pub fn create(
    opts: &serde_json::Value,
    _: &RateControllerRegistry,
) -> Result<Box<dyn RateController>, RateControlError> {
    let o = Options::new(TYPE, opts);
    let mut controller = ReplayRate::new(
        o.require_str("pathTemplate")?,
        TraceFormat::parse_or_text(o.str("inputFormat")),
    );
    controller.default_sleep_time = o.f64_or("defaultSleepTime", 20.0)?;
    controller.log_warnings = o.bool("logWarnings");
    Ok(Box::new(controller))
}

#[async_trait]
impl RateController for ReplayRate {
    fn init(&mut self, msg: &RoundMessage) -> Result<(), RateControlError> {
        let path = resolve_path_template(&self.path_template, msg);
        let bytes = std::fs::read(&path).map_err(|e| RateControlError::TraceFile {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        self.records = self
            .format
            .decode(&bytes)
            .map_err(|reason| RateControlError::TraceFile { path, reason })?;
        Ok(())
    }

    async fn apply_rate_control(&mut self, start: Instant, idx: u64, _: &[TxStatus], _: &[TxStats]) {
        match self.records.get(idx as usize) {
            Some(&at) => {
                let sleep = at as f64 - elapsed_millis(start);
                if sleep > MIN_SLEEP_MS {
                    sleep_millis(sleep).await;
                }
            }
            None => {
                if self.log_warnings {
                    warn!(tx = idx, sleep_ms = self.default_sleep_time, "Trace exhausted, using default sleep time");
                }
                sleep_millis(self.default_sleep_time).await;
            }
        }
    }

    async fn end(&mut self) -> crate::Result<()> {
        Ok(())
    }
}
