//! Submission-time recorder
//!
//! Wraps another controller and timestamps every call (milliseconds since the
//! round start). When the round ends the trace is written to a path template in
//! which `<R>` is replaced by the round index and `<C>` by the 1-based client
//! index. The trace can be fed back through the replay controller.

use super::{
    resolve_path_template, Options, RateControlError, RateController, RateControllerRegistry, TraceFormat,
};
use crate::protocol::{RateControlSpec, RoundLength, RoundMessage};
use crate::stats::TxStats;
use crate::tx::TxStatus;
use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::time::Instant;
use tracing::{error, info};

pub const TYPE: &str = "record-rate";

pub struct RecordRate {
    inner: Box<dyn RateController>,
    path_template: String,
    format: TraceFormat,
    log_end: bool,

    path: PathBuf,
    records: Vec<u32>,
    round_idx: usize,
    client_idx: usize,
}

impl std::fmt::Debug for RecordRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordRate")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("records", &self.records.len())
            .finish()
    }
}

impl RecordRate {
    pub fn new(inner: Box<dyn RateController>, path_template: impl Into<String>, format: TraceFormat) -> Self {
        Self {
            inner,
            path_template: path_template.into(),
            format,
            log_end: false,
            path: PathBuf::new(),
            records: Vec::new(),
            round_idx: 0,
            client_idx: 0,
        }
    }

    pub fn records(&self) -> &[u32] {
        &self.records
    }

}

/// Write an encoded trace, creating the parent directory if needed
async fn export_to(path: PathBuf, bytes: Vec<u8>) -> crate::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("Failed to write trace to {}", path.display()))
}

pub fn create(
    opts: &serde_json::Value,
    registry: &RateControllerRegistry,
) -> Result<Box<dyn RateController>, RateControlError> {
    let o = Options::new(TYPE, opts);
    let path_template = o.require_str("pathTemplate")?;
    let inner_spec: RateControlSpec =
        serde_json::from_value(o.require_value("rateController")?.clone()).map_err(|e| {
            RateControlError::InvalidOption {
                controller: TYPE,
                option: "rateController".to_string(),
                reason: e.to_string(),
            }
        })?;
    let inner = registry.create(&inner_spec)?;

    let mut controller = RecordRate::new(inner, path_template, TraceFormat::parse_or_text(o.str("outputFormat")));
    controller.log_end = o.bool("logEnd");
    Ok(Box::new(controller))
}

#[async_trait]
impl RateController for RecordRate {
    fn init(&mut self, msg: &RoundMessage) -> Result<(), RateControlError> {
        self.round_idx = msg.round_idx;
        self.client_idx = msg.client_idx + 1;
        self.path = resolve_path_template(&self.path_template, msg);

        self.records = match msg.length() {
            Ok(RoundLength::Count(numb)) => vec![0; numb as usize],
            _ => Vec::new(),
        };

        self.inner.init(msg)
    }

    async fn apply_rate_control(
        &mut self,
        start: Instant,
        idx: u64,
        recent_results: &[TxStatus],
        result_stats: &[TxStats],
    ) {
        self.inner
            .apply_rate_control(start, idx, recent_results, result_stats)
            .await;

        let elapsed = start.elapsed().as_millis().min(u32::MAX as u128) as u32;
        let idx = idx as usize;
        if idx >= self.records.len() {
            self.records.resize(idx + 1, 0);
        }
        self.records[idx] = elapsed;
    }

    async fn end(&mut self) -> crate::Result<()> {
        self.inner.end().await?;

        let bytes = self.format.encode(&self.records);
        match export_to(self.path.clone(), bytes).await {
            Ok(()) if self.log_end => info!(
                client = self.client_idx,
                round = self.round_idx,
                path = %self.path.display(),
                "Recorded transaction submission times"
            ),
            Ok(()) => {}
            Err(e) => error!(path = %self.path.display(), error = %e, "Failed to export recorded trace"),
        }
        Ok(())
    }
}
