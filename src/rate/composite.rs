//! Composite rate controller
//!
//! Runs several weighted sub-controllers one after another within a single
//! round. Weights are normalized; zero-weight entries are dropped. In a
//! count-bounded round each sub-controller gets `floor(numb * weight)`
//! transactions, in a duration-bounded round `floor(duration * weight)` seconds.
//!
//! When the active sub-controller's boundary is crossed it is ended and the next
//! one takes over. Each sub-controller sees a remapped, locally zero-based index
//! and start time, so it behaves as if it were running its own round.

use super::{as_number, Options, RateControlError, RateController, RateControllerRegistry};
use crate::protocol::{RateControlSpec, RoundLength, RoundMessage};
use crate::stats::TxStats;
use crate::tx::TxStatus;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const TYPE: &str = "composite-rate";

/// Where the active phase ends
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Boundary {
    /// Last transaction index of the phase (count rounds)
    LastTxIndex(u64),
    /// Milliseconds since round start at which the phase ends (duration rounds)
    RelFinishTime(u64),
}

/// Bookkeeping for one sub-controller
pub struct ControllerData {
    pub weight: f64,
    pub is_last: bool,
    pub spec: RateControlSpec,
    pub first_tx_index: u64,
    pub start_time_difference: Duration,
    pub boundary: Boundary,
    controller: Box<dyn RateController>,
}

impl std::fmt::Debug for ControllerData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerData")
            .field("weight", &self.weight)
            .field("is_last", &self.is_last)
            .field("type", &self.spec.kind)
            .field("first_tx_index", &self.first_tx_index)
            .field("start_time_difference", &self.start_time_difference)
            .field("boundary", &self.boundary)
            .finish()
    }
}

#[derive(Debug)]
pub struct CompositeRate {
    controllers: Vec<ControllerData>,
    active: usize,
    client_idx: usize,
    log_change: bool,
}

impl CompositeRate {
    /// Build from raw weights and already constructed sub-controllers
    pub fn from_parts(
        weights: Vec<f64>,
        controllers: Vec<(RateControlSpec, Box<dyn RateController>)>,
        log_change: bool,
    ) -> Result<Self, RateControlError> {
        if weights.len() != controllers.len() {
            return Err(RateControlError::InvalidWeights(format!(
                "{} weights for {} controllers",
                weights.len(),
                controllers.len()
            )));
        }
        if let Some(w) = weights.iter().find(|w| !w.is_finite()) {
            return Err(RateControlError::InvalidWeights(format!("not-a-number weight: {}", w)));
        }
        if let Some(w) = weights.iter().find(|w| **w < 0.0) {
            return Err(RateControlError::InvalidWeights(format!("negative weight: {}", w)));
        }
        let sum: f64 = weights.iter().sum();
        if sum == 0.0 {
            return Err(RateControlError::InvalidWeights("every weight is zero".to_string()));
        }

        let mut data: Vec<ControllerData> = weights
            .into_iter()
            .zip(controllers)
            .filter(|(w, _)| *w > 0.0)
            .map(|(w, (spec, controller))| ControllerData {
                weight: w / sum,
                is_last: false,
                spec,
                first_tx_index: 0,
                start_time_difference: Duration::ZERO,
                boundary: Boundary::LastTxIndex(0),
                controller,
            })
            .collect();
        if let Some(last) = data.last_mut() {
            last.is_last = true;
        }

        Ok(Self {
            controllers: data,
            active: 0,
            client_idx: 0,
            log_change,
        })
    }

    pub fn controllers(&self) -> &[ControllerData] {
        &self.controllers
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    /// Advance past every phase that has run its course
    ///
    /// Phases whose boundaries coincide are skipped in the same call.
    async fn switch_if_due(&mut self, start: Instant, idx: u64) {
        loop {
            let active = &self.controllers[self.active];
            if active.is_last {
                return;
            }
            let due = match active.boundary {
                Boundary::LastTxIndex(last) => idx >= last,
                Boundary::RelFinishTime(ms) => start.elapsed() >= Duration::from_millis(ms),
            };
            if !due {
                return;
            }

            if let Err(e) = self.controllers[self.active].controller.end().await {
                warn!(error = %e, "Sub-controller failed to end cleanly");
            }

            self.active += 1;
            let next = &mut self.controllers[self.active];
            next.first_tx_index = idx;
            next.start_time_difference = start.elapsed();
            if self.log_change {
                debug!(
                    client = self.client_idx,
                    tx = idx,
                    after_ms = next.start_time_difference.as_millis() as u64,
                    controller = %next.spec.kind,
                    "Switching rate controller"
                );
            }
        }
    }
}

pub fn create(
    opts: &serde_json::Value,
    registry: &RateControllerRegistry,
) -> Result<Box<dyn RateController>, RateControlError> {
    let o = Options::new(TYPE, opts);
    let weights = o
        .require_value("weights")?
        .as_array()
        .ok_or_else(|| RateControlError::InvalidWeights("weights must be an array".to_string()))?;
    let specs = o
        .require_value("rateControllers")?
        .as_array()
        .ok_or_else(|| RateControlError::InvalidWeights("rateControllers must be an array".to_string()))?;

    let weights = weights
        .iter()
        .map(|w| {
            as_number(w).ok_or_else(|| RateControlError::InvalidWeights(format!("not-a-number weight: {}", w)))
        })
        .collect::<Result<Vec<f64>, _>>()?;

    let mut controllers = Vec::with_capacity(specs.len());
    for spec in specs {
        let spec: RateControlSpec = serde_json::from_value(spec.clone()).map_err(|e| {
            RateControlError::InvalidOption {
                controller: TYPE,
                option: "rateControllers".to_string(),
                reason: e.to_string(),
            }
        })?;
        let controller = registry.create(&spec)?;
        controllers.push((spec, controller));
    }

    Ok(Box::new(CompositeRate::from_parts(weights, controllers, o.bool("logChange"))?))
}

#[async_trait]
impl RateController for CompositeRate {
    fn init(&mut self, msg: &RoundMessage) -> Result<(), RateControlError> {
        let length = msg.length().map_err(|e| RateControlError::IncompatibleRound {
            controller: TYPE,
            label: msg.label.clone(),
            reason: e.to_string(),
        })?;
        self.client_idx = msg.client_idx + 1;
        self.active = 0;

        let mut current_sum = 0.0;
        for data in self.controllers.iter_mut() {
            current_sum += data.weight;

            let mut sub_msg = msg.clone();
            sub_msg.rate_control = data.spec.clone();
            match length {
                RoundLength::Count(numb) => {
                    sub_msg.numb = Some((numb as f64 * data.weight).floor() as u64);
                    data.boundary = Boundary::LastTxIndex((numb as f64 * current_sum).floor() as u64);
                }
                RoundLength::Duration(seconds) => {
                    sub_msg.tx_duration = Some((seconds as f64 * data.weight).floor() as u64);
                    data.boundary = Boundary::RelFinishTime((seconds as f64 * 1000.0 * current_sum).floor() as u64);
                }
            }
            data.first_tx_index = 0;
            data.start_time_difference = Duration::ZERO;
            data.controller.init(&sub_msg)?;
        }
        Ok(())
    }

    async fn apply_rate_control(
        &mut self,
        start: Instant,
        idx: u64,
        recent_results: &[TxStatus],
        result_stats: &[TxStats],
    ) {
        self.switch_if_due(start, idx).await;

        let active = &mut self.controllers[self.active];
        let local_start = start + active.start_time_difference;
        let local_idx = idx - active.first_tx_index;
        active
            .controller
            .apply_rate_control(local_start, local_idx, recent_results, result_stats)
            .await;
    }

    async fn end(&mut self) -> crate::Result<()> {
        self.controllers[self.active].controller.end().await
    }
}
