//! PID backlog controller
//!
//! Steers the submission rate so that the backlog (submitted but not yet
//! finished transactions) stays at `targetLoad`. The controller uses the
//! velocity form of a discrete PID law over the last three errors:
//!
//! ```text
//! e[k]  = targetLoad - backlog
//! a     = Kp + Ki*t/2 + Kd/t
//! b     = -Kp + Ki*t/2 - 2*Kd/t
//! c     = Kd/t
//! tps  += a*e[k] + b*e[k-1] + c*e[k-2]      (t = previous period, ms)
//! ```
//!
//! Until three errors have been observed the initial TPS is used unchanged.

use super::{Options, RateControlError, RateController, RateControllerRegistry};
use crate::protocol::RoundMessage;
use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::util::time::sleep_millis;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::debug;

pub const TYPE: &str = "pid-rate";

const HISTORY: usize = 3;
const MIN_SLEEP_MS: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct PidRate {
    target_load: f64,
    kp: f64,
    ki: f64,
    kd: f64,
    initial_tps: f64,
    minimum_tps: f64,
    show_vars: bool,

    tps: f64,
    /// Most recent error first
    errors: VecDeque<f64>,
}

impl PidRate {
    pub fn new(target_load: f64, kp: f64, ki: f64, kd: f64, initial_tps: f64) -> Self {
        Self {
            target_load,
            kp,
            ki,
            kd,
            initial_tps,
            minimum_tps: 1.0,
            show_vars: false,
            tps: initial_tps,
            errors: VecDeque::with_capacity(HISTORY),
        }
    }

    /// Current per-client rate
    pub fn tps(&self) -> f64 {
        self.tps
    }

    fn sleep_time(&self) -> f64 {
        1000.0 / self.tps
    }

    fn update(&mut self, error: f64) {
        if self.errors.len() < HISTORY {
            self.errors.push_front(error);
            return;
        }
        self.errors.pop_back();
        self.errors.push_front(error);

        let t = self.sleep_time();
        let a = self.kp + self.ki * t / 2.0 + self.kd / t;
        let b = -self.kp + self.ki * t / 2.0 - 2.0 * self.kd / t;
        let c = self.kd / t;
        let (e0, e1, e2) = (self.errors[0], self.errors[1], self.errors[2]);

        let delta = a * e0 + b * e1 + c * e2;
        self.tps = (self.tps + delta).max(self.minimum_tps);

        if self.show_vars {
            debug!(
                error = e0,
                p = a * e0,
                i = b * e1,
                d = c * e2,
                tps = self.tps,
                "PID controller update"
            );
        }
    }
}

pub fn create(
    opts: &serde_json::Value,
    _: &RateControllerRegistry,
) -> Result<Box<dyn RateController>, RateControlError> {
    let o = Options::new(TYPE, opts);
    let kd = match o.f64("derrivative")? {
        Some(v) => v,
        None => o.f64("derivative")?.unwrap_or(0.0),
    };
    let mut controller = PidRate::new(
        o.require_f64("targetLoad")?,
        o.f64("proportional")?.unwrap_or(0.0),
        o.f64("integral")?.unwrap_or(0.0),
        kd,
        o.f64_or("initialTPS", 10.0)?,
    );
    controller.minimum_tps = o.f64_or("minimumTps", 1.0)?;
    controller.show_vars = o.bool("showVars");

    if controller.initial_tps <= 0.0 {
        return Err(RateControlError::InvalidOption {
            controller: TYPE,
            option: "initialTPS".to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(Box::new(controller))
}

#[async_trait]
impl RateController for PidRate {
    fn init(&mut self, _: &RoundMessage) -> Result<(), RateControlError> {
        self.tps = self.initial_tps;
        self.errors.clear();
        Ok(())
    }

    async fn apply_rate_control(&mut self, _: Instant, idx: u64, recent_results: &[TxStatus], _: &[TxStats]) {
        let backlog = idx as f64 - recent_results.len() as f64;
        self.update(self.target_load - backlog);

        let sleep = self.sleep_time();
        if sleep > MIN_SLEEP_MS {
            sleep_millis(sleep).await;
        }
    }

    async fn end(&mut self) -> crate::Result<()> {
        Ok(())
    }
}
