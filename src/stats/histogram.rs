//! Latency histogram using HdrHistogram
//!
//! Transaction latencies are reported in seconds. The histogram stores them with
//! microsecond resolution, from 1µs up to one hour, with 3 significant digits.
//!
//! # Example
//!
//! ```
//! use txpulse::stats::histogram::LatencyHistogram;
//!
//! let mut hist = LatencyHistogram::new().unwrap();
//! hist.record_secs(0.120);
//! hist.record_secs(0.250);
//! hist.record_secs(1.500);
//!
//! // 75% of three samples rounds up to the third
//! let p75 = hist.percentile(75.0).unwrap();
//! assert!((p75 - 1.5).abs() < 0.01);
//! ```

use crate::Result;
use anyhow::Context;
use hdrhistogram::Histogram;

const MAX_MICROS: u64 = 3_600_000_000;

/// Latency histogram over seconds-valued samples
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, MAX_MICROS, 3)
            .context("Failed to create latency histogram")?;
        Ok(Self { histogram })
    }

    /// Build a histogram from retained per-transaction latencies
    pub fn from_samples(samples: &[f64]) -> Result<Self> {
        let mut hist = Self::new()?;
        for &s in samples {
            hist.record_secs(s);
        }
        Ok(hist)
    }

    /// Record a latency sample given in seconds, clamped to the tracked range
    #[inline]
    pub fn record_secs(&mut self, seconds: f64) {
        let micros = if seconds.is_finite() && seconds > 0.0 {
            (seconds * 1_000_000.0) as u64
        } else {
            0
        };
        let _ = self.histogram.record(micros.clamp(1, MAX_MICROS));
    }

    /// Latency (seconds) at the given percentile, or `None` when empty
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        if self.histogram.len() == 0 {
            return None;
        }
        Some(self.histogram.value_at_percentile(percentile) as f64 / 1_000_000.0)
    }

    pub fn mean(&self) -> Option<f64> {
        if self.histogram.len() == 0 {
            return None;
        }
        Some(self.histogram.mean() / 1_000_000.0)
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.len() == 0
    }

    pub fn merge(&mut self, other: &LatencyHistogram) -> Result<()> {
        self.histogram
            .add(&other.histogram)
            .context("Failed to merge latency histograms")
    }
}
