//! Transaction statistics
//!
//! [`TxStats`] is the aggregate view over a window of [`TxStatus`] records:
//! success/failure counts plus running min/max of creation time, final time and
//! latency, and a running latency sum. All times are in seconds.
//!
//! - **Classification**: a `success` record counts toward `succ` and contributes a
//!   latency sample; anything else counts toward `fail`
//! - **Incremental**: [`TxStats::record`] updates the running extremes in place
//! - **Merge**: [`TxStats::merge`] folds partial results from several windows or
//!   workers, skipping empty entries
//!
//! # Example
//!
//! ```
//! use txpulse::stats::TxStats;
//! use txpulse::tx::TxStatus;
//!
//! let mut ok = TxStatus::with_create_time("a", 1_000);
//! ok.set_success_at(1_500);
//! let mut bad = TxStatus::with_create_time("b", 1_200);
//! bad.set_failed_at(1_300);
//!
//! let stats = TxStats::from_results(&[ok, bad], false);
//! assert_eq!(stats.succ, 1);
//! assert_eq!(stats.fail, 1);
//! assert_eq!(stats.avg_delay(), Some(0.5));
//! ```

pub mod aggregator;
pub mod histogram;

use crate::tx::{Status, TxStatus};
use serde::{Deserialize, Serialize};

/// Running minimum and maximum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
}

impl MinMax {
    fn new(value: f64) -> Self {
        Self { min: value, max: value }
    }

    fn update(&mut self, value: f64) {
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    fn absorb(&mut self, other: &MinMax) {
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
    }
}

/// Latency statistics derived from successful transactions only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayStats {
    pub min: f64,
    pub max: f64,
    pub sum: f64,

    /// Per-transaction latencies, retained only when explicitly requested
    #[serde(default)]
    pub detail: Vec<f64>,
}

/// Aggregated statistics over a set of transactions
///
/// The canonical "null" value ([`TxStats::null`]) carries only zero counts and
/// serializes as `{"succ":0,"fail":0}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxStats {
    pub succ: u64,
    pub fail: u64,

    /// Creation time range (seconds since the epoch), over all transactions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<MinMax>,

    /// Final time range (seconds since the epoch), over successful transactions
    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub final_time: Option<MinMax>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayStats>,

    /// Adapter-specific extra outputs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out: Vec<serde_json::Value>,
}

impl TxStats {
    /// Canonical zero-valued statistics
    pub fn null() -> Self {
        Self::default()
    }

    /// Compute statistics over a slice of results
    pub fn from_results(results: &[TxStatus], keep_detail: bool) -> Self {
        let mut stats = Self::null();
        for tx in results {
            stats.record(tx, keep_detail);
        }
        stats
    }

    /// Fold one transaction into the running statistics
    pub fn record(&mut self, tx: &TxStatus, keep_detail: bool) {
        let create = tx.time_create as f64 / 1000.0;
        match self.create.as_mut() {
            Some(range) => range.update(create),
            None => self.create = Some(MinMax::new(create)),
        }

        if tx.status != Status::Success {
            self.fail += 1;
            return;
        }

        self.succ += 1;
        let final_time = tx.time_final as f64 / 1000.0;
        match self.final_time.as_mut() {
            Some(range) => range.update(final_time),
            None => self.final_time = Some(MinMax::new(final_time)),
        }

        let delay = (tx.time_final as f64 - tx.time_create as f64) / 1000.0;
        let entry = self.delay.get_or_insert_with(|| DelayStats {
            min: delay,
            max: delay,
            sum: 0.0,
            detail: Vec::new(),
        });
        if delay < entry.min {
            entry.min = delay;
        }
        if delay > entry.max {
            entry.max = delay;
        }
        entry.sum += delay;
        if keep_detail {
            entry.detail.push(delay);
        }
    }

    /// Number of transactions observed
    pub fn total(&self) -> u64 {
        self.succ + self.fail
    }

    /// Whether these statistics carry any data worth merging
    pub fn is_valid(&self) -> bool {
        self.total() > 0 && self.create.is_some()
    }

    /// Fold `other` into `self`
    ///
    /// Counts and latency sums add, extremes take the min/max, retained detail
    /// and extra outputs concatenate. Invalid `other` values are ignored.
    pub fn absorb(&mut self, other: &TxStats) {
        if !other.is_valid() {
            return;
        }
        self.succ += other.succ;
        self.fail += other.fail;
        self.out.extend(other.out.iter().cloned());

        merge_range(&mut self.create, &other.create);
        merge_range(&mut self.final_time, &other.final_time);

        match (self.delay.as_mut(), other.delay.as_ref()) {
            (Some(mine), Some(theirs)) => {
                if theirs.min < mine.min {
                    mine.min = theirs.min;
                }
                if theirs.max > mine.max {
                    mine.max = theirs.max;
                }
                mine.sum += theirs.sum;
                mine.detail.extend_from_slice(&theirs.detail);
            }
            (None, Some(theirs)) => self.delay = Some(theirs.clone()),
            _ => {}
        }
    }

    /// Merge an ordered list of partial statistics
    ///
    /// Leading invalid entries are skipped, the rest are folded into the first
    /// valid one. Returns `None` when no entry carries data; callers substitute
    /// [`TxStats::null`] in that case.
    pub fn merge(parts: Vec<TxStats>) -> Option<TxStats> {
        let mut iter = parts.into_iter().skip_while(|s| !s.is_valid());
        let mut merged = iter.next()?;
        for part in iter {
            merged.absorb(&part);
        }
        Some(merged)
    }

    /// Merge, substituting the null statistics when nothing is valid
    pub fn merge_or_null(parts: Vec<TxStats>) -> TxStats {
        Self::merge(parts).unwrap_or_else(Self::null)
    }

    /// Average latency of successful transactions, in seconds
    pub fn avg_delay(&self) -> Option<f64> {
        match &self.delay {
            Some(d) if self.succ > 0 => Some(d.sum / self.succ as f64),
            _ => None,
        }
    }

    /// Submission rate over the creation window (transactions per second)
    pub fn send_rate(&self) -> Option<f64> {
        let create = self.create?;
        let span = create.max - create.min;
        if span > 0.0 {
            Some(self.total() as f64 / span)
        } else {
            Some(self.total() as f64)
        }
    }

    /// Commit throughput from first submission to last commit
    pub fn throughput(&self) -> Option<f64> {
        let create = self.create?;
        let final_time = self.final_time?;
        if final_time.max > final_time.min {
            Some(self.succ as f64 / (final_time.max - create.min))
        } else {
            Some(self.succ as f64)
        }
    }
}

fn merge_range(target: &mut Option<MinMax>, other: &Option<MinMax>) {
    match (target.as_mut(), other) {
        (Some(mine), Some(theirs)) => mine.absorb(theirs),
        (None, Some(theirs)) => *target = Some(*theirs),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(id: &str, create: u64, final_time: u64) -> TxStatus {
        let mut tx = TxStatus::with_create_time(id, create);
        tx.set_success_at(final_time);
        tx
    }

    fn failure(id: &str, create: u64) -> TxStatus {
        let mut tx = TxStatus::with_create_time(id, create);
        tx.set_failed_at(create + 10);
        tx
    }

    #[test]
    fn test_classification() {
        let results = vec![
            success("a", 1_000, 1_400),
            success("b", 2_000, 2_100),
            failure("c", 500),
        ];
        let stats = TxStats::from_results(&results, true);

        assert_eq!(stats.succ, 2);
        assert_eq!(stats.fail, 1);
        assert_eq!(stats.create, Some(MinMax { min: 0.5, max: 2.0 }));
        assert_eq!(stats.final_time, Some(MinMax { min: 1.4, max: 2.1 }));

        let delay = stats.delay.as_ref().unwrap();
        assert!((delay.min - 0.1).abs() < 1e-9);
        assert!((delay.max - 0.4).abs() < 1e-9);
        assert!((delay.sum - 0.5).abs() < 1e-9);
        assert_eq!(delay.detail.len(), 2);
    }

    #[test]
    fn test_failed_only_has_no_delay() {
        let stats = TxStats::from_results(&[failure("x", 1_000)], false);
        assert_eq!(stats.fail, 1);
        assert!(stats.delay.is_none());
        assert!(stats.final_time.is_none());
        assert!(stats.is_valid());
    }

    #[test]
    fn test_detail_only_when_requested() {
        let stats = TxStats::from_results(&[success("a", 0, 1_000)], false);
        assert!(stats.delay.unwrap().detail.is_empty());
    }

    #[test]
    fn test_merge_empty_and_all_zero() {
        assert!(TxStats::merge(Vec::new()).is_none());
        assert!(TxStats::merge(vec![TxStats::null(), TxStats::null()]).is_none());

        let null = TxStats::merge_or_null(vec![TxStats::null()]);
        assert_eq!(null, TxStats::null());
        let json = serde_json::to_string(&null).unwrap();
        assert_eq!(json, r#"{"succ":0,"fail":0}"#);
    }

    #[test]
    fn test_merge_skips_leading_invalid() {
        let a = TxStats::from_results(&[success("a", 1_000, 1_200)], false);
        let merged = TxStats::merge(vec![TxStats::null(), a.clone(), TxStats::null()]).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn test_merge_is_associative() {
        let a = TxStats::from_results(&[success("a", 1_000, 1_300), failure("f", 900)], true);
        let b = TxStats::from_results(&[success("b", 2_000, 2_050)], true);
        let c = TxStats::from_results(&[success("c", 500, 3_000), success("d", 1_500, 1_600)], true);

        let ab = TxStats::merge(vec![a.clone(), b.clone()]).unwrap();
        let left = TxStats::merge(vec![ab, c.clone()]).unwrap();
        let flat = TxStats::merge(vec![a, b, c]).unwrap();

        assert_eq!(left.succ, flat.succ);
        assert_eq!(left.fail, flat.fail);
        assert_eq!(left.create, flat.create);
        assert_eq!(left.final_time, flat.final_time);
        let (l, f) = (left.delay.unwrap(), flat.delay.unwrap());
        assert_eq!(l.min, f.min);
        assert_eq!(l.max, f.max);
        assert!((l.sum - f.sum).abs() < 1e-9);
        assert_eq!(l.detail.len(), 4);
    }

    #[test]
    fn test_merge_equals_recomputation() {
        let first = vec![success("a", 1_000, 1_300), failure("f", 900)];
        let second = vec![success("b", 2_000, 2_050)];
        let all: Vec<TxStatus> = first.iter().chain(second.iter()).cloned().collect();

        let merged = TxStats::merge(vec![
            TxStats::from_results(&first, false),
            TxStats::from_results(&second, false),
        ])
        .unwrap();
        let direct = TxStats::from_results(&all, false);

        assert_eq!(merged.succ, direct.succ);
        assert_eq!(merged.create, direct.create);
        assert_eq!(merged.final_time, direct.final_time);
    }

    #[test]
    fn test_rates() {
        let stats = TxStats::from_results(
            &[success("a", 0, 1_000), success("b", 1_000, 2_000), success("c", 2_000, 4_000)],
            false,
        );
        assert_eq!(stats.send_rate(), Some(1.5));
        assert_eq!(stats.throughput(), Some(0.75));
        assert_eq!(TxStats::null().send_rate(), None);
        assert_eq!(TxStats::null().avg_delay(), None);
    }

    #[test]
    fn test_serde_roundtrip_keeps_final_key() {
        let stats = TxStats::from_results(&[success("a", 1_000, 2_000)], false);
        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("final").is_some());
        let back: TxStats = serde_json::from_value(json).unwrap();
        assert_eq!(back, stats);
    }
}
