//! Timing utilities
//!
//! Rate controllers work in fractional milliseconds relative to the start of a
//! round, while transaction records carry wall-clock milliseconds since the epoch.
//! Round-relative time is measured with `tokio::time::Instant` so that tests can
//! pause and advance the runtime clock deterministically.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Milliseconds since the Unix epoch
#[inline]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds elapsed since `start`, with sub-millisecond precision
#[inline]
pub fn elapsed_millis(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Convert fractional milliseconds to a `Duration`, clamping negatives to zero
#[inline]
pub fn millis_to_duration(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1000.0)
    } else {
        Duration::ZERO
    }
}

/// Sleep for the given number of milliseconds
///
/// Non-positive or non-finite values return immediately.
pub async fn sleep_millis(ms: f64) {
    let duration = millis_to_duration(ms);
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

/// Format a latency given in seconds
///
/// # Examples
///
/// ```
/// use txpulse::util::time::format_latency;
///
/// assert_eq!(format_latency(0.5), "0.50 s");
/// assert_eq!(format_latency(12.346), "12.35 s");
/// ```
pub fn format_latency(seconds: f64) -> String {
    format!("{:.2} s", seconds)
}

/// Format a rate (transactions per second)
///
/// # Examples
///
/// ```
/// use txpulse::util::time::format_rate;
///
/// assert_eq!(format_rate(500.0), "500 tps");
/// assert_eq!(format_rate(1500.0), "1.50K tps");
/// ```
pub fn format_rate(rate: f64) -> String {
    if rate < 1_000.0 {
        format!("{:.0} tps", rate)
    } else if rate < 1_000_000.0 {
        format!("{:.2}K tps", rate / 1_000.0)
    } else {
        format!("{:.2}M tps", rate / 1_000_000.0)
    }
}

/// Calculate a rate from an event count and a span in seconds
///
/// A zero-length span yields the count itself, i.e. everything happened
/// within the same second.
pub fn calculate_rate(count: u64, span_seconds: f64) -> f64 {
    if span_seconds > 0.0 {
        count as f64 / span_seconds
    } else {
        count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_to_duration() {
        assert_eq!(millis_to_duration(1500.0), Duration::from_millis(1500));
        assert_eq!(millis_to_duration(-3.0), Duration::ZERO);
        assert_eq!(millis_to_duration(f64::INFINITY), Duration::ZERO);
        assert_eq!(millis_to_duration(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_millis_advances_clock() {
        let start = Instant::now();
        sleep_millis(250.0).await;
        let elapsed = elapsed_millis(start);
        assert!(elapsed >= 250.0);
        assert!(elapsed < 260.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_millis_negative_returns_immediately() {
        let start = Instant::now();
        sleep_millis(-10.0).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(10.4), "10 tps");
        assert_eq!(format_rate(2500.0), "2.50K tps");
        assert_eq!(format_rate(3_000_000.0), "3.00M tps");
    }

    #[test]
    fn test_calculate_rate() {
        assert_eq!(calculate_rate(100, 10.0), 10.0);
        assert_eq!(calculate_rate(7, 0.0), 7.0);
    }
}
