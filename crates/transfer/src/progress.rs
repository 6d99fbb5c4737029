use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default time window for rate calculation.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Default cap on retained samples.
const DEFAULT_MAX_SAMPLES: usize = 100;

/// Percentage of `bytes_total` already sent, clamped to `[0, 100]`.
///
/// An empty upload counts as complete.
pub fn percent(bytes_sent: u64, bytes_total: u64) -> f64 {
    if bytes_total == 0 {
        return 100.0;
    }
    (bytes_sent as f64 / bytes_total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Transfer rate over a sliding window of confirmed offsets.
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<(u64, Instant)>,
    max_samples: usize,
    window: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// - `window`: time window for rate calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2),
            window: window.unwrap_or(DEFAULT_WINDOW),
        }
    }

    /// Records that `offset` bytes were confirmed now.
    pub fn record(&mut self, offset: u64) {
        self.record_at(offset, Instant::now());
    }

    /// Records that `offset` bytes were confirmed at `at`.
    pub fn record_at(&mut self, offset: u64, at: Instant) {
        self.samples.push_back((offset, at));

        if let Some(cutoff) = at.checked_sub(self.window) {
            while self.samples.len() > 2
                && self.samples.front().is_some_and(|&(_, t)| t < cutoff)
            {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Bytes per second within the window, 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(first, t0)), Some(&(last, t1))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = t1.saturating_duration_since(t0);
        if elapsed.is_zero() || last <= first {
            return 0.0;
        }
        (last - first) as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to send `remaining` more bytes; `None` while the rate is zero.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    /// Drops all samples, e.g. once a stalled request is retried.
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_matches_progress_bar() {
        assert_eq!(percent(0, 200), 0.0);
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(percent(200, 200), 100.0);
        assert_eq!(percent(0, 0), 100.0);
    }

    #[test]
    fn empty_calculator() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn single_sample_has_no_rate() {
        let mut calc = SpeedCalculator::default();
        calc.record(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn rate_from_offsets() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        let t0 = Instant::now();
        calc.record_at(1_000, t0);
        calc.record_at(3_000, t0 + Duration::from_secs(1));
        calc.record_at(5_000, t0 + Duration::from_secs(2));

        assert!((calc.bytes_per_second() - 2_000.0).abs() < 1e-6);
        let eta = calc.eta(4_000).unwrap();
        assert!((eta.as_secs_f64() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn old_samples_leave_window() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(1)), None);
        let t0 = Instant::now();
        calc.record_at(0, t0);
        calc.record_at(100, t0 + Duration::from_secs(5));
        calc.record_at(1_100, t0 + Duration::from_millis(5_500));
        calc.record_at(2_100, t0 + Duration::from_secs(6));

        // Only the samples within the last second count.
        assert!((calc.bytes_per_second() - 2_000.0).abs() < 1e-6);
    }

    #[test]
    fn max_samples_bounded() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        let t0 = Instant::now();
        for i in 0..20u64 {
            calc.record_at(i * 10, t0 + Duration::from_millis(i * 10));
        }
        assert!(calc.samples.len() <= 5);
    }

    #[test]
    fn reset_clears_rate() {
        let mut calc = SpeedCalculator::default();
        let t0 = Instant::now();
        calc.record_at(0, t0);
        calc.record_at(10, t0 + Duration::from_secs(1));
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }
}
