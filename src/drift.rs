use crate::config::DriftConfig;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use tracing::{debug, trace, warn};

/// Tracks the drift between the peer's clock and the local clock, and keeps a running offset
///  that maps remote timestamps to local time.
///
/// Samples are `(remote timestamp, local time)` pairs, one per ACK/ACKACK round trip. The
///  tracker only keeps their sum and count: once `max_samples` samples are collected, their
///  average is compared against the threshold. If it exceeds the threshold, the *entire*
///  average is folded into the offset in one step, and accumulation starts over. Below the
///  threshold, the offset is left alone to avoid chasing jitter.
///
/// Remote timestamps must already be unwrapped to 64 bit (see [crate::tsbpd::TsbpdTime]).
#[derive(Debug, Clone)]
pub struct DriftTracker {
    config: DriftConfig,
    offset: i64,
    drift_sum: i64,
    num_samples: u32,
    last_average: i64,
}

impl DriftTracker {
    pub fn new(config: DriftConfig, initial_offset: i64) -> DriftTracker {
        DriftTracker {
            config,
            offset: initial_offset,
            drift_sum: 0,
            num_samples: 0,
            last_average: 0,
        }
    }

    /// the local time corresponding to a remote timestamp
    pub fn apply(&self, remote_timestamp: u64) -> u64 {
        remote_timestamp.saturating_add_signed(self.offset)
    }

    /// Add a sample, returning the correction that was folded into the offset if this sample
    ///  completed a window with excessive drift
    pub fn add_sample(&mut self, remote_timestamp: u64, local_time: u64) -> Option<i64> {
        let drift = PrecheckedCast::<i64>::prechecked_cast(local_time) - PrecheckedCast::<i64>::prechecked_cast(remote_timestamp) - self.offset;
        self.drift_sum += drift;
        self.num_samples += 1;

        if self.num_samples < self.config.max_samples {
            return None;
        }

        let average = self.drift_sum / SafeCast::<i64>::safe_cast(self.num_samples);
        self.drift_sum = 0;
        self.num_samples = 0;
        self.last_average = average;

        if average.abs() <= self.config.max_drift_usec {
            trace!("average drift of {}us is within bounds", average);
            return None;
        }

        self.offset += average;
        if average.abs() > self.config.anomaly_usec {
            warn!("drift correction of {}us - the peer's clock may have jumped", average);
        }
        else {
            debug!("drift correction of {}us, offset is now {}us", average, self.offset);
        }
        Some(average)
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// the average of the most recently completed sample window, corrected or not
    pub fn last_average(&self) -> i64 {
        self.last_average
    }

    pub fn pending_samples(&self) -> u32 {
        self.num_samples
    }

    /// shift the offset, e.g. when the time base is reset by the connection setup
    pub fn shift(&mut self, delta: i64) {
        self.offset += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(max_samples: u32) -> DriftConfig {
        DriftConfig {
            max_samples,
            max_drift_usec: 5000,
            anomaly_usec: 1_000_000,
        }
    }

    #[test]
    fn test_apply_initial_offset() {
        let tracker = DriftTracker::new(config(10), 1_000_000);
        assert_eq!(tracker.apply(5), 1_000_005);

        let tracker = DriftTracker::new(config(10), -10);
        assert_eq!(tracker.apply(5), 0);
    }

    #[rstest]
    #[case::below_threshold(4000, 0)]
    #[case::at_threshold(5000, 0)]
    #[case::above_threshold(5001, 5001)]
    #[case::negative_above_threshold(-8000, -8000)]
    #[case::far_above(250_000, 250_000)]
    #[case::anomaly(2_000_000, 2_000_000)]
    fn test_single_window(#[case] error: i64, #[case] expected_offset: i64) {
        let mut tracker = DriftTracker::new(config(10), 0);

        for i in 0..9u64 {
            let remote = 1_000_000 + i * 10_000;
            assert_eq!(tracker.add_sample(remote, remote.saturating_add_signed(error)), None);
        }
        assert_eq!(tracker.pending_samples(), 9);

        let correction = tracker.add_sample(2_000_000, 2_000_000u64.saturating_add_signed(error));
        assert_eq!(tracker.offset(), expected_offset);
        assert_eq!(correction, if expected_offset == 0 { None } else { Some(expected_offset) });
        assert_eq!(tracker.last_average(), error);
        assert_eq!(tracker.pending_samples(), 0);
    }

    #[test]
    fn test_convergence_with_constant_error() {
        let error = 42_000i64;
        let mut tracker = DriftTracker::new(config(100), 0);

        let mut remote = 0u64;
        for _ in 0..1000 {
            remote += 1_000;
            tracker.add_sample(remote, remote + error as u64);
        }

        assert!((tracker.offset() - error).abs() <= 5000, "offset {} did not converge to {}", tracker.offset(), error);

        // playout times are monotonic for monotonic input
        let mut prev = 0;
        for remote in (0..100_000u64).step_by(777) {
            let local = tracker.apply(remote);
            assert!(local >= prev);
            prev = local;
        }
    }

    #[test]
    fn test_convergence_with_slow_drift() {
        // the peer's clock runs 100ppm slow: 100us per second
        let mut tracker = DriftTracker::new(config(10), 0);
        let mut max_seen_error = 0;

        for i in 1..=10_000u64 {
            let local = i * 100_000;
            let remote = local - local / 10_000;
            tracker.add_sample(remote, local);

            let error = (local as i64 - tracker.apply(remote) as i64).abs();
            max_seen_error = max_seen_error.max(error);
        }

        // corrections keep the residual error around the threshold
        assert!(max_seen_error <= 5000 + 10 * 10 * 2, "max error {}", max_seen_error);
        assert!(tracker.offset() > 0);
    }

    #[test]
    fn test_shift() {
        let mut tracker = DriftTracker::new(config(10), 100);
        tracker.shift(-50);
        assert_eq!(tracker.offset(), 50);
        assert_eq!(tracker.apply(0), 50);
    }
}
