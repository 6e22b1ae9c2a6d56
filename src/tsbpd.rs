use std::time::Duration;
use tracing::debug;
use crate::config::{DriftConfig, TsbpdConfig};
use crate::drift::DriftTracker;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Packet timestamps are 32 bit microseconds relative to the peer's start time, so they wrap
///  around roughly every 71.6 minutes.
pub const WRAP_PERIOD: u64 = u32::MAX as u64 + 1;

/// Maps 32 bit packet timestamps to local playout times (usec).
///
/// ```ascii
/// playout time = time base + carry-over + timestamp + delay
/// ```
///
/// The time base is the drift tracker's running offset: it starts with the value from
///  connection setup (local time minus the peer's timestamp at that point), and is adjusted by
///  drift corrections and by a full wrap period whenever the timestamps wrap around.
///
/// Wrap-around is handled with a 'wrap check' period: a timestamp within `wrap_check_window` of
///  the maximum opens the period. While it is open, timestamps below the window are taken to be
///  from after the wrap (carry-over of one wrap period), while timestamps close to the maximum
///  are still read as they are - a late packet from before the wrap does not cause a false wrap.
///  The first timestamp between one and two windows closes the period and moves the carry-over
///  into the time base permanently.
#[derive(Debug, Clone)]
pub struct TsbpdTime {
    delay: u64,
    wrap_check_window: u32,
    wrap_check: bool,
    drift: DriftTracker,
}

impl TsbpdTime {
    pub fn new(config: &TsbpdConfig, drift_config: DriftConfig, time_base: u64) -> TsbpdTime {
        let wrap_check_window = config.wrap_check_window.as_micros()
            .try_into()
            .unwrap_or(u32::MAX / 2);

        TsbpdTime {
            delay: config.delay.as_micros().prechecked_cast(),
            wrap_check_window,
            wrap_check: false,
            drift: DriftTracker::new(drift_config, time_base.prechecked_cast()),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay)
    }

    pub fn time_base(&self) -> i64 {
        self.drift.offset()
    }

    pub fn is_in_wrap_check(&self) -> bool {
        self.wrap_check
    }

    pub fn drift(&self) -> &DriftTracker {
        &self.drift
    }

    /// Map a timestamp to the peer's unwrapped 64 bit time line, updating the wrap state.
    ///
    /// NB: This should be called for timestamps in delivery order, i.e. for the packet at the
    ///      head of the receive buffer, since it moves the wrap state forward
    pub fn unwrap_timestamp(&mut self, timestamp: u32) -> u64 {
        let mut carry_over = 0;

        if self.wrap_check {
            if timestamp < self.wrap_check_window {
                carry_over = WRAP_PERIOD;
            }
            else if timestamp <= self.wrap_check_window.saturating_mul(2) {
                self.wrap_check = false;
                self.drift.shift(WRAP_PERIOD.prechecked_cast());
                debug!("timestamp wrap check period ends");
            }
        }
        else if timestamp > u32::MAX - self.wrap_check_window {
            self.wrap_check = true;
            debug!("timestamp wrap check period begins");
        }

        SafeCast::<u64>::safe_cast(timestamp) + carry_over
    }

    /// local time at which a packet with the given timestamp is due for delivery
    pub fn playout_time(&mut self, timestamp: u32) -> u64 {
        let unwrapped = self.unwrap_timestamp(timestamp);
        self.drift.apply(unwrapped) + self.delay
    }

    /// Playout time for a timestamp without moving the wrap state, e.g. for a packet further
    ///  back in the buffer or for a caller's query
    pub fn peek_playout_time(&self, timestamp: u32) -> u64 {
        // while the wrap check is open, the time base does not include the wrap yet
        let carry_over = if self.wrap_check && timestamp <= self.wrap_check_window.saturating_mul(2) {
            WRAP_PERIOD
        }
        else {
            0
        };
        self.drift.apply(SafeCast::<u64>::safe_cast(timestamp) + carry_over) + self.delay
    }

    /// Feed a drift sample: the timestamp of an ACKACK and the local time it arrived at
    pub fn add_drift_sample(&mut self, timestamp: u32, local_time: u64) -> Option<i64> {
        let unwrapped = self.unwrap_timestamp(timestamp);
        self.drift.add_sample(unwrapped, local_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tsbpd(delay_usec: u64, time_base: u64) -> TsbpdTime {
        TsbpdTime::new(
            &TsbpdConfig {
                delay: Duration::from_micros(delay_usec),
                wrap_check_window: Duration::from_secs(30),
            },
            DriftConfig {
                max_samples: 4,
                max_drift_usec: 5000,
                anomaly_usec: 1_000_000,
            },
            time_base,
        )
    }

    #[rstest]
    #[case::zero(0, 0, 0, 0)]
    #[case::delay(120_000, 0, 1_000, 121_000)]
    #[case::time_base(120_000, 7_000_000, 1_000, 7_121_000)]
    fn test_playout_time(#[case] delay: u64, #[case] time_base: u64, #[case] timestamp: u32, #[case] expected: u64) {
        assert_eq!(tsbpd(delay, time_base).playout_time(timestamp), expected);
    }

    #[test]
    fn test_wraparound_is_monotonic() {
        let mut tsbpd = tsbpd(0, 1_000);
        let timestamps = [
            u32::MAX - 40_000_000,
            u32::MAX - 20_000_000,
            u32::MAX - 100,
            50,
            200,
            20_000_000,
            45_000_000,
            90_000_000,
        ];

        let mut prev = 0;
        for ts in timestamps {
            let local = tsbpd.playout_time(ts);
            assert!(local >= prev, "timestamp {} mapped to {} before {}", ts, local, prev);
            prev = local;
        }
        assert!(!tsbpd.is_in_wrap_check());
        assert_eq!(tsbpd.time_base(), 1_000 + WRAP_PERIOD as i64);
        assert_eq!(prev, 1_000 + WRAP_PERIOD + 90_000_000);
    }

    #[test]
    fn test_late_packet_from_before_wrap() {
        let mut tsbpd = tsbpd(0, 0);
        let before = tsbpd.playout_time(u32::MAX - 1_000);
        let after = tsbpd.playout_time(500);
        // a straggler from before the wrap arrives after the first post-wrap packet
        let straggler = tsbpd.playout_time(u32::MAX - 900);

        assert_eq!(after, WRAP_PERIOD + 500);
        assert_eq!(straggler, before + 100);
        assert!(tsbpd.is_in_wrap_check());
    }

    #[test]
    fn test_peek_does_not_open_wrap_check() {
        let mut tsbpd = tsbpd(0, 0);
        assert_eq!(tsbpd.peek_playout_time(u32::MAX - 10), (u32::MAX - 10) as u64);
        assert!(!tsbpd.is_in_wrap_check());
        assert_eq!(tsbpd.playout_time(500), 500);
    }

    #[rstest]
    #[case::before_wrap(u32::MAX - 900)]
    #[case::just_after_wrap(500)]
    #[case::closing_the_check(40_000_000)]
    fn test_peek_during_wrap_check(#[case] timestamp: u32) {
        let mut tsbpd = tsbpd(0, 0);
        tsbpd.playout_time(u32::MAX - 1_000);
        assert!(tsbpd.is_in_wrap_check());

        let peeked = tsbpd.peek_playout_time(timestamp);
        assert!(tsbpd.is_in_wrap_check());
        assert_eq!(peeked, tsbpd.playout_time(timestamp));
    }

    #[test]
    fn test_no_false_wrap_in_the_middle() {
        let mut tsbpd = tsbpd(0, 0);
        assert_eq!(tsbpd.playout_time(10), 10);
        assert_eq!(tsbpd.playout_time(u32::MAX / 2), (u32::MAX / 2) as u64);
        assert!(!tsbpd.is_in_wrap_check());
    }

    #[test]
    fn test_drift_sample_adjusts_time_base() {
        let mut tsbpd = tsbpd(100_000, 0);

        // the peer's clock lags behind by 10ms
        for i in 0..4u32 {
            let ts = 1_000_000 + i * 1000;
            tsbpd.add_drift_sample(ts, ts as u64 + 10_000);
        }

        assert_eq!(tsbpd.time_base(), 10_000);
        assert_eq!(tsbpd.playout_time(2_000_000), 2_110_000);
    }

    #[test]
    fn test_drift_sample_across_wrap() {
        let mut tsbpd = tsbpd(0, 0);
        tsbpd.playout_time(u32::MAX - 10);

        // samples right after the wrap are unwrapped before they reach the tracker
        for i in 0..4u32 {
            let ts = 1_000 + i;
            assert_eq!(tsbpd.add_drift_sample(ts, WRAP_PERIOD + ts as u64), None);
        }
        assert_eq!(tsbpd.drift().last_average(), 0);
        assert_eq!(tsbpd.time_base(), 0);
    }
}
