//! Microsecond time base for the buffers.
//!
//! Time is represented as `u64` microseconds since the clock was created. The buffers only ever
//!  see the [TimeSource] trait, so tests can substitute a mock clock; the production
//!  implementation is [MonotonicClock].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};
#[cfg(test)] use mockall::automock;

#[cfg_attr(test, automock)]
pub trait TimeSource: Send + Sync + 'static {
    fn now_micros(&self) -> u64;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SleepOutcome {
    Elapsed,
    Interrupted,
}

enum ClockSource {
    HighResolution {
        origin: Instant,
    },
    /// Fallback if the monotonic counter turns out to be too coarse. The wall clock can jump
    ///  backwards, so the last returned value is kept as a lower bound.
    WallClock {
        origin: SystemTime,
        last: AtomicU64,
    },
}

impl ClockSource {
    /// resolution that the monotonic counter must at least provide to be used
    const MAX_TICK: Duration = Duration::from_micros(10);
    const PROBE_ITERATIONS: usize = 10_000;

    fn probe() -> ClockSource {
        let start = std::time::Instant::now();
        for _ in 0..Self::PROBE_ITERATIONS {
            let tick = start.elapsed();
            if tick.is_zero() {
                continue;
            }
            if tick <= Self::MAX_TICK {
                trace!("monotonic counter resolution is {:?}", tick);
                return ClockSource::high_resolution();
            }
            break;
        }

        debug!("monotonic counter is too coarse - falling back to wall clock time");
        ClockSource::wall_clock()
    }

    fn high_resolution() -> ClockSource {
        ClockSource::HighResolution { origin: Instant::now() }
    }

    fn wall_clock() -> ClockSource {
        ClockSource::WallClock {
            origin: SystemTime::now(),
            last: AtomicU64::new(0),
        }
    }

    fn now_micros(&self) -> u64 {
        match self {
            ClockSource::HighResolution { origin } => {
                Instant::now().duration_since(*origin).as_micros() as u64
            }
            ClockSource::WallClock { origin, last } => {
                let raw = SystemTime::now()
                    .duration_since(*origin)
                    .map(|d| d.as_micros() as u64)
                    .unwrap_or(0);
                // fetch_max returns the previous value
                let prev = last.fetch_max(raw, Ordering::AcqRel);
                prev.max(raw)
            }
        }
    }
}

/// The clock that drives timestamp based delivery and TTL checks.
///
/// Sleeping is async and can be interrupted: [MonotonicClock::interrupt] wakes all tasks that are
///  currently inside [MonotonicClock::sleep_until], e.g. because the schedule changed or the
///  connection is being closed.
pub struct MonotonicClock {
    source: ClockSource,
    wakeup: Notify,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            source: ClockSource::probe(),
            wakeup: Notify::new(),
        }
    }

    /// a clock that uses the wall clock regardless of the monotonic counter's resolution
    pub fn wall_clock() -> MonotonicClock {
        MonotonicClock {
            source: ClockSource::wall_clock(),
            wakeup: Notify::new(),
        }
    }

    pub fn uses_wall_clock(&self) -> bool {
        matches!(self.source, ClockSource::WallClock { .. })
    }

    pub fn now(&self) -> u64 {
        self.source.now_micros()
    }

    pub async fn sleep(&self, interval: Duration) -> SleepOutcome {
        let deadline = self.now().saturating_add(interval.as_micros() as u64);
        self.sleep_until(deadline).await
    }

    pub async fn sleep_until(&self, deadline: u64) -> SleepOutcome {
        // register for wakeup before checking the time so an interrupt in between is not lost
        let interrupted = self.wakeup.notified();
        tokio::pin!(interrupted);

        let now = self.now();
        if now >= deadline {
            return SleepOutcome::Elapsed;
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_micros(deadline - now)) => SleepOutcome::Elapsed,
            _ = &mut interrupted => {
                trace!("sleep until {} interrupted", deadline);
                SleepOutcome::Interrupted
            }
        }
    }

    pub fn interrupt(&self) {
        self.wakeup.notify_waiters();
    }
}

impl TimeSource for MonotonicClock {
    fn now_micros(&self) -> u64 {
        self.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::runtime::Builder;
    use tokio::time;

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_now_follows_tokio_time() {
        paused_runtime().block_on(async {
            let clock = MonotonicClock {
                source: ClockSource::high_resolution(),
                wakeup: Notify::new(),
            };
            let t0 = clock.now();
            time::advance(Duration::from_millis(5)).await;
            assert_eq!(clock.now() - t0, 5_000);
        });
    }

    #[test]
    fn test_sleep_until_elapses() {
        paused_runtime().block_on(async {
            let clock = MonotonicClock {
                source: ClockSource::high_resolution(),
                wakeup: Notify::new(),
            };
            let outcome = clock.sleep_until(clock.now() + 120_000).await;
            assert_eq!(outcome, SleepOutcome::Elapsed);
            assert!(clock.now() >= 120_000);
        });
    }

    #[test]
    fn test_sleep_until_past_deadline_returns_immediately() {
        paused_runtime().block_on(async {
            let clock = MonotonicClock {
                source: ClockSource::high_resolution(),
                wakeup: Notify::new(),
            };
            time::advance(Duration::from_millis(1)).await;
            assert_eq!(clock.sleep_until(10).await, SleepOutcome::Elapsed);
        });
    }

    #[test]
    fn test_interrupt_wakes_sleeper() {
        paused_runtime().block_on(async {
            let clock = Arc::new(MonotonicClock {
                source: ClockSource::high_resolution(),
                wakeup: Notify::new(),
            });

            let sleeper = {
                let clock = clock.clone();
                tokio::spawn(async move {
                    clock.sleep(Duration::from_secs(3600)).await
                })
            };

            time::sleep(Duration::from_millis(10)).await;
            clock.interrupt();

            let outcome = sleeper.await.unwrap();
            assert_eq!(outcome, SleepOutcome::Interrupted);
            assert!(clock.now() < 1_000_000);
        });
    }

    #[test]
    fn test_wall_clock_is_monotonic() {
        let clock = MonotonicClock::wall_clock();
        assert!(clock.uses_wall_clock());

        let mut prev = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn test_new_picks_a_source() {
        let clock = MonotonicClock::new();
        let t0 = clock.now_micros();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now_micros() >= t0 + 1_000);
    }
}
