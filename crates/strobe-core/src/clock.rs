// SPDX-License-Identifier: CEPL-1.0
//! Host-side monotonic time.
//!
//! Everything that paces frames reads time through [`Clock`] so the pacing
//! code can run against a [`ManualClock`] in tests and in the simulated
//! backend, where "sleeping" just advances the clock.

use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic host clock. `now()` is measured from an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
    fn sleep(&self, dur: Duration);
}

/// Wall clock backed by [`Instant`] and `std::thread::sleep`.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// `CLOCK_MONOTONIC` read directly, so timestamps line up with clocks that
/// report absolute monotonic time (Vulkan display timing uses this domain).
#[cfg(unix)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

#[cfg(unix)]
impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
        let secs = u64::try_from(ts.tv_sec).unwrap_or(0);
        let nanos = u32::try_from(ts.tv_nsec).unwrap_or(0).min(999_999_999);
        Duration::new(secs, nanos)
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// Deterministic clock. Clones share the same time; `sleep` advances it.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(start: Duration) -> Self {
        let c = Self::new();
        c.set(start);
        c
    }

    pub fn advance(&self, dur: Duration) {
        self.nanos.fetch_add(dur_to_nanos(dur), Ordering::SeqCst);
    }

    pub fn set(&self, at: Duration) {
        self.nanos.store(dur_to_nanos(at), Ordering::SeqCst);
    }

    /// Total time slept or advanced since construction, in nanoseconds.
    pub fn nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos())
    }

    fn sleep(&self, dur: Duration) {
        self.advance(dur);
    }
}

fn dur_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let a = ManualClock::new();
        let b = a.clone();
        a.advance(Duration::from_millis(3));
        b.sleep(Duration::from_millis(2));
        assert_eq!(a.now(), Duration::from_millis(5));
        assert_eq!(b.nanos(), 5_000_000);
    }

    #[test]
    fn manual_clock_set_overrides() {
        let c = ManualClock::starting_at(Duration::from_secs(1));
        c.set(Duration::from_millis(10));
        assert_eq!(c.now(), Duration::from_millis(10));
    }

    #[cfg(unix)]
    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let c = MonotonicClock;
        let a = c.now();
        let b = c.now();
        assert!(b >= a);
        assert!(a > Duration::ZERO);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let c = SystemClock::new();
        let a = c.now();
        let b = c.now();
        assert!(b >= a);
    }
}
