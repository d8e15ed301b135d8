// SPDX-License-Identifier: CEPL-1.0
//! Host-side frame limiter.
//!
//! Each sample is the host time from the end of the previous frame-start
//! sleep to the current frame start, i.e. what a frame costs without the
//! limiter's own sleep. The sleep tops the rolling average (plus a margin)
//! up to the target interval.

use std::time::Duration;

use tracing::debug;

use crate::config::ReactiveConfig;

#[derive(Debug)]
pub struct ReactivePacer {
    refresh: Duration,
    sleep_margin: f64,
    overrun_warn: f64,
    reset_after: u32,
    sync_interval: Option<u32>,
    previous: Option<Duration>,
    accumulated: f64,
    samples: u32,
}

impl ReactivePacer {
    pub fn new(refresh: Duration, cfg: &ReactiveConfig) -> Self {
        Self {
            refresh,
            sleep_margin: cfg.sleep_margin().as_secs_f64(),
            overrun_warn: cfg.overrun_warn().as_secs_f64(),
            reset_after: cfg.reset_after_samples.max(1),
            sync_interval: None,
            previous: None,
            accumulated: 0.0,
            samples: 0,
        }
    }

    pub fn refresh(&self) -> Duration {
        self.refresh
    }

    pub fn target_interval(&self, sync_interval: u32) -> Duration {
        self.refresh * sync_interval
    }

    /// Current rolling average including the margin, if any samples exist.
    pub fn average(&self) -> Option<Duration> {
        (self.samples > 0).then(|| {
            Duration::from_secs_f64(self.accumulated / f64::from(self.samples) + self.sleep_margin)
        })
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.accumulated = 0.0;
        self.samples = 0;
    }

    /// Records a frame start at `now` and returns how long to sleep before
    /// the frame's work begins.
    pub fn schedule(&mut self, sync_interval: u32, now: Duration) -> Option<Duration> {
        if self.sync_interval != Some(sync_interval) {
            self.sync_interval = Some(sync_interval);
            self.reset();
        }
        if sync_interval == 0 {
            return None;
        }
        let previous = self.previous.replace(now)?;

        self.accumulated += now.saturating_sub(previous).as_secs_f64();
        self.samples += 1;
        let raw = self.accumulated / f64::from(self.samples);
        let average = raw + self.sleep_margin;
        if self.samples > self.reset_after {
            self.accumulated = raw;
            self.samples = 1;
        }

        let target = self.target_interval(sync_interval).as_secs_f64();
        if average < target {
            let sleep = Duration::from_secs_f64(target - average);
            self.previous = Some(now + sleep);
            debug!(
                "reactive pacing: avg {:.3}ms target {:.3}ms, sleeping {:.3}ms",
                average * 1e3,
                target * 1e3,
                sleep.as_secs_f64() * 1e3
            );
            Some(sleep)
        } else {
            if average > target + self.overrun_warn {
                debug!(
                    "reactive pacing falling behind: avg {:.3}ms target {:.3}ms",
                    average * 1e3,
                    target * 1e3
                );
            }
            None
        }
    }
}
