// SPDX-License-Identifier: CEPL-1.0
//! Frame pacing. The mode is picked once per swapchain.

mod predictive;
mod reactive;

pub use predictive::PredictivePacer;
pub use reactive::ReactivePacer;

use std::time::Duration;

use strobe_core::Clock;
use tracing::info;

use crate::backend::PresentBackend;
use crate::config::{PacingPreference, PresentConfig};
use crate::timing::PresentId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacingMode {
    Disabled,
    Reactive,
    Predictive,
}

#[derive(Debug)]
pub enum FramePacer {
    Disabled,
    Reactive(ReactivePacer),
    Predictive(PredictivePacer),
}

impl FramePacer {
    pub fn select<B: PresentBackend>(cfg: &PresentConfig, backend: &mut B) -> Self {
        let refresh = backend.refresh_duration();
        let pacer = match (cfg.pacing, backend.supports_present_timing(), refresh) {
            (PacingPreference::Disabled, _, _) => Self::Disabled,
            (PacingPreference::Auto, true, Some(refresh)) => {
                Self::Predictive(PredictivePacer::new(refresh, &cfg.predictive))
            }
            (_, _, refresh) => Self::Reactive(ReactivePacer::new(
                refresh.unwrap_or_else(|| cfg.reactive.fallback_refresh()),
                &cfg.reactive,
            )),
        };
        match &pacer {
            Self::Disabled => info!("frame pacing disabled"),
            Self::Reactive(p) => info!("frame pacing: reactive, refresh {:?}", p.refresh()),
            Self::Predictive(p) => info!("frame pacing: predictive, refresh {:?}", p.refresh()),
        }
        pacer
    }

    pub fn mode(&self) -> PacingMode {
        match self {
            Self::Disabled => PacingMode::Disabled,
            Self::Reactive(_) => PacingMode::Reactive,
            Self::Predictive(_) => PacingMode::Predictive,
        }
    }

    /// Called before a new frame's work starts. Only the reactive limiter
    /// blocks, and only here; returns the sleep taken.
    pub fn pace_frame_start(&mut self, sync_interval: u32, clock: &dyn Clock) -> Option<Duration> {
        let Self::Reactive(p) = self else {
            return None;
        };
        let slept = p.schedule(sync_interval, clock.now())?;
        clock.sleep(slept);
        Some(slept)
    }

    /// Called right before the present tagged `present_id` is issued.
    /// Returns the scan-out time to request, host nanoseconds.
    pub fn schedule_next_frame<B: PresentBackend>(
        &mut self,
        sync_interval: u32,
        present_id: PresentId,
        clock: &dyn Clock,
        backend: &mut B,
    ) -> Option<u64> {
        let Self::Predictive(p) = self else {
            return None;
        };
        let reports = backend.query_past_presentation_timings();
        p.ingest(&reports);
        p.schedule(sync_interval, present_id, clock.now())
    }

    pub fn on_surface_rebuilt(&mut self, next_id: PresentId) {
        match self {
            Self::Disabled => {}
            Self::Reactive(p) => p.reset(),
            Self::Predictive(p) => p.on_surface_rebuilt(next_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBackend, SimConfig};
    use strobe_core::ManualClock;

    fn backend(timing: bool) -> SimBackend {
        SimBackend::new(
            SimConfig {
                present_timing: timing,
                ..Default::default()
            },
            ManualClock::new(),
        )
    }

    #[test]
    fn selection_follows_capability_and_preference() {
        let mut cfg = PresentConfig::default();
        assert_eq!(FramePacer::select(&cfg, &mut backend(true)).mode(), PacingMode::Predictive);
        assert_eq!(FramePacer::select(&cfg, &mut backend(false)).mode(), PacingMode::Reactive);
        cfg.pacing = PacingPreference::Reactive;
        assert_eq!(FramePacer::select(&cfg, &mut backend(true)).mode(), PacingMode::Reactive);
        cfg.pacing = PacingPreference::Disabled;
        assert_eq!(FramePacer::select(&cfg, &mut backend(true)).mode(), PacingMode::Disabled);
    }

    #[test]
    fn reactive_sleeps_through_the_clock() {
        let clock = ManualClock::new();
        let mut b = backend(false);
        let mut p = FramePacer::select(&PresentConfig::default(), &mut b);
        assert_eq!(p.pace_frame_start(1, &clock), None);
        clock.advance(Duration::from_millis(4));
        let slept = p.pace_frame_start(1, &clock).unwrap();
        assert!(slept > Duration::from_millis(10));
        assert_eq!(clock.now(), Duration::from_millis(4) + slept);
        assert_eq!(p.schedule_next_frame(1, PresentId(1), &clock, &mut b), None);
        assert_eq!(clock.now(), Duration::from_millis(4) + slept);
    }

    #[test]
    fn predictive_never_sleeps_at_frame_start() {
        let clock = ManualClock::new();
        let mut b = backend(true);
        let mut p = FramePacer::select(&PresentConfig::default(), &mut b);
        for _ in 0..4 {
            clock.advance(Duration::from_millis(4));
            assert_eq!(p.pace_frame_start(1, &clock), None);
        }
        assert_eq!(clock.now(), Duration::from_millis(16));
    }

    #[test]
    fn zero_interval_is_pass_through_for_every_mode() {
        let clock = ManualClock::new();
        for timing in [false, true] {
            let mut b = backend(timing);
            let mut p = FramePacer::select(&PresentConfig::default(), &mut b);
            for id in 1..5 {
                clock.advance(Duration::from_millis(1));
                assert_eq!(p.pace_frame_start(0, &clock), None);
                assert_eq!(p.schedule_next_frame(0, PresentId(id), &clock, &mut b), None);
            }
        }
    }
}
