// SPDX-License-Identifier: CEPL-1.0
//! Present-time scheduling from backend-reported scan-out times.
//!
//! Every request is remembered with the host time it was made at. When the
//! backend later reports when that present actually hit the display, the
//! difference is folded into a filtered request-to-scanout offset and the
//! reported time becomes the anchor of the vsync grid. The next frame asks
//! for the first vsync after `now + offset`, never earlier than
//! `sync_interval` refreshes after the previous request.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::debug;

use crate::config::PredictiveConfig;
use crate::timing::{PastPresentTiming, PresentId, PresentTimingSample};

const MAX_PENDING: usize = 64;

#[derive(Debug)]
pub struct PredictivePacer {
    refresh_ns: u64,
    weight: f64,
    max_offset_ns: f64,
    sync_interval: Option<u32>,
    offset_ns: Option<f64>,
    anchor_ns: Option<u64>,
    last_scheduled_ns: Option<u64>,
    pending: VecDeque<PresentTimingSample>,
    min_valid_id: PresentId,
    folded: u64,
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl PredictivePacer {
    pub fn new(refresh: Duration, cfg: &PredictiveConfig) -> Self {
        let refresh_ns = nanos(refresh).max(1);
        Self {
            refresh_ns,
            weight: f64::from(cfg.filter_weight),
            max_offset_ns: (refresh_ns * u64::from(cfg.max_offset_refreshes.max(1))) as f64,
            sync_interval: None,
            offset_ns: None,
            anchor_ns: None,
            last_scheduled_ns: None,
            pending: VecDeque::with_capacity(MAX_PENDING),
            min_valid_id: PresentId::default(),
            folded: 0,
        }
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_nanos(self.refresh_ns)
    }

    pub fn offset(&self) -> Option<Duration> {
        self.offset_ns.map(|o| Duration::from_nanos(o.max(0.0) as u64))
    }

    pub fn anchor_ns(&self) -> Option<u64> {
        self.anchor_ns
    }

    /// Reports folded into the filter so far.
    pub fn folded(&self) -> u64 {
        self.folded
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Forgets everything and ignores reports for IDs below `next_id`.
    pub fn reset(&mut self, next_id: PresentId) {
        self.offset_ns = None;
        self.forget_timeline(next_id);
    }

    /// The vsync grid of the old set is meaningless for the new one; the
    /// offset estimate still holds.
    pub fn on_surface_rebuilt(&mut self, next_id: PresentId) {
        self.forget_timeline(next_id);
    }

    fn forget_timeline(&mut self, next_id: PresentId) {
        self.anchor_ns = None;
        self.last_scheduled_ns = None;
        self.pending.clear();
        self.min_valid_id = self.min_valid_id.max(next_id);
    }

    pub fn ingest(&mut self, reports: &[PastPresentTiming]) {
        for report in reports {
            if report.present_id < self.min_valid_id {
                debug!("dropping timing of present {} from before reset", report.present_id.0);
                continue;
            }
            let Some(pos) = self
                .pending
                .iter()
                .position(|s| s.present_id == report.present_id)
            else {
                continue;
            };
            let Some(mut sample) = self.pending.remove(pos) else {
                continue;
            };
            let delta = (sample.complete(report.actual_present_ns) as f64).clamp(0.0, self.max_offset_ns);
            self.offset_ns = Some(match self.offset_ns {
                Some(o) => (o * self.weight + delta) / (self.weight + 1.0),
                None => delta,
            });
            self.anchor_ns = Some(
                self.anchor_ns
                    .map_or(report.actual_present_ns, |a| a.max(report.actual_present_ns)),
            );
            self.folded += 1;
        }
    }

    /// First grid point at or after `t`.
    fn vsync_at_or_after(&self, t: u64, anchor: u64) -> u64 {
        if t <= anchor {
            return anchor;
        }
        let periods = (t - anchor).div_ceil(self.refresh_ns);
        anchor + periods * self.refresh_ns
    }

    /// Registers present `present_id` requested at `now` and returns the
    /// desired scan-out time, in host nanoseconds, if one can be predicted.
    pub fn schedule(&mut self, sync_interval: u32, present_id: PresentId, now: Duration) -> Option<u64> {
        if self.sync_interval != Some(sync_interval) {
            if self.sync_interval.is_some() {
                debug!("sync interval changed to {sync_interval}, resetting present timing history");
            }
            self.sync_interval = Some(sync_interval);
            self.reset(present_id);
        }
        if sync_interval == 0 {
            return None;
        }

        if self.pending.len() == MAX_PENDING {
            self.pending.pop_front();
        }
        self.pending
            .push_back(PresentTimingSample::requested(present_id, now));

        let (Some(offset), Some(anchor)) = (self.offset_ns, self.anchor_ns) else {
            return None;
        };
        let earliest = nanos(now).saturating_add(offset.max(0.0) as u64);
        let mut target = self.vsync_at_or_after(earliest, anchor);
        if let Some(last) = self.last_scheduled_ns {
            let spaced = last.saturating_add(u64::from(sync_interval) * self.refresh_ns);
            target = target.max(self.vsync_at_or_after(spaced, anchor));
        }
        self.last_scheduled_ns = Some(target);
        debug!(
            "predictive pacing: present {} at {}ns (offset {:.3}ms)",
            present_id.0,
            target,
            offset / 1e6
        );
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const REFRESH_NS: u64 = 16_000_000;

    fn pacer() -> PredictivePacer {
        PredictivePacer::new(Duration::from_nanos(REFRESH_NS), &PredictiveConfig::default())
    }

    fn report(id: u64, at: u64) -> PastPresentTiming {
        PastPresentTiming {
            present_id: PresentId(id),
            actual_present_ns: at,
        }
    }

    #[test]
    fn cold_start_has_no_target() {
        let mut p = pacer();
        assert_eq!(p.schedule(1, PresentId(1), Duration::from_millis(1)), None);
        assert_eq!(p.schedule(1, PresentId(2), Duration::from_millis(17)), None);
        assert_eq!(p.pending(), 2);
    }

    #[test]
    fn first_sample_seeds_offset_and_anchor() {
        let mut p = pacer();
        p.schedule(1, PresentId(1), Duration::from_millis(10));
        p.ingest(&[report(1, 30_000_000)]);
        assert_eq!(p.offset(), Some(Duration::from_millis(20)));
        assert_eq!(p.anchor_ns(), Some(30_000_000));

        // now 40ms + 20ms offset = 60ms; grid 30, 46, 62 → 62ms.
        let t = p.schedule(1, PresentId(2), Duration::from_millis(40)).unwrap();
        assert_eq!(t, 62_000_000);
    }

    #[test]
    fn filter_weights_history() {
        let mut p = pacer();
        p.schedule(1, PresentId(1), Duration::ZERO);
        p.schedule(1, PresentId(2), Duration::ZERO);
        p.ingest(&[report(1, 10_000_000), report(2, 21_000_000)]);
        // (10 * 10 + 21) / 11
        let offset = p.offset().unwrap().as_secs_f64() * 1e3;
        assert_relative_eq!(offset, 11.0, epsilon = 1e-6);
    }

    #[test]
    fn outliers_are_clamped() {
        let mut p = pacer();
        p.schedule(1, PresentId(1), Duration::ZERO);
        p.ingest(&[report(1, 1_000_000_000)]);
        assert_eq!(p.offset(), Some(Duration::from_nanos(4 * REFRESH_NS)));
    }

    #[test]
    fn unknown_and_stale_ids_are_ignored() {
        let mut p = pacer();
        p.schedule(1, PresentId(5), Duration::ZERO);
        p.ingest(&[report(99, 10_000_000)]);
        assert_eq!(p.folded(), 0);

        p.schedule(2, PresentId(6), Duration::ZERO);
        p.ingest(&[report(5, 10_000_000)]);
        assert_eq!(p.folded(), 0);
        assert_eq!(p.offset(), None);
    }

    #[test]
    fn sync_interval_spacing_is_respected() {
        let mut p = pacer();
        p.schedule(2, PresentId(1), Duration::ZERO);
        p.ingest(&[report(1, 16_000_000)]);
        let a = p.schedule(2, PresentId(2), Duration::from_millis(17)).unwrap();
        let b = p.schedule(2, PresentId(3), Duration::from_millis(18)).unwrap();
        assert!(b >= a + 2 * REFRESH_NS);
        assert_eq!((b - 16_000_000) % REFRESH_NS, 0);
    }

    #[test]
    fn rebuild_keeps_offset_but_drops_anchor() {
        let mut p = pacer();
        p.schedule(1, PresentId(1), Duration::ZERO);
        p.ingest(&[report(1, 8_000_000)]);
        p.on_surface_rebuilt(PresentId(4));
        assert!(p.offset().is_some());
        assert_eq!(p.anchor_ns(), None);
        assert_eq!(p.schedule(1, PresentId(4), Duration::from_millis(20)), None);
        p.ingest(&[report(2, 40_000_000)]);
        assert_eq!(p.folded(), 1);
    }
}
