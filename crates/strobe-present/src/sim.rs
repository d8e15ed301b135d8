// SPDX-License-Identifier: CEPL-1.0
//! In-memory backend with a simulated display and fault injection.
//!
//! It keeps enough state to catch contract violations (a semaphore waited
//! before it was signalled, presenting an image that was never acquired or
//! is not in the present layout) and records them instead of panicking, so
//! tests can assert on [`SimBackend::violations`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use portable_atomic::{AtomicU64, Ordering};
use serde::Deserialize;
use strobe_core::ManualClock;
use tracing::debug;

use crate::backend::{
    Acquired, BackendStatus, CommandStream, FenceHandle, ImageBarrier, ImageHandle, ImageLayout,
    PresentBackend, PresentMode, PresentRequest, QueueRole, SemaphoreHandle, SurfaceFormat,
    SurfaceHandle, SwapSetCreated, SwapSetRequest, Submission,
};
use crate::error::BackendError;
use crate::timing::PastPresentTiming;
use crate::RenderSize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub min_image_count: u32,
    pub max_image_count: u32,
    pub refresh_hz: f64,
    /// Report past presentation timing (enables predictive pacing).
    pub present_timing: bool,
    /// Presents that must follow before a timing report becomes visible.
    pub report_delay: u32,
    /// Hand each batch of timing reports out newest first.
    pub reverse_reports: bool,
    pub separate_present_queue: bool,
    pub formats: Vec<SurfaceFormat>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            min_image_count: 2,
            max_image_count: 4,
            refresh_hz: 60.0,
            present_timing: false,
            report_delay: 2,
            reverse_reports: false,
            separate_present_queue: false,
            formats: vec![SurfaceFormat::Bgra8Srgb, SurfaceFormat::Bgra8Unorm],
        }
    }
}

impl SimConfig {
    pub fn refresh(&self) -> Duration {
        let hz = if self.refresh_hz > 0.0 {
            self.refresh_hz
        } else {
            60.0
        };
        Duration::from_secs_f64(1.0 / hz)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultSite {
    Acquire,
    Present,
    CreateSet,
    /// Graphics-queue submits only.
    Submit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Returned by the next call at the site.
    Once(BackendStatus),
    /// Returned by every call at the site until cleared.
    Persistent(BackendStatus),
}

#[derive(Debug, Default)]
struct Counters {
    acquires: AtomicU64,
    presents: AtomicU64,
    set_creations: AtomicU64,
    surface_creations: AtomicU64,
    wait_idle_calls: AtomicU64,
}

/// Counters that stay readable after the backend moved into a swapchain.
#[derive(Clone, Debug, Default)]
pub struct SimStats(Arc<Counters>);

impl SimStats {
    pub fn acquires(&self) -> u64 {
        self.0.acquires.load(Ordering::Relaxed)
    }

    /// Images that reached the simulated display.
    pub fn presents(&self) -> u64 {
        self.0.presents.load(Ordering::Relaxed)
    }

    pub fn set_creations(&self) -> u64 {
        self.0.set_creations.load(Ordering::Relaxed)
    }

    pub fn surface_creations(&self) -> u64 {
        self.0.surface_creations.load(Ordering::Relaxed)
    }

    pub fn wait_idle_calls(&self) -> u64 {
        self.0.wait_idle_calls.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct SimImage {
    handle: ImageHandle,
    acquired: bool,
    layout: ImageLayout,
}

#[derive(Debug)]
struct SimSet {
    images: Vec<SimImage>,
    present_mode: PresentMode,
    cursor: usize,
}

#[derive(Debug)]
struct SimCommands {
    queue: QueueRole,
    barriers: Vec<ImageBarrier>,
}

pub struct SimBackend {
    cfg: SimConfig,
    clock: ManualClock,
    stats: SimStats,
    next_handle: u64,
    surfaces: HashMap<SurfaceHandle, bool>,
    set: Option<SimSet>,
    semaphores: HashMap<SemaphoreHandle, bool>,
    fences: HashMap<FenceHandle, bool>,
    commands: HashMap<CommandStream, SimCommands>,
    faults: Vec<(FaultSite, Fault)>,
    violations: Vec<String>,
    reports: VecDeque<(u64, PastPresentTiming)>,
    last_flip_ns: Option<u64>,
    desired: Vec<Option<u64>>,
    flips: Vec<u64>,
    present_queue_submits: u64,
}

impl SimBackend {
    pub fn new(cfg: SimConfig, clock: ManualClock) -> Self {
        Self {
            cfg,
            clock,
            stats: SimStats::default(),
            next_handle: 1,
            surfaces: HashMap::new(),
            set: None,
            semaphores: HashMap::new(),
            fences: HashMap::new(),
            commands: HashMap::new(),
            faults: Vec::new(),
            violations: Vec::new(),
            reports: VecDeque::new(),
            last_flip_ns: None,
            desired: Vec::new(),
            flips: Vec::new(),
            present_queue_submits: 0,
        }
    }

    pub fn stats(&self) -> SimStats {
        self.stats.clone()
    }

    pub fn inject(&mut self, site: FaultSite, fault: Fault) {
        self.faults.push((site, fault));
    }

    pub fn clear_faults(&mut self, site: FaultSite) {
        self.faults.retain(|(s, _)| *s != site);
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn live_semaphores(&self) -> usize {
        self.semaphores.len()
    }

    pub fn live_fences(&self) -> usize {
        self.fences.len()
    }

    pub fn present_queue_submits(&self) -> u64 {
        self.present_queue_submits
    }

    pub fn present_mode(&self) -> Option<PresentMode> {
        self.set.as_ref().map(|s| s.present_mode)
    }

    /// Desired present times received, one entry per accepted present.
    pub fn desired_present_times(&self) -> &[Option<u64>] {
        &self.desired
    }

    /// Simulated scan-out times, one entry per accepted present.
    pub fn flips(&self) -> &[u64] {
        &self.flips
    }

    fn handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn violation(&mut self, what: String) {
        debug!("sim backend violation: {what}");
        self.violations.push(what);
    }

    fn take_fault(&mut self, site: FaultSite) -> Option<BackendStatus> {
        let pos = self.faults.iter().position(|(s, _)| *s == site)?;
        let status = match self.faults[pos].1 {
            Fault::Once(status) => {
                self.faults.remove(pos);
                status
            }
            Fault::Persistent(status) => status,
        };
        if status == BackendStatus::SurfaceLost {
            for lost in self.surfaces.values_mut() {
                *lost = true;
            }
        }
        Some(status)
    }

    fn surface_lost(&self) -> bool {
        self.surfaces.values().any(|&lost| lost)
    }

    fn signal(&mut self, semaphore: SemaphoreHandle, by: &str) {
        match self.semaphores.get(&semaphore).copied() {
            Some(true) => {
                self.violation(format!("{by} signals {semaphore:?} which is still pending"))
            }
            Some(false) => {
                self.semaphores.insert(semaphore, true);
            }
            None => self.violation(format!("{by} signals unknown {semaphore:?}")),
        }
    }

    fn consume(&mut self, semaphore: SemaphoreHandle, by: &str) {
        match self.semaphores.get(&semaphore).copied() {
            Some(true) => {
                self.semaphores.insert(semaphore, false);
            }
            Some(false) => {
                self.violation(format!("{by} waits on {semaphore:?} which nothing signalled"))
            }
            None => self.violation(format!("{by} waits on unknown {semaphore:?}")),
        }
    }

    fn apply_barrier(&mut self, queue: QueueRole, barrier: &ImageBarrier) {
        let transitioned = self
            .set
            .as_mut()
            .and_then(|s| s.images.iter_mut().find(|i| i.handle == barrier.image))
            .map(|image| {
                let before = std::mem::replace(&mut image.layout, barrier.new_layout);
                (image.acquired, before)
            });
        let Some((acquired, before)) = transitioned else {
            self.violation(format!("barrier on unknown {:?}", barrier.image));
            return;
        };

        let layout_ok = barrier.old_layout == ImageLayout::Undefined
            || before == barrier.old_layout
            || (barrier.transfer.is_some() && before == barrier.new_layout);
        if !acquired {
            self.violation(format!("barrier on unacquired {:?}", barrier.image));
        }
        if !layout_ok {
            self.violation(format!(
                "{:?} is {before:?}, barrier expects {:?}",
                barrier.image, barrier.old_layout
            ));
        }
        if self.cfg.separate_present_queue
            && queue == QueueRole::Graphics
            && barrier.new_layout == ImageLayout::PresentSrc
            && barrier.transfer.is_none()
        {
            self.violation(format!(
                "{:?} handed to present without a queue family release",
                barrier.image
            ));
        }
    }

    /// Next scan-out slot for a present issued now.
    fn flip_time(&self, mode: PresentMode, desired: Option<u64>) -> u64 {
        let now = self.clock.nanos();
        if mode == PresentMode::Immediate {
            return now;
        }
        let refresh = u64::try_from(self.cfg.refresh().as_nanos()).unwrap_or(u64::MAX).max(1);
        let grid = |t: u64| t.div_ceil(refresh) * refresh;
        let mut flip = grid(now.max(1));
        if let Some(last) = self.last_flip_ns {
            flip = flip.max(last + refresh);
        }
        if let Some(desired) = desired {
            flip = flip.max(grid(desired));
        }
        flip
    }
}

impl PresentBackend for SimBackend {
    fn create_surface(&mut self) -> Result<SurfaceHandle, BackendError> {
        let h = SurfaceHandle(self.handle());
        self.surfaces.insert(h, false);
        self.stats.0.surface_creations.fetch_add(1, Ordering::Relaxed);
        Ok(h)
    }

    fn destroy_surface(&mut self, surface: SurfaceHandle) {
        if self.set.is_some() {
            self.violation(format!("{surface:?} destroyed while a set is live"));
        }
        if self.surfaces.remove(&surface).is_none() {
            self.violation(format!("unknown {surface:?} destroyed"));
        }
    }

    fn create_swap_surface_set(
        &mut self,
        surface: SurfaceHandle,
        request: &SwapSetRequest,
    ) -> Result<SwapSetCreated, BackendError> {
        const OP: &str = "create_swap_surface_set";
        if let Some(status) = self.take_fault(FaultSite::CreateSet) {
            return Err(BackendError::new(OP, status));
        }
        match self.surfaces.get(&surface) {
            None => return Err(BackendError::new(OP, BackendStatus::Other(-1))),
            Some(true) => return Err(BackendError::new(OP, BackendStatus::SurfaceLost)),
            Some(false) => {}
        }
        if self.set.is_some() {
            self.violation("swap surface set created while another is live".into());
        }

        let count = request
            .buffer_count
            .clamp(self.cfg.min_image_count, self.cfg.max_image_count.max(self.cfg.min_image_count));
        let format = if self.cfg.formats.contains(&request.format) {
            request.format
        } else {
            self.cfg.formats.first().copied().unwrap_or(request.format)
        };
        let extent = RenderSize {
            width: request.size.width.max(1),
            height: request.size.height.max(1),
        };
        let images: Vec<SimImage> = (0..count)
            .map(|_| SimImage {
                handle: ImageHandle(self.handle()),
                acquired: false,
                layout: ImageLayout::Undefined,
            })
            .collect();
        let handles = images.iter().map(|i| i.handle).collect();
        self.set = Some(SimSet {
            images,
            present_mode: request.present_mode,
            cursor: 0,
        });
        self.last_flip_ns = None;
        self.reports.clear();
        self.stats.0.set_creations.fetch_add(1, Ordering::Relaxed);

        Ok(SwapSetCreated {
            images: handles,
            buffer_count: count,
            format,
            extent,
        })
    }

    fn destroy_swap_surface_set(&mut self) {
        if self.set.take().is_none() {
            self.violation("no swap surface set to destroy".into());
        }
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreHandle, BackendError> {
        let h = SemaphoreHandle(self.handle());
        self.semaphores.insert(h, false);
        Ok(h)
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if self.semaphores.remove(&semaphore).is_none() {
            self.violation(format!("unknown {semaphore:?} destroyed"));
        }
    }

    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle, BackendError> {
        let h = FenceHandle(self.handle());
        self.fences.insert(h, signaled);
        Ok(h)
    }

    fn wait_fence(
        &mut self,
        fence: FenceHandle,
        _timeout: Option<Duration>,
    ) -> Result<bool, BackendError> {
        // Submissions retire immediately, so an unsignalled fence never
        // signals.
        self.fences
            .get(&fence)
            .copied()
            .ok_or(BackendError::new("wait_fence", BackendStatus::Other(-1)))
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> Result<(), BackendError> {
        match self.fences.get_mut(&fence) {
            Some(f) => {
                *f = false;
                Ok(())
            }
            None => Err(BackendError::new("reset_fence", BackendStatus::Other(-1))),
        }
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if self.fences.remove(&fence).is_none() {
            self.violation(format!("unknown {fence:?} destroyed"));
        }
    }

    fn acquire_next(
        &mut self,
        _timeout: Option<Duration>,
        signal: SemaphoreHandle,
    ) -> Result<Acquired, BackendStatus> {
        let suboptimal = match self.take_fault(FaultSite::Acquire) {
            Some(BackendStatus::Suboptimal) => true,
            Some(BackendStatus::Success) | None => false,
            Some(status) => return Err(status),
        };
        if self.surface_lost() {
            return Err(BackendStatus::SurfaceLost);
        }
        let Some(set) = self.set.as_mut() else {
            return Err(BackendStatus::OutOfDate);
        };
        let n = set.images.len();
        let Some(index) = (0..n)
            .map(|k| (set.cursor + k) % n)
            .find(|&i| !set.images[i].acquired)
        else {
            return Err(BackendStatus::Timeout);
        };
        set.images[index].acquired = true;
        set.cursor = (index + 1) % n;
        self.signal(signal, "acquire");
        self.stats.0.acquires.fetch_add(1, Ordering::Relaxed);
        Ok(Acquired {
            image_index: index as u32,
            suboptimal,
        })
    }

    fn begin_commands(
        &mut self,
        queue: QueueRole,
        _slot: usize,
    ) -> Result<CommandStream, BackendError> {
        let h = CommandStream(self.handle());
        self.commands.insert(
            h,
            SimCommands {
                queue,
                barriers: Vec::new(),
            },
        );
        Ok(h)
    }

    fn record_image_barrier(&mut self, commands: CommandStream, barrier: &ImageBarrier) {
        match self.commands.get_mut(&commands) {
            Some(c) => c.barriers.push(*barrier),
            None => self.violation(format!("barrier recorded into unknown {commands:?}")),
        }
    }

    fn submit(&mut self, submission: &Submission) -> Result<(), BackendError> {
        if submission.queue == QueueRole::Graphics {
            if let Some(status) = self.take_fault(FaultSite::Submit) {
                return Err(BackendError::new("submit", status));
            }
        }
        let Some(commands) = self.commands.remove(&submission.commands) else {
            return Err(BackendError::new("submit", BackendStatus::Other(-1)));
        };
        if commands.queue != submission.queue {
            self.violation(format!(
                "{:?} recorded for {:?} submitted to {:?}",
                submission.commands, commands.queue, submission.queue
            ));
        }
        if let Some(wait) = submission.wait {
            self.consume(wait, "submit");
        }
        for barrier in &commands.barriers {
            self.apply_barrier(submission.queue, barrier);
        }
        if let Some(signal) = submission.signal {
            self.signal(signal, "submit");
        }
        if let Some(fence) = submission.fence {
            match self.fences.get(&fence).copied() {
                Some(true) => self.violation(format!("{fence:?} submitted while signalled")),
                Some(false) => {
                    self.fences.insert(fence, true);
                }
                None => self.violation(format!("submit with unknown {fence:?}")),
            }
        }
        if submission.queue == QueueRole::Present {
            self.present_queue_submits += 1;
        }
        Ok(())
    }

    fn present(&mut self, request: &PresentRequest) -> BackendStatus {
        let status = match self.take_fault(FaultSite::Present) {
            Some(BackendStatus::Suboptimal) => BackendStatus::Suboptimal,
            Some(BackendStatus::Success) | None => BackendStatus::Success,
            Some(status) => return status,
        };
        if self.surface_lost() {
            return BackendStatus::SurfaceLost;
        }
        let Some(set) = self.set.as_mut() else {
            return BackendStatus::OutOfDate;
        };
        let mode = set.present_mode;
        let released = set
            .images
            .get_mut(request.image_index as usize)
            .map(|image| (std::mem::replace(&mut image.acquired, false), image.layout));
        let Some((acquired, layout)) = released else {
            self.violation(format!("present of image {} out of range", request.image_index));
            return BackendStatus::Other(-1);
        };
        if !acquired {
            self.violation(format!("present of unacquired image {}", request.image_index));
        }
        if layout != ImageLayout::PresentSrc {
            self.violation(format!(
                "present of image {} in {layout:?}",
                request.image_index
            ));
        }
        self.consume(request.wait, "present");

        let desired = request.timing.and_then(|t| t.desired_present_ns);
        let flip = self.flip_time(mode, desired);
        self.last_flip_ns = Some(flip);
        self.desired.push(desired);
        self.flips.push(flip);
        let presents = self.stats.0.presents.fetch_add(1, Ordering::Relaxed) + 1;
        if let (true, Some(timing)) = (self.cfg.present_timing, request.timing) {
            self.reports.push_back((
                presents + u64::from(self.cfg.report_delay),
                PastPresentTiming {
                    present_id: timing.present_id,
                    actual_present_ns: flip,
                },
            ));
        }
        status
    }

    fn queue_family(&self, role: QueueRole) -> u32 {
        match role {
            QueueRole::Present if self.cfg.separate_present_queue => 1,
            _ => 0,
        }
    }

    fn supports_present_timing(&self) -> bool {
        self.cfg.present_timing
    }

    fn refresh_duration(&mut self) -> Option<Duration> {
        self.cfg.present_timing.then(|| self.cfg.refresh())
    }

    fn query_past_presentation_timings(&mut self) -> Vec<PastPresentTiming> {
        let presents = self.stats.presents();
        let mut ready = Vec::new();
        while let Some(&(due, timing)) = self.reports.front() {
            if due > presents {
                break;
            }
            self.reports.pop_front();
            ready.push(timing);
        }
        if self.cfg.reverse_reports {
            ready.reverse();
        }
        ready
    }

    fn wait_idle(&mut self) -> Result<(), BackendError> {
        self.stats.0.wait_idle_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PresentTimingRequest;
    use crate::timing::PresentId;

    fn request() -> SwapSetRequest {
        SwapSetRequest {
            format: SurfaceFormat::Rgba16Float,
            size: RenderSize {
                width: 0,
                height: 10,
            },
            buffer_count: 9,
            present_mode: PresentMode::Fifo,
        }
    }

    #[test]
    fn set_negotiation_clamps_and_substitutes() {
        let mut b = SimBackend::new(SimConfig::default(), ManualClock::new());
        let s = b.create_surface().unwrap();
        let created = b.create_swap_surface_set(s, &request()).unwrap();
        assert_eq!(created.buffer_count, 4);
        assert_eq!(created.images.len(), 4);
        assert_eq!(created.format, SurfaceFormat::Bgra8Srgb);
        assert_eq!(created.extent.width, 1);
    }

    #[test]
    fn lost_surface_blocks_set_creation_until_replaced() {
        let mut b = SimBackend::new(SimConfig::default(), ManualClock::new());
        let s = b.create_surface().unwrap();
        b.create_swap_surface_set(s, &request()).unwrap();
        let sem = b.create_semaphore().unwrap();
        b.inject(FaultSite::Acquire, Fault::Once(BackendStatus::SurfaceLost));
        assert_eq!(b.acquire_next(None, sem), Err(BackendStatus::SurfaceLost));
        // Still lost without a fault queued.
        assert_eq!(b.acquire_next(None, sem), Err(BackendStatus::SurfaceLost));

        b.destroy_swap_surface_set();
        let err = b.create_swap_surface_set(s, &request()).unwrap_err();
        assert_eq!(err.status, BackendStatus::SurfaceLost);
        b.destroy_surface(s);
        let s2 = b.create_surface().unwrap();
        b.create_swap_surface_set(s2, &request()).unwrap();
        assert!(b.acquire_next(None, sem).is_ok());
        assert!(b.violations().is_empty(), "{:?}", b.violations());
    }

    #[test]
    fn present_of_unprepared_image_is_flagged() {
        let mut b = SimBackend::new(SimConfig::default(), ManualClock::new());
        let s = b.create_surface().unwrap();
        b.create_swap_surface_set(s, &request()).unwrap();
        let sem = b.create_semaphore().unwrap();
        let idx = b.acquire_next(None, sem).unwrap().image_index;
        let status = b.present(&PresentRequest {
            image_index: idx,
            wait: sem,
            timing: None,
        });
        assert_eq!(status, BackendStatus::Success);
        assert_eq!(b.violations().len(), 1);
        assert!(b.violations()[0].contains("Undefined"));
    }

    #[test]
    fn fifo_flips_land_on_the_vsync_grid_and_reports_are_delayed() {
        let clock = ManualClock::new();
        let cfg = SimConfig {
            present_timing: true,
            report_delay: 1,
            ..Default::default()
        };
        let refresh = u64::try_from(cfg.refresh().as_nanos()).unwrap();
        let mut b = SimBackend::new(cfg, clock.clone());
        let s = b.create_surface().unwrap();
        b.create_swap_surface_set(s, &request()).unwrap();

        for id in 1..=3 {
            clock.advance(Duration::from_millis(1));
            let sem = b.create_semaphore().unwrap();
            let idx = b.acquire_next(None, sem).unwrap().image_index;
            b.present(&PresentRequest {
                image_index: idx,
                wait: sem,
                timing: Some(PresentTimingRequest {
                    present_id: PresentId(id),
                    desired_present_ns: None,
                }),
            });
        }
        assert_eq!(b.flips(), &[refresh, 2 * refresh, 3 * refresh]);
        let reports = b.query_past_presentation_timings();
        assert_eq!(
            reports.iter().map(|r| r.present_id.0).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(b.query_past_presentation_timings().is_empty());
    }
}
