// SPDX-License-Identifier: CEPL-1.0
//! The per-window presentation facade.

use std::sync::Arc;

use strobe_core::Clock;
use tracing::{error, info};

use crate::acquire::{AcquireOutcome, AcquisitionEngine, FrameLease};
use crate::backend::{
    CommandStream, PresentBackend, PresentMode, QueueRole, SurfaceFormat, SwapSetRequest,
};
use crate::config::PresentConfig;
use crate::dispatch::PresentationDispatcher;
use crate::error::{PresentError, PresentResult};
use crate::pacing::{FramePacer, PacingMode};
use crate::recovery::{Attempt, Degradation, RecoveryController, SwapchainState};
use crate::targets::PresentTargets;
use crate::timing::PresentId;
use crate::RenderSize;

fn classify(outcome: AcquireOutcome) -> Attempt<FrameLease> {
    match outcome {
        AcquireOutcome::Acquired(lease) => Attempt::Complete(lease),
        AcquireOutcome::Stale => Attempt::Retry(Degradation::OutOfDate),
        AcquireOutcome::Lost => Attempt::Retry(Degradation::SurfaceLost),
    }
}

/// Owns the swap surfaces of one window and drives
/// acquire → record → present for it.
///
/// Out-of-date and lost surfaces are rebuilt internally; only
/// [`PresentError`]s reach the caller, and after one the swapchain can
/// only be destroyed. Misuse (present without acquire, acquiring twice,
/// resizing with an image outstanding, use after destroy or after a fatal
/// error) panics.
pub struct Swapchain<B: PresentBackend> {
    targets: PresentTargets<B>,
    acquisition: AcquisitionEngine,
    dispatcher: PresentationDispatcher,
    recovery: RecoveryController,
    pacer: FramePacer,
    clock: Arc<dyn Clock>,
    lease: Option<FrameLease>,
    sync_interval: u32,
}

impl<B: PresentBackend> Swapchain<B> {
    pub fn new(
        backend: B,
        size: RenderSize,
        sync_interval: u32,
        cfg: &PresentConfig,
        clock: Arc<dyn Clock>,
    ) -> PresentResult<Self> {
        let request = SwapSetRequest {
            format: cfg.desired_format,
            size,
            buffer_count: cfg.desired_buffer_count,
            present_mode: PresentMode::for_sync_interval(sync_interval),
        };
        let mut targets = PresentTargets::create(backend, request, cfg.use_acquire_fences)
            .map_err(|e| {
                error!("swapchain creation failed: {e}");
                PresentError::InitialCreation(e)
            })?;
        let pacer = FramePacer::select(cfg, targets.backend_mut());

        Ok(Self {
            targets,
            acquisition: AcquisitionEngine::new(cfg.acquire_timeout()),
            dispatcher: PresentationDispatcher::new(),
            recovery: RecoveryController::new(cfg.max_recovery_attempts),
            pacer,
            clock,
            lease: None,
            sync_interval,
        })
    }

    fn assert_alive(&self) {
        match self.recovery.state() {
            SwapchainState::Destroyed => panic!("swapchain used after destroy"),
            SwapchainState::Failed => panic!("swapchain used after a fatal presentation error"),
            _ => {}
        }
    }

    /// A fence reset before a failed submit never signals again, so any
    /// error ends the swapchain's useful life.
    fn fail_on_error<T>(&mut self, result: PresentResult<T>) -> PresentResult<T> {
        if let Err(e) = &result {
            error!("swapchain failed, only destroy is allowed now: {e}");
            self.lease = None;
            self.recovery.mark_failed();
        }
        result
    }

    fn note_rebuild_since(&mut self, generation: u64) {
        if self.targets.generation() != generation {
            self.pacer
                .on_surface_rebuilt(self.dispatcher.peek_present_id());
        }
    }

    /// Acquires the next back buffer, rebuilding the set as needed. The
    /// reactive limiter sleeps here, before the frame's work starts.
    pub fn acquire_back_buffer(&mut self) -> PresentResult<FrameLease> {
        self.assert_alive();
        assert!(
            self.lease.is_none(),
            "acquire_back_buffer called while a back buffer is still acquired"
        );
        self.pacer
            .pace_frame_start(self.sync_interval, self.clock.as_ref());
        let result = self.acquire_with_recovery();
        let lease = self.fail_on_error(result)?;
        self.lease = Some(lease);
        Ok(lease)
    }

    fn acquire_with_recovery(&mut self) -> PresentResult<FrameLease> {
        let generation = self.targets.generation();
        let Self {
            targets,
            acquisition,
            recovery,
            ..
        } = &mut *self;
        let lease = recovery.run(targets, |t| acquisition.acquire(t).map(classify))?;
        self.note_rebuild_since(generation);
        Ok(lease)
    }

    /// The acquired back buffer, if any.
    pub fn current_surface(&self) -> Option<FrameLease> {
        self.lease
    }

    /// Opens the command stream of the current frame.
    pub fn begin_commands(&mut self) -> PresentResult<CommandStream> {
        self.assert_alive();
        let Some(lease) = self.lease else {
            panic!("begin_commands without an acquired back buffer");
        };
        let result = self
            .targets
            .backend_mut()
            .begin_commands(QueueRole::Graphics, lease.slot)
            .map_err(PresentError::from);
        self.fail_on_error(result)
    }

    /// Records the transition that makes the back buffer renderable.
    pub fn prepare_for_rendering(&mut self, commands: CommandStream) {
        let Some(lease) = self.lease else {
            panic!("prepare_for_rendering without an acquired back buffer");
        };
        self.dispatcher
            .prepare_for_rendering(self.targets.backend_mut(), commands, &lease);
    }

    /// Submits `commands` and presents the acquired back buffer at the
    /// pacer's target time. The lease is returned whatever the outcome.
    pub fn present(&mut self, commands: CommandStream, sync_interval: u32) -> PresentResult<PresentId> {
        self.assert_alive();
        let Some(lease) = self.lease.take() else {
            panic!("present called without an acquired back buffer");
        };
        let result = self.submit_and_present(lease, commands, sync_interval);
        self.fail_on_error(result)
    }

    fn submit_and_present(
        &mut self,
        lease: FrameLease,
        commands: CommandStream,
        sync_interval: u32,
    ) -> PresentResult<PresentId> {
        self.dispatcher.submit(&mut self.targets, &lease, commands)?;

        let mut target = self.pacer.schedule_next_frame(
            sync_interval,
            self.dispatcher.peek_present_id(),
            self.clock.as_ref(),
            self.targets.backend_mut(),
        );

        let generation = self.targets.generation();
        let Self {
            targets,
            acquisition,
            dispatcher,
            recovery,
            ..
        } = &mut *self;
        let mut lease = lease;
        let id = recovery.run(targets, |t| {
            if lease.generation != t.generation() {
                // The image went away with the old set. A fresh one is
                // acquired and presented so the retry bound still covers
                // present; it shows undefined content for this frame.
                lease = match classify(acquisition.acquire(t)?) {
                    Attempt::Complete(l) => l,
                    Attempt::Retry(d) => return Ok(Attempt::Retry(d)),
                };
                dispatcher.submit_boundary_only(t, &lease)?;
                target = None;
            }
            dispatcher.present(t, &lease, target)
        })?;
        self.note_rebuild_since(generation);

        if (sync_interval == 0) != (self.sync_interval == 0) {
            let mode = PresentMode::for_sync_interval(sync_interval);
            info!(
                "sync interval {} -> {sync_interval}, switching to {mode:?}",
                self.sync_interval
            );
            self.targets.request.present_mode = mode;
            let generation = self.targets.generation();
            self.recovery.rebuild_now(&mut self.targets, false)?;
            self.note_rebuild_since(generation);
        }
        self.sync_interval = sync_interval;
        Ok(id)
    }

    /// Rebuilds the set at a new size.
    pub fn resize(&mut self, size: RenderSize) -> PresentResult<()> {
        self.assert_alive();
        assert!(
            self.lease.is_none(),
            "resize while a back buffer is acquired"
        );
        self.targets.request.size = size;
        self.rebuild(false)
    }

    fn rebuild(&mut self, new_surface: bool) -> PresentResult<()> {
        let generation = self.targets.generation();
        let result = self.recovery.rebuild_now(&mut self.targets, new_surface);
        self.fail_on_error(result)?;
        self.note_rebuild_since(generation);
        Ok(())
    }

    /// Replaces the window-system surface, e.g. after the window was
    /// recreated.
    pub fn rebind_surface(&mut self) -> PresentResult<()> {
        self.assert_alive();
        assert!(
            self.lease.is_none(),
            "rebind_surface while a back buffer is acquired"
        );
        self.rebuild(true)
    }

    /// Waits for the GPU and releases every presentation resource. Allowed
    /// after a fatal error.
    pub fn destroy(&mut self) {
        assert!(
            self.recovery.state() != SwapchainState::Destroyed,
            "swapchain destroyed twice"
        );
        self.lease = None;
        self.targets.release();
        self.recovery.mark_destroyed();
        info!("swapchain destroyed");
    }

    pub fn state(&self) -> SwapchainState {
        self.recovery.state()
    }

    pub fn rebuilds(&self) -> u64 {
        self.recovery.rebuilds()
    }

    pub fn presents_completed(&self) -> u64 {
        self.dispatcher.presents_completed()
    }

    /// Successful acquires, including those made while retrying a present.
    pub fn acquires(&self) -> u64 {
        self.acquisition.acquired()
    }

    pub fn suboptimal_acquires(&self) -> u64 {
        self.acquisition.suboptimal()
    }

    pub fn pacing_mode(&self) -> PacingMode {
        self.pacer.mode()
    }

    pub fn generation(&self) -> u64 {
        self.targets.generation()
    }

    pub fn buffer_count(&self) -> usize {
        self.targets.set().map_or(0, |s| s.len())
    }

    pub fn format(&self) -> Option<SurfaceFormat> {
        self.targets.set().map(|s| s.format())
    }

    pub fn extent(&self) -> Option<RenderSize> {
        self.targets.set().map(|s| s.extent())
    }

    pub fn sync_interval(&self) -> u32 {
        self.sync_interval
    }

    pub fn backend(&self) -> &B {
        self.targets.backend()
    }

    pub fn backend_mut(&mut self) -> &mut B {
        self.targets.backend_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendStatus;
    use crate::sim::{Fault, FaultSite, SimBackend, SimConfig};
    use std::time::Duration;
    use strobe_core::ManualClock;

    fn timed_swapchain() -> (Swapchain<SimBackend>, ManualClock) {
        let clock = ManualClock::new();
        let b = SimBackend::new(SimConfig::default(), clock.clone());
        let sc = Swapchain::new(
            b,
            RenderSize {
                width: 800,
                height: 600,
            },
            1,
            &PresentConfig::default(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (sc, clock)
    }

    fn swapchain() -> Swapchain<SimBackend> {
        timed_swapchain().0
    }

    fn frame(sc: &mut Swapchain<SimBackend>, sync_interval: u32) -> PresentId {
        sc.acquire_back_buffer().unwrap();
        let cmd = sc.begin_commands().unwrap();
        sc.prepare_for_rendering(cmd);
        sc.present(cmd, sync_interval).unwrap()
    }

    #[test]
    #[should_panic(expected = "without an acquired back buffer")]
    fn present_without_acquire_panics() {
        let mut sc = swapchain();
        sc.present(CommandStream(0), 1).ok();
    }

    #[test]
    #[should_panic(expected = "still acquired")]
    fn double_acquire_panics() {
        let mut sc = swapchain();
        sc.acquire_back_buffer().unwrap();
        sc.acquire_back_buffer().ok();
    }

    #[test]
    #[should_panic(expected = "resize while a back buffer is acquired")]
    fn resize_with_lease_panics() {
        let mut sc = swapchain();
        sc.acquire_back_buffer().unwrap();
        sc.resize(RenderSize {
            width: 10,
            height: 10,
        })
        .ok();
    }

    #[test]
    #[should_panic(expected = "destroyed twice")]
    fn double_destroy_panics() {
        let mut sc = swapchain();
        sc.destroy();
        sc.destroy();
    }

    #[test]
    #[should_panic(expected = "used after destroy")]
    fn acquire_after_destroy_panics() {
        let mut sc = swapchain();
        sc.destroy();
        sc.acquire_back_buffer().ok();
    }

    #[test]
    fn present_ids_increase_and_lease_clears() {
        let mut sc = swapchain();
        let a = frame(&mut sc, 1);
        assert!(sc.current_surface().is_none());
        let b = frame(&mut sc, 1);
        assert!(b > a);
        assert_eq!(sc.presents_completed(), 2);
    }

    #[test]
    fn resize_rebuilds_with_new_extent() {
        let mut sc = swapchain();
        frame(&mut sc, 1);
        sc.resize(RenderSize {
            width: 1024,
            height: 768,
        })
        .unwrap();
        assert_eq!(sc.extent().unwrap().width, 1024);
        assert_eq!(sc.generation(), 2);
        assert_eq!(sc.state(), SwapchainState::Healthy);
        frame(&mut sc, 1);
    }

    #[test]
    fn vsync_toggle_switches_present_mode() {
        let mut sc = swapchain();
        frame(&mut sc, 1);
        assert_eq!(sc.generation(), 1);
        frame(&mut sc, 0);
        assert_eq!(sc.generation(), 2);
        assert_eq!(sc.backend().present_mode(), Some(PresentMode::Immediate));
        frame(&mut sc, 0);
        assert_eq!(sc.generation(), 2);
        frame(&mut sc, 2);
        assert_eq!(sc.generation(), 3);
        assert_eq!(sc.backend().present_mode(), Some(PresentMode::Fifo));
    }

    #[test]
    fn rebind_surface_makes_a_new_surface() {
        let mut sc = swapchain();
        let stats = sc.backend().stats();
        sc.rebind_surface().unwrap();
        assert_eq!(stats.surface_creations(), 2);
        frame(&mut sc, 1);
        assert!(sc.backend().violations().is_empty());
    }

    #[test]
    fn reactive_sleep_happens_before_the_frame_starts() {
        let (mut sc, clock) = timed_swapchain();
        assert_eq!(sc.pacing_mode(), PacingMode::Reactive);
        for i in 0..10 {
            let before_acquire = clock.now();
            sc.acquire_back_buffer().unwrap();
            let slept = clock.now() - before_acquire;
            if i == 0 {
                assert_eq!(slept, Duration::ZERO);
            } else {
                // 4ms of work plus a 2ms margin against a 1/60s target.
                assert!(slept > Duration::from_millis(10), "{slept:?}");
            }
            let cmd = sc.begin_commands().unwrap();
            sc.prepare_for_rendering(cmd);
            clock.advance(Duration::from_millis(4));
            let submitted = clock.now();
            sc.present(cmd, 1).unwrap();
            assert_eq!(clock.now(), submitted);
        }
    }

    #[test]
    #[should_panic(expected = "after a fatal presentation error")]
    fn acquire_after_fatal_error_panics() {
        let mut sc = swapchain();
        sc.backend_mut()
            .inject(FaultSite::Acquire, Fault::Once(BackendStatus::DeviceLost));
        assert!(sc.acquire_back_buffer().is_err());
        assert_eq!(sc.state(), SwapchainState::Failed);
        sc.acquire_back_buffer().ok();
    }

    #[test]
    fn failed_submit_leaves_only_destroy() {
        let mut sc = swapchain();
        frame(&mut sc, 1);
        sc.acquire_back_buffer().unwrap();
        let cmd = sc.begin_commands().unwrap();
        sc.prepare_for_rendering(cmd);
        sc.backend_mut()
            .inject(FaultSite::Submit, Fault::Once(BackendStatus::DeviceLost));
        let err = sc.present(cmd, 1).unwrap_err();
        assert!(matches!(err, PresentError::Backend(_)));
        assert_eq!(sc.state(), SwapchainState::Failed);
        assert!(sc.current_surface().is_none());

        sc.destroy();
        assert_eq!(sc.state(), SwapchainState::Destroyed);
        assert_eq!(sc.backend().live_semaphores(), 0);
        assert_eq!(sc.backend().live_fences(), 0);
    }

    #[test]
    #[should_panic(expected = "after a fatal presentation error")]
    fn resize_after_fatal_error_panics() {
        let mut sc = swapchain();
        sc.backend_mut()
            .inject(FaultSite::Acquire, Fault::Once(BackendStatus::Other(-4)));
        sc.acquire_back_buffer().unwrap_err();
        sc.resize(RenderSize {
            width: 10,
            height: 10,
        })
        .ok();
    }

    #[test]
    fn present_retry_after_rebuild_uses_an_image_of_the_new_set() {
        let mut sc = swapchain();
        frame(&mut sc, 1);
        sc.acquire_back_buffer().unwrap();
        let cmd = sc.begin_commands().unwrap();
        sc.prepare_for_rendering(cmd);
        sc.backend_mut()
            .inject(FaultSite::Present, Fault::Once(BackendStatus::OutOfDate));
        sc.present(cmd, 1).unwrap();

        assert_eq!(sc.generation(), 2);
        assert_eq!(sc.presents_completed(), 2);
        // The retry acquired a second image for the same present call.
        assert_eq!(sc.acquires(), 3);
        assert!(sc.backend().violations().is_empty(), "{:#?}", sc.backend().violations());
        frame(&mut sc, 1);
        assert!(sc.backend().violations().is_empty(), "{:#?}", sc.backend().violations());
    }

    #[test]
    fn acquire_counters_are_reported() {
        let mut sc = swapchain();
        sc.backend_mut()
            .inject(FaultSite::Acquire, Fault::Once(BackendStatus::Suboptimal));
        for _ in 0..3 {
            frame(&mut sc, 1);
        }
        assert_eq!(sc.acquires(), 3);
        assert_eq!(sc.suboptimal_acquires(), 1);
    }
}
