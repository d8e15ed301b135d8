// SPDX-License-Identifier: CEPL-1.0
//! Bounded rebuild-and-retry loop shared by acquire and present.

use tracing::{debug, error, warn};

use crate::backend::{BackendStatus, PresentBackend};
use crate::error::{BackendError, PresentError, PresentResult};
use crate::targets::PresentTargets;

/// Transient failure that a rebuild can fix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Degradation {
    OutOfDate,
    SurfaceLost,
}

impl Degradation {
    pub fn from_status(status: BackendStatus) -> Option<Self> {
        match status {
            BackendStatus::OutOfDate => Some(Self::OutOfDate),
            BackendStatus::SurfaceLost => Some(Self::SurfaceLost),
            _ => None,
        }
    }
}

/// Result of one run of a recoverable job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    Complete(T),
    Retry(Degradation),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Healthy,
    OutOfDate,
    SurfaceLost,
    /// A fatal error left sync state unknown; only teardown remains.
    Failed,
    Destroyed,
}

impl From<Degradation> for SwapchainState {
    fn from(d: Degradation) -> Self {
        match d {
            Degradation::OutOfDate => Self::OutOfDate,
            Degradation::SurfaceLost => Self::SurfaceLost,
        }
    }
}

#[derive(Debug)]
pub struct RecoveryController {
    max_attempts: u32,
    rebuilds: u64,
    state: SwapchainState,
}

impl RecoveryController {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            rebuilds: 0,
            state: SwapchainState::Healthy,
        }
    }

    /// Runs `job`, rebuilding and re-running it while it asks for a retry,
    /// at most `max_attempts` times.
    pub fn run<B, T, F>(&mut self, targets: &mut PresentTargets<B>, mut job: F) -> PresentResult<T>
    where
        B: PresentBackend,
        F: FnMut(&mut PresentTargets<B>) -> PresentResult<Attempt<T>>,
    {
        let mut outcome = job(targets)?;
        let mut attempts = 0;
        loop {
            let degradation = match outcome {
                Attempt::Complete(value) => {
                    self.state = SwapchainState::Healthy;
                    return Ok(value);
                }
                Attempt::Retry(d) => d,
            };
            self.state = degradation.into();

            if attempts == self.max_attempts {
                error!("swapchain still {degradation:?} after {attempts} rebuilds, giving up");
                return Err(PresentError::RecoveryExhausted {
                    attempts,
                    last: degradation,
                });
            }
            attempts += 1;

            outcome = match self.rebuild(targets, degradation, attempts) {
                Ok(()) => job(targets)?,
                Err(e) => match Degradation::from_status(e.status) {
                    Some(again) => {
                        debug!("rebuild hit {again:?}: {e}");
                        Attempt::Retry(again)
                    }
                    None => {
                        error!("swapchain rebuild failed: {e}");
                        return Err(PresentError::Rebuild(e));
                    }
                },
            };
        }
    }

    fn rebuild<B: PresentBackend>(
        &mut self,
        targets: &mut PresentTargets<B>,
        cause: Degradation,
        attempt: u32,
    ) -> Result<(), BackendError> {
        match cause {
            Degradation::OutOfDate => debug!(
                "swapchain out of date, rebuilding ({attempt}/{})",
                self.max_attempts
            ),
            Degradation::SurfaceLost => warn!(
                "surface lost, recreating surface and swapchain ({attempt}/{})",
                self.max_attempts
            ),
        }
        targets.rebuild(cause == Degradation::SurfaceLost)?;
        self.rebuilds += 1;
        Ok(())
    }

    /// Rebuild asked for by the caller (resize, vsync toggle, new surface).
    /// A rebuild that itself degrades falls back to the bounded loop.
    pub fn rebuild_now<B: PresentBackend>(
        &mut self,
        targets: &mut PresentTargets<B>,
        new_surface: bool,
    ) -> PresentResult<()> {
        let cause = if new_surface {
            Degradation::SurfaceLost
        } else {
            Degradation::OutOfDate
        };
        match self.rebuild(targets, cause, 1) {
            Ok(()) => {
                self.state = SwapchainState::Healthy;
                Ok(())
            }
            Err(e) => match Degradation::from_status(e.status) {
                Some(d) => self.run(targets, |t| {
                    Ok(if t.is_live() {
                        Attempt::Complete(())
                    } else {
                        Attempt::Retry(d)
                    })
                }),
                None => {
                    error!("swapchain rebuild failed: {e}");
                    Err(PresentError::Rebuild(e))
                }
            },
        }
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn mark_failed(&mut self) {
        self.state = SwapchainState::Failed;
    }

    pub fn mark_destroyed(&mut self) {
        self.state = SwapchainState::Destroyed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PresentMode, SurfaceFormat, SwapSetRequest};
    use crate::sim::{Fault, FaultSite, SimBackend, SimConfig};
    use crate::RenderSize;
    use strobe_core::ManualClock;

    fn targets() -> PresentTargets<SimBackend> {
        let request = SwapSetRequest {
            format: SurfaceFormat::Bgra8Srgb,
            size: RenderSize {
                width: 64,
                height: 64,
            },
            buffer_count: 2,
            present_mode: PresentMode::Fifo,
        };
        let b = SimBackend::new(SimConfig::default(), ManualClock::new());
        PresentTargets::create(b, request, true).unwrap()
    }

    #[test]
    fn retries_until_the_job_completes() {
        let mut t = targets();
        let mut rc = RecoveryController::new(4);
        let mut runs = 0;
        let v = rc
            .run(&mut t, |_| {
                runs += 1;
                Ok(if runs < 3 {
                    Attempt::Retry(Degradation::OutOfDate)
                } else {
                    Attempt::Complete(runs)
                })
            })
            .unwrap();
        assert_eq!(v, 3);
        assert_eq!(rc.rebuilds(), 2);
        assert_eq!(rc.state(), SwapchainState::Healthy);
        assert_eq!(t.generation(), 3);
    }

    #[test]
    fn exhaustion_is_fatal() {
        let mut t = targets();
        let mut rc = RecoveryController::new(4);
        let mut runs = 0;
        let err = rc
            .run(&mut t, |_| {
                runs += 1;
                Ok(Attempt::<()>::Retry(Degradation::SurfaceLost))
            })
            .unwrap_err();
        assert!(matches!(
            err,
            PresentError::RecoveryExhausted {
                attempts: 4,
                last: Degradation::SurfaceLost
            }
        ));
        assert_eq!(runs, 5);
        assert_eq!(rc.rebuilds(), 4);
        assert_eq!(rc.state(), SwapchainState::SurfaceLost);
    }

    #[test]
    fn fatal_job_errors_pass_straight_through() {
        let mut t = targets();
        let mut rc = RecoveryController::new(4);
        let err = rc
            .run(&mut t, |_| {
                Err::<Attempt<()>, _>(PresentError::AcquireFailed(BackendStatus::DeviceLost))
            })
            .unwrap_err();
        assert!(matches!(err, PresentError::AcquireFailed(_)));
        assert_eq!(rc.rebuilds(), 0);
    }

    #[test]
    fn degraded_rebuild_counts_as_an_attempt() {
        let mut t = targets();
        t.backend_mut()
            .inject(FaultSite::CreateSet, Fault::Once(BackendStatus::SurfaceLost));
        let stats = t.backend().stats();
        let mut rc = RecoveryController::new(4);
        rc.rebuild_now(&mut t, false).unwrap();
        assert!(t.is_live());
        assert_eq!(rc.rebuilds(), 1);
        // The failed rebuild reported a lost surface, so the retry made a new one.
        assert_eq!(stats.surface_creations(), 2);
        assert_eq!(rc.state(), SwapchainState::Healthy);
    }
}
