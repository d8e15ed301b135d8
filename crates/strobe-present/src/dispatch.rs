// SPDX-License-Identifier: CEPL-1.0
//! Graphics submission and presentation of an acquired image.

use tracing::error;

use crate::acquire::FrameLease;
use crate::backend::{
    BackendStatus, CommandStream, ImageBarrier, ImageLayout, PresentBackend, PresentRequest,
    PresentTimingRequest, QueueRole, QueueTransfer, Submission,
};
use crate::error::{PresentError, PresentResult};
use crate::recovery::{Attempt, Degradation};
use crate::targets::PresentTargets;
use crate::timing::PresentId;

#[derive(Debug)]
pub struct PresentationDispatcher {
    next_present_id: PresentId,
    presents_completed: u64,
}

impl Default for PresentationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PresentationDispatcher {
    pub fn new() -> Self {
        Self {
            next_present_id: PresentId(1),
            presents_completed: 0,
        }
    }

    fn transfer<B: PresentBackend>(backend: &B) -> Option<QueueTransfer> {
        let src = backend.queue_family(QueueRole::Graphics);
        let dst = backend.queue_family(QueueRole::Present);
        (src != dst).then_some(QueueTransfer {
            src_family: src,
            dst_family: dst,
        })
    }

    /// Undefined → colour attachment, at the head of the caller's stream.
    pub fn prepare_for_rendering<B: PresentBackend>(
        &self,
        backend: &mut B,
        commands: CommandStream,
        lease: &FrameLease,
    ) {
        backend.record_image_barrier(
            commands,
            &ImageBarrier {
                image: lease.image,
                old_layout: ImageLayout::Undefined,
                new_layout: ImageLayout::ColorAttachment,
                transfer: None,
            },
        );
    }

    /// Closes `commands` with the present transition and submits it on the
    /// graphics queue: waits the lease's acquire semaphore, signals the
    /// image's rendering-done semaphore.
    pub fn submit<B: PresentBackend>(
        &mut self,
        targets: &mut PresentTargets<B>,
        lease: &FrameLease,
        commands: CommandStream,
    ) -> PresentResult<()> {
        let (Some(set), Some(pool)) = (targets.set.as_ref(), targets.pool.as_ref()) else {
            panic!("submit without a live swap surface set");
        };
        assert_eq!(
            lease.generation,
            set.generation(),
            "lease belongs to a destroyed swap surface set"
        );
        let surface = *set.surface(lease.image_index).ok_or(PresentError::InvalidImageIndex {
            index: lease.image_index,
            len: set.len(),
        })?;
        let fence = pool.slot(lease.slot).and_then(|s| s.fence);
        let backend = &mut targets.backend;
        let transfer = Self::transfer(backend);

        backend.record_image_barrier(
            commands,
            &ImageBarrier {
                image: lease.image,
                old_layout: ImageLayout::ColorAttachment,
                new_layout: ImageLayout::PresentSrc,
                transfer,
            },
        );
        backend
            .submit(&Submission {
                queue: QueueRole::Graphics,
                commands,
                wait: Some(lease.acquire_semaphore),
                signal: Some(surface.rendering_done),
                fence,
            })
            .inspect_err(|e| error!("graphics submit failed: {e}"))?;

        if let (Some(transfer), Some(ownership_done)) = (transfer, surface.ownership_done) {
            let acquire = backend.begin_commands(QueueRole::Present, lease.slot)?;
            backend.record_image_barrier(
                acquire,
                &ImageBarrier {
                    image: lease.image,
                    old_layout: ImageLayout::ColorAttachment,
                    new_layout: ImageLayout::PresentSrc,
                    transfer: Some(transfer),
                },
            );
            backend
                .submit(&Submission {
                    queue: QueueRole::Present,
                    commands: acquire,
                    wait: Some(surface.rendering_done),
                    signal: Some(ownership_done),
                    fence: None,
                })
                .inspect_err(|e| error!("ownership acquire submit failed: {e}"))?;
        }
        Ok(())
    }

    /// Submits a stream that only carries the boundary transitions. Used when
    /// an image has to reach the present layout without caller work.
    pub fn submit_boundary_only<B: PresentBackend>(
        &mut self,
        targets: &mut PresentTargets<B>,
        lease: &FrameLease,
    ) -> PresentResult<()> {
        let commands = targets
            .backend
            .begin_commands(QueueRole::Graphics, lease.slot)?;
        self.prepare_for_rendering(&mut targets.backend, commands, lease);
        self.submit(targets, lease, commands)
    }

    /// Presents the leased image. Every call consumes a fresh present ID.
    pub fn present<B: PresentBackend>(
        &mut self,
        targets: &mut PresentTargets<B>,
        lease: &FrameLease,
        desired_present_ns: Option<u64>,
    ) -> PresentResult<Attempt<PresentId>> {
        let present_id = self.next_present_id;
        self.next_present_id = present_id.next();

        let Some(set) = targets.set.as_ref() else {
            return Ok(Attempt::Retry(Degradation::OutOfDate));
        };
        let wait = set
            .surface(lease.image_index)
            .ok_or(PresentError::InvalidImageIndex {
                index: lease.image_index,
                len: set.len(),
            })?
            .present_wait();
        let backend = &mut targets.backend;
        let timing = backend
            .supports_present_timing()
            .then_some(PresentTimingRequest {
                present_id,
                desired_present_ns,
            });

        match backend.present(&PresentRequest {
            image_index: lease.image_index,
            wait,
            timing,
        }) {
            BackendStatus::Success | BackendStatus::Suboptimal => {
                self.presents_completed += 1;
                Ok(Attempt::Complete(present_id))
            }
            BackendStatus::OutOfDate => Ok(Attempt::Retry(Degradation::OutOfDate)),
            BackendStatus::SurfaceLost => Ok(Attempt::Retry(Degradation::SurfaceLost)),
            status => {
                error!("present failed: {status:?}");
                Err(PresentError::PresentFailed(status))
            }
        }
    }

    /// ID the next present call will use.
    pub fn peek_present_id(&self) -> PresentId {
        self.next_present_id
    }

    pub fn presents_completed(&self) -> u64 {
        self.presents_completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::{AcquireOutcome, AcquisitionEngine};
    use crate::backend::{PresentMode, SurfaceFormat, SwapSetRequest};
    use crate::sim::{Fault, FaultSite, SimBackend, SimConfig};
    use crate::RenderSize;
    use strobe_core::ManualClock;

    fn targets(cfg: SimConfig) -> PresentTargets<SimBackend> {
        let request = SwapSetRequest {
            format: SurfaceFormat::Bgra8Srgb,
            size: RenderSize {
                width: 64,
                height: 64,
            },
            buffer_count: 3,
            present_mode: PresentMode::Fifo,
        };
        PresentTargets::create(SimBackend::new(cfg, ManualClock::new()), request, true).unwrap()
    }

    fn lease(t: &mut PresentTargets<SimBackend>) -> FrameLease {
        match AcquisitionEngine::new(None).acquire(t).unwrap() {
            AcquireOutcome::Acquired(l) => l,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn submit_and_present_pair_semaphores() {
        let mut t = targets(SimConfig::default());
        let mut d = PresentationDispatcher::new();
        let l = lease(&mut t);
        d.submit_boundary_only(&mut t, &l).unwrap();
        assert_eq!(d.present(&mut t, &l, None).unwrap(), Attempt::Complete(PresentId(1)));
        assert_eq!(d.presents_completed(), 1);
        assert!(t.backend().violations().is_empty(), "{:?}", t.backend().violations());
    }

    #[test]
    fn split_queue_families_transfer_ownership() {
        let mut t = targets(SimConfig {
            separate_present_queue: true,
            ..Default::default()
        });
        assert!(t.split_queues());
        let mut d = PresentationDispatcher::new();
        for _ in 0..4 {
            let l = lease(&mut t);
            d.submit_boundary_only(&mut t, &l).unwrap();
            assert!(matches!(d.present(&mut t, &l, None).unwrap(), Attempt::Complete(_)));
        }
        assert_eq!(t.backend().present_queue_submits(), 4);
        assert!(t.backend().violations().is_empty(), "{:?}", t.backend().violations());
    }

    #[test]
    fn failed_presents_still_consume_ids() {
        let mut t = targets(SimConfig::default());
        let mut d = PresentationDispatcher::new();
        let l = lease(&mut t);
        d.submit_boundary_only(&mut t, &l).unwrap();
        t.backend_mut()
            .inject(FaultSite::Present, Fault::Once(BackendStatus::OutOfDate));
        assert_eq!(
            d.present(&mut t, &l, None).unwrap(),
            Attempt::Retry(Degradation::OutOfDate)
        );
        assert_eq!(d.peek_present_id(), PresentId(2));
        assert_eq!(d.presents_completed(), 0);

        t.backend_mut()
            .inject(FaultSite::Present, Fault::Once(BackendStatus::DeviceLost));
        assert!(matches!(
            d.present(&mut t, &l, None),
            Err(PresentError::PresentFailed(BackendStatus::DeviceLost))
        ));
        assert_eq!(d.peek_present_id(), PresentId(3));
    }
}
