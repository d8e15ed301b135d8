// SPDX-License-Identifier: CEPL-1.0
//! Next-image acquisition and classification of the outcome.

use std::time::Duration;

use tracing::{debug, error};

use crate::backend::{BackendStatus, ImageHandle, PresentBackend, SemaphoreHandle, SurfaceFormat};
use crate::error::{PresentError, PresentResult};
use crate::targets::PresentTargets;
use crate::RenderSize;

/// An acquired image lent to the caller until the matching present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLease {
    pub image_index: u32,
    pub image: ImageHandle,
    /// Acquire slot whose semaphore signals image availability.
    pub slot: usize,
    pub acquire_semaphore: SemaphoreHandle,
    pub format: SurfaceFormat,
    pub extent: RenderSize,
    /// Generation of the set the image belongs to.
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(FrameLease),
    /// The set no longer matches the surface.
    Stale,
    /// The surface itself is gone.
    Lost,
}

#[derive(Debug)]
pub struct AcquisitionEngine {
    timeout: Option<Duration>,
    acquired: u64,
    suboptimal: u64,
}

impl AcquisitionEngine {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            acquired: 0,
            suboptimal: 0,
        }
    }

    pub fn acquire<B: PresentBackend>(
        &mut self,
        targets: &mut PresentTargets<B>,
    ) -> PresentResult<AcquireOutcome> {
        let (Some(set), Some(pool)) = (targets.set.as_ref(), targets.pool.as_mut()) else {
            // A previous rebuild did not finish; let recovery try again.
            return Ok(AcquireOutcome::Stale);
        };
        let backend = &mut targets.backend;
        let (slot_index, slot) = pool.next_slot();

        if let Some(fence) = slot.fence {
            if !backend.wait_fence(fence, self.timeout)? {
                error!("acquire slot {slot_index} still busy after {:?}", self.timeout);
                return Err(PresentError::SlotFenceTimeout {
                    slot: slot_index,
                    timeout: self.timeout.unwrap_or(Duration::MAX),
                });
            }
        }

        match backend.acquire_next(self.timeout, slot.semaphore) {
            Ok(acquired) => {
                let surface = set.surface(acquired.image_index).ok_or(
                    PresentError::InvalidImageIndex {
                        index: acquired.image_index,
                        len: set.len(),
                    },
                )?;
                if acquired.suboptimal {
                    self.suboptimal += 1;
                    debug!(
                        "acquire suboptimal (image {}, set #{})",
                        acquired.image_index,
                        set.generation()
                    );
                }
                if let Some(fence) = slot.fence {
                    backend.reset_fence(fence)?;
                }
                pool.advance();
                self.acquired += 1;
                Ok(AcquireOutcome::Acquired(FrameLease {
                    image_index: acquired.image_index,
                    image: surface.image,
                    slot: slot_index,
                    acquire_semaphore: slot.semaphore,
                    format: set.format(),
                    extent: set.extent(),
                    generation: set.generation(),
                }))
            }
            Err(BackendStatus::OutOfDate) => Ok(AcquireOutcome::Stale),
            Err(BackendStatus::SurfaceLost) => Ok(AcquireOutcome::Lost),
            Err(status) => {
                error!("acquire_next failed: {status:?}");
                Err(PresentError::AcquireFailed(status))
            }
        }
    }

    pub fn acquired(&self) -> u64 {
        self.acquired
    }

    pub fn suboptimal(&self) -> u64 {
        self.suboptimal
    }
}
