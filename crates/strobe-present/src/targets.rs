// SPDX-License-Identifier: CEPL-1.0
//! Everything a swapchain rebuilds: the backend-side surface, the swap
//! surface set and the acquire slot pool, plus the request they were
//! negotiated with.

use tracing::warn;

use crate::backend::{BackendStatus, PresentBackend, QueueRole, SurfaceHandle, SwapSetRequest};
use crate::error::BackendError;
use crate::surface_set::SwapSurfaceSet;
use crate::sync_pool::SyncPrimitivePool;

pub struct PresentTargets<B: PresentBackend> {
    pub(crate) backend: B,
    pub(crate) surface: Option<SurfaceHandle>,
    pub(crate) set: Option<SwapSurfaceSet>,
    pub(crate) pool: Option<SyncPrimitivePool>,
    pub(crate) request: SwapSetRequest,
    generation: u64,
    use_fences: bool,
    split_queues: bool,
}

impl<B: PresentBackend> PresentTargets<B> {
    pub fn create(
        mut backend: B,
        request: SwapSetRequest,
        use_fences: bool,
    ) -> Result<Self, BackendError> {
        let split_queues =
            backend.queue_family(QueueRole::Graphics) != backend.queue_family(QueueRole::Present);
        let surface = backend.create_surface()?;
        let mut targets = Self {
            backend,
            surface: Some(surface),
            set: None,
            pool: None,
            request,
            generation: 0,
            use_fences,
            split_queues,
        };
        targets.build()?;
        Ok(targets)
    }

    fn build(&mut self) -> Result<(), BackendError> {
        let surface = self.surface.ok_or(BackendError::new(
            "create_swap_surface_set",
            BackendStatus::SurfaceLost,
        ))?;
        self.generation += 1;
        let set = SwapSurfaceSet::create(
            &mut self.backend,
            surface,
            &self.request,
            self.generation,
            self.split_queues,
        )?;
        let pool = match SyncPrimitivePool::create(&mut self.backend, set.len(), self.use_fences) {
            Ok(p) => p,
            Err(e) => {
                set.destroy(&mut self.backend);
                return Err(e);
            }
        };
        self.set = Some(set);
        self.pool = Some(pool);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.destroy(&mut self.backend);
        }
        if let Some(set) = self.set.take() {
            set.destroy(&mut self.backend);
        }
    }

    /// Waits for the GPU, drops set and pool, optionally replaces the
    /// surface, then negotiates a new set with the stored request.
    pub fn rebuild(&mut self, new_surface: bool) -> Result<(), BackendError> {
        self.backend.wait_idle()?;
        self.teardown();
        if new_surface {
            if let Some(old) = self.surface.take() {
                self.backend.destroy_surface(old);
            }
            self.surface = Some(self.backend.create_surface()?);
        }
        self.build()
    }

    /// Idempotent.
    pub fn release(&mut self) {
        if self.surface.is_none() && self.set.is_none() && self.pool.is_none() {
            return;
        }
        if let Err(e) = self.backend.wait_idle() {
            warn!("wait_idle before teardown failed: {e}");
        }
        self.teardown();
        if let Some(s) = self.surface.take() {
            self.backend.destroy_surface(s);
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn set(&self) -> Option<&SwapSurfaceSet> {
        self.set.as_ref()
    }

    pub fn pool(&self) -> Option<&SyncPrimitivePool> {
        self.pool.as_ref()
    }

    pub fn request(&self) -> &SwapSetRequest {
        &self.request
    }

    pub fn is_live(&self) -> bool {
        self.set.is_some() && self.pool.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn split_queues(&self) -> bool {
        self.split_queues
    }
}

impl<B: PresentBackend> Drop for PresentTargets<B> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PresentMode, SurfaceFormat};
    use crate::sim::{SimBackend, SimConfig};
    use crate::RenderSize;
    use strobe_core::ManualClock;

    fn request() -> SwapSetRequest {
        SwapSetRequest {
            format: SurfaceFormat::Bgra8Srgb,
            size: RenderSize {
                width: 320,
                height: 200,
            },
            buffer_count: 3,
            present_mode: PresentMode::Fifo,
        }
    }

    #[test]
    fn rebuild_bumps_generation_and_idles_first() {
        let b = SimBackend::new(SimConfig::default(), ManualClock::new());
        let stats = b.stats();
        let mut t = PresentTargets::create(b, request(), true).unwrap();
        assert_eq!(t.generation(), 1);
        assert!(t.is_live());

        t.rebuild(false).unwrap();
        assert_eq!(t.generation(), 2);
        assert_eq!(stats.wait_idle_calls(), 1);
        assert_eq!(stats.surface_creations(), 1);

        t.rebuild(true).unwrap();
        assert_eq!(stats.surface_creations(), 2);
        assert_eq!(stats.set_creations(), 3);
    }

    #[test]
    fn release_is_idempotent_and_frees_everything() {
        let b = SimBackend::new(SimConfig::default(), ManualClock::new());
        let stats = b.stats();
        let mut t = PresentTargets::create(b, request(), true).unwrap();
        t.release();
        t.release();
        assert!(!t.is_live());
        assert_eq!(t.backend().live_semaphores(), 0);
        assert_eq!(t.backend().live_fences(), 0);
        assert_eq!(stats.wait_idle_calls(), 1);
    }
}
