// SPDX-License-Identifier: CEPL-1.0
//! The cyclic set of presentable images, built and torn down as a unit.

use tracing::{info, warn};

use crate::backend::{
    ImageHandle, PresentBackend, PresentMode, SemaphoreHandle, SurfaceFormat, SurfaceHandle,
    SwapSetRequest,
};
use crate::error::BackendError;
use crate::RenderSize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapSurface {
    pub image: ImageHandle,
    /// Signalled by the graphics submission that finished the frame.
    pub rendering_done: SemaphoreHandle,
    /// Signalled by the present-queue ownership acquire. Only present when
    /// graphics and present live on different queue families.
    pub ownership_done: Option<SemaphoreHandle>,
}

impl SwapSurface {
    /// Semaphore the present has to wait on.
    pub fn present_wait(&self) -> SemaphoreHandle {
        self.ownership_done.unwrap_or(self.rendering_done)
    }
}

#[derive(Debug)]
pub struct SwapSurfaceSet {
    surfaces: Vec<SwapSurface>,
    format: SurfaceFormat,
    extent: RenderSize,
    present_mode: PresentMode,
    generation: u64,
}

impl SwapSurfaceSet {
    pub fn create<B: PresentBackend>(
        backend: &mut B,
        surface: SurfaceHandle,
        request: &SwapSetRequest,
        generation: u64,
        split_queues: bool,
    ) -> Result<Self, BackendError> {
        let created = backend.create_swap_surface_set(surface, request)?;
        if created.images.len() != created.buffer_count as usize {
            warn!(
                "backend reported {} buffers but returned {} images",
                created.buffer_count,
                created.images.len()
            );
        }

        let mut set = Self {
            surfaces: Vec::with_capacity(created.images.len()),
            format: created.format,
            extent: created.extent,
            present_mode: request.present_mode,
            generation,
        };
        for &image in &created.images {
            match Self::surface_semaphores(backend, image, split_queues) {
                Ok(s) => set.surfaces.push(s),
                Err(e) => {
                    set.destroy(backend);
                    return Err(e);
                }
            }
        }

        info!(
            "swap surface set #{}: {} images ({} requested), {:?} {}x{}, {:?}",
            generation,
            set.surfaces.len(),
            request.buffer_count,
            set.format,
            set.extent.width,
            set.extent.height,
            set.present_mode
        );
        if set.format != request.format {
            info!("requested {:?}, backend chose {:?}", request.format, set.format);
        }
        Ok(set)
    }

    fn surface_semaphores<B: PresentBackend>(
        backend: &mut B,
        image: ImageHandle,
        split_queues: bool,
    ) -> Result<SwapSurface, BackendError> {
        let rendering_done = backend.create_semaphore()?;
        let ownership_done = if split_queues {
            match backend.create_semaphore() {
                Ok(s) => Some(s),
                Err(e) => {
                    backend.destroy_semaphore(rendering_done);
                    return Err(e);
                }
            }
        } else {
            None
        };
        Ok(SwapSurface {
            image,
            rendering_done,
            ownership_done,
        })
    }

    /// Caller guarantees the GPU is idle.
    pub fn destroy<B: PresentBackend>(self, backend: &mut B) {
        for s in self.surfaces {
            backend.destroy_semaphore(s.rendering_done);
            if let Some(o) = s.ownership_done {
                backend.destroy_semaphore(o);
            }
        }
        backend.destroy_swap_surface_set();
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn surface(&self, index: u32) -> Option<&SwapSurface> {
        self.surfaces.get(index as usize)
    }

    pub fn surfaces(&self) -> &[SwapSurface] {
        &self.surfaces
    }

    pub fn format(&self) -> SurfaceFormat {
        self.format
    }

    pub fn extent(&self) -> RenderSize {
        self.extent
    }

    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBackend, SimConfig};
    use strobe_core::ManualClock;

    fn request(count: u32) -> SwapSetRequest {
        SwapSetRequest {
            format: SurfaceFormat::Bgra8Srgb,
            size: RenderSize {
                width: 640,
                height: 480,
            },
            buffer_count: count,
            present_mode: PresentMode::Fifo,
        }
    }

    #[test]
    fn count_is_clamped_by_backend() {
        let cfg = SimConfig {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        let mut b = SimBackend::new(cfg, ManualClock::new());
        let surface = b.create_surface().unwrap();

        let set = SwapSurfaceSet::create(&mut b, surface, &request(8), 1, false).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.generation(), 1);
        assert_eq!(set.extent().width, 640);
        set.destroy(&mut b);

        let set = SwapSurfaceSet::create(&mut b, surface, &request(1), 2, false).unwrap();
        assert_eq!(set.len(), 2);
        set.destroy(&mut b);
        assert_eq!(b.live_semaphores(), 0);
    }

    #[test]
    fn split_queues_get_ownership_semaphores() {
        let mut b = SimBackend::new(SimConfig::default(), ManualClock::new());
        let surface = b.create_surface().unwrap();
        let set = SwapSurfaceSet::create(&mut b, surface, &request(3), 1, true).unwrap();
        for s in set.surfaces() {
            let o = s.ownership_done.unwrap();
            assert_ne!(o, s.rendering_done);
            assert_eq!(s.present_wait(), o);
        }
        set.destroy(&mut b);
    }
}
