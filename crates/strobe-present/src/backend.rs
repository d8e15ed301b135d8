// SPDX-License-Identifier: CEPL-1.0
//! The contract between the presentation core and a graphics API.
//!
//! The core never touches API objects directly: everything it owns is an
//! opaque handle minted by the backend. Transient presentation failures are
//! reported as [`BackendStatus`] values, everything else as [`BackendError`].

use std::time::Duration;

use serde::Deserialize;

use crate::error::BackendError;
use crate::timing::{PastPresentTiming, PresentId};
use crate::RenderSize;

macro_rules! handle {
    ($($(#[$m:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$m])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
            pub struct $name(pub u64);
        )*
    };
}

handle!(
    /// Window-system surface the swap surfaces are presented to.
    SurfaceHandle,
    /// GPU-to-GPU signal.
    SemaphoreHandle,
    /// GPU-to-host signal.
    FenceHandle,
    /// One presentable image.
    ImageHandle,
    /// A command stream in the recording state.
    CommandStream,
);

/// Result codes shared by acquire and present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendStatus {
    Success,
    Suboptimal,
    OutOfDate,
    SurfaceLost,
    Timeout,
    DeviceLost,
    Other(i32),
}

impl BackendStatus {
    /// `Success` and `Suboptimal` both mean the image was accepted.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::Suboptimal)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceFormat {
    Bgra8Unorm,
    #[default]
    Bgra8Srgb,
    Rgba8Unorm,
    Rgba8Srgb,
    Rgb10a2Unorm,
    Rgba16Float,
}

/// Immediate for sync interval 0, FIFO otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    Fifo,
}

impl PresentMode {
    pub fn for_sync_interval(sync_interval: u32) -> Self {
        if sync_interval == 0 {
            Self::Immediate
        } else {
            Self::Fifo
        }
    }
}

/// Negotiation request. Replayed unchanged on every rebuild unless the
/// caller resizes or toggles vsync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapSetRequest {
    pub format: SurfaceFormat,
    pub size: RenderSize,
    pub buffer_count: u32,
    pub present_mode: PresentMode,
}

/// What the backend actually built. `buffer_count` is clamped to the
/// surface's limits and `format` may differ from the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapSetCreated {
    pub images: Vec<ImageHandle>,
    pub buffer_count: u32,
    pub format: SurfaceFormat,
    pub extent: RenderSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Present,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    ColorAttachment,
    ShaderRead,
    PresentSrc,
}

/// Queue family ownership transfer carried by a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueTransfer {
    pub src_family: u32,
    pub dst_family: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub transfer: Option<QueueTransfer>,
}

/// One queue submission. Ends recording of `commands`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submission {
    pub queue: QueueRole,
    pub commands: CommandStream,
    pub wait: Option<SemaphoreHandle>,
    pub signal: Option<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentTimingRequest {
    pub present_id: PresentId,
    /// Earliest scan-out time on the host clock's timeline. `None` asks the
    /// display for "as soon as possible" while still tagging the present.
    pub desired_present_ns: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentRequest {
    pub image_index: u32,
    pub wait: SemaphoreHandle,
    pub timing: Option<PresentTimingRequest>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acquired {
    pub image_index: u32,
    pub suboptimal: bool,
}

/// Graphics API seam. One backend instance serves one swapchain.
///
/// A backend holds at most one live swap surface set at a time; creating a
/// new one may reuse the previous set internally (the old set is still
/// destroyed through [`PresentBackend::destroy_swap_surface_set`]).
pub trait PresentBackend {
    fn create_surface(&mut self) -> Result<SurfaceHandle, BackendError>;
    fn destroy_surface(&mut self, surface: SurfaceHandle);

    fn create_swap_surface_set(
        &mut self,
        surface: SurfaceHandle,
        request: &SwapSetRequest,
    ) -> Result<SwapSetCreated, BackendError>;
    fn destroy_swap_surface_set(&mut self);

    fn create_semaphore(&mut self) -> Result<SemaphoreHandle, BackendError>;
    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);

    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle, BackendError>;
    /// Returns `Ok(false)` when `timeout` elapsed first. `None` waits forever.
    fn wait_fence(
        &mut self,
        fence: FenceHandle,
        timeout: Option<Duration>,
    ) -> Result<bool, BackendError>;
    fn reset_fence(&mut self, fence: FenceHandle) -> Result<(), BackendError>;
    fn destroy_fence(&mut self, fence: FenceHandle);

    /// Requests the next writable image; `signal` fires once it is writable.
    fn acquire_next(
        &mut self,
        timeout: Option<Duration>,
        signal: SemaphoreHandle,
    ) -> Result<Acquired, BackendStatus>;

    /// Opens the command stream belonging to `slot` on `queue`.
    fn begin_commands(&mut self, queue: QueueRole, slot: usize)
        -> Result<CommandStream, BackendError>;
    fn record_image_barrier(&mut self, commands: CommandStream, barrier: &ImageBarrier);
    fn submit(&mut self, submission: &Submission) -> Result<(), BackendError>;

    fn present(&mut self, request: &PresentRequest) -> BackendStatus;

    fn queue_family(&self, role: QueueRole) -> u32;

    fn supports_present_timing(&self) -> bool;
    /// Nominal refresh period of the display behind the live set.
    fn refresh_duration(&mut self) -> Option<Duration>;
    /// Drains every timing report that became available since the last call.
    fn query_past_presentation_timings(&mut self) -> Vec<PastPresentTiming>;

    fn wait_idle(&mut self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suboptimal_counts_as_ok() {
        assert!(BackendStatus::Success.is_ok());
        assert!(BackendStatus::Suboptimal.is_ok());
        assert!(!BackendStatus::OutOfDate.is_ok());
        assert!(!BackendStatus::Other(-3).is_ok());
    }

    #[test]
    fn present_mode_follows_sync_interval() {
        assert_eq!(PresentMode::for_sync_interval(0), PresentMode::Immediate);
        assert_eq!(PresentMode::for_sync_interval(1), PresentMode::Fifo);
        assert_eq!(PresentMode::for_sync_interval(3), PresentMode::Fifo);
    }
}
