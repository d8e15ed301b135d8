// SPDX-License-Identifier: CEPL-1.0
//! Presentation core: swap surface ownership, acquisition, submission,
//! recovery from stale or lost surfaces, and frame pacing, over a
//! [`PresentBackend`] supplied by a graphics API crate.

pub mod acquire;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pacing;
pub mod recovery;
pub mod sim;
pub mod surface_set;
pub mod swapchain;
pub mod sync_pool;
pub mod targets;
pub mod timing;

pub use acquire::{AcquireOutcome, AcquisitionEngine, FrameLease};
pub use backend::{
    BackendStatus, CommandStream, ImageLayout, PresentBackend, PresentMode, QueueRole,
    SurfaceFormat,
};
pub use config::{PacingPreference, PresentConfig};
pub use error::{BackendError, PresentError, PresentResult};
pub use pacing::{FramePacer, PacingMode};
pub use recovery::{Attempt, Degradation, RecoveryController, SwapchainState};
pub use swapchain::Swapchain;
pub use timing::{PastPresentTiming, PresentId, PresentTimingSample};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}
