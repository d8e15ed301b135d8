// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendStatus;
use crate::recovery::Degradation;

/// A backend call that failed, with the status it failed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op} failed: {status:?}")]
pub struct BackendError {
    pub op: &'static str,
    pub status: BackendStatus,
}

impl BackendError {
    pub fn new(op: &'static str, status: BackendStatus) -> Self {
        Self { op, status }
    }
}

/// Presentation failures the swapchain cannot recover from.
#[derive(Debug, Error)]
pub enum PresentError {
    #[error("initial swapchain creation failed")]
    InitialCreation(#[source] BackendError),

    #[error("swapchain rebuild failed")]
    Rebuild(#[source] BackendError),

    #[error("acquire failed with {0:?}")]
    AcquireFailed(BackendStatus),

    #[error("present failed with {0:?}")]
    PresentFailed(BackendStatus),

    #[error("fence of acquire slot {slot} not signalled within {timeout:?}")]
    SlotFenceTimeout { slot: usize, timeout: Duration },

    #[error("backend returned image index {index} for a set of {len}")]
    InvalidImageIndex { index: u32, len: usize },

    #[error("swapchain still {last:?} after {attempts} rebuilds")]
    RecoveryExhausted { attempts: u32, last: Degradation },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type PresentResult<T> = Result<T, PresentError>;
