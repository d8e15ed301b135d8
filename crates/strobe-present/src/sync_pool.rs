// SPDX-License-Identifier: CEPL-1.0
//! Ring of acquire semaphores (and optional host fences), one per in-flight
//! slot. The ring index is independent of the image index the backend hands
//! out and only moves when an acquire succeeds.

use crate::backend::{FenceHandle, PresentBackend, SemaphoreHandle};
use crate::error::BackendError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquireSlot {
    pub semaphore: SemaphoreHandle,
    /// Signalled when the graphics submission that used this slot retires.
    pub fence: Option<FenceHandle>,
}

#[derive(Debug)]
pub struct SyncPrimitivePool {
    slots: Vec<AcquireSlot>,
    next: usize,
}

impl SyncPrimitivePool {
    pub fn create<B: PresentBackend>(
        backend: &mut B,
        count: usize,
        with_fences: bool,
    ) -> Result<Self, BackendError> {
        let mut pool = Self {
            slots: Vec::with_capacity(count),
            next: 0,
        };
        for _ in 0..count.max(1) {
            match Self::create_slot(backend, with_fences) {
                Ok(slot) => pool.slots.push(slot),
                Err(e) => {
                    pool.destroy(backend);
                    return Err(e);
                }
            }
        }
        Ok(pool)
    }

    fn create_slot<B: PresentBackend>(
        backend: &mut B,
        with_fence: bool,
    ) -> Result<AcquireSlot, BackendError> {
        let semaphore = backend.create_semaphore()?;
        let fence = if with_fence {
            // Created signalled so the first wait on a fresh slot passes.
            match backend.create_fence(true) {
                Ok(f) => Some(f),
                Err(e) => {
                    backend.destroy_semaphore(semaphore);
                    return Err(e);
                }
            }
        } else {
            None
        };
        Ok(AcquireSlot { semaphore, fence })
    }

    /// Caller guarantees the GPU is idle.
    pub fn destroy<B: PresentBackend>(self, backend: &mut B) {
        for slot in self.slots {
            backend.destroy_semaphore(slot.semaphore);
            if let Some(f) = slot.fence {
                backend.destroy_fence(f);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot the next acquire will use. Does not move the ring.
    pub fn next_slot(&self) -> (usize, AcquireSlot) {
        (self.next, self.slots[self.next])
    }

    /// Commits the slot returned by [`Self::next_slot`].
    pub fn advance(&mut self) {
        self.next = (self.next + 1) % self.slots.len();
    }

    pub fn slot(&self, index: usize) -> Option<&AcquireSlot> {
        self.slots.get(index)
    }

    pub fn ring_index(&self) -> usize {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBackend, SimConfig};
    use strobe_core::ManualClock;

    #[test]
    fn ring_wraps_and_only_moves_on_advance() {
        let mut b = SimBackend::new(SimConfig::default(), ManualClock::new());
        let mut pool = SyncPrimitivePool::create(&mut b, 3, true).unwrap();
        assert_eq!(pool.len(), 3);

        let (i0, s0) = pool.next_slot();
        assert_eq!(pool.next_slot(), (i0, s0));
        for expected in [1, 2, 0, 1] {
            pool.advance();
            assert_eq!(pool.ring_index(), expected);
        }
        assert!(pool.slot(0).unwrap().fence.is_some());
        pool.destroy(&mut b);
        assert_eq!(b.live_semaphores(), 0);
        assert_eq!(b.live_fences(), 0);
    }

    #[test]
    fn fenceless_pool() {
        let mut b = SimBackend::new(SimConfig::default(), ManualClock::new());
        let pool = SyncPrimitivePool::create(&mut b, 2, false).unwrap();
        assert!(pool.slot(1).unwrap().fence.is_none());
        assert!(pool.slot(2).is_none());
        pool.destroy(&mut b);
    }
}
