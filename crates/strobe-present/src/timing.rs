// SPDX-License-Identifier: CEPL-1.0
//! Present identifiers and the timing records exchanged with the backend.

use std::time::Duration;

/// Identifier handed to the backend with every present. Strictly increasing
/// for the lifetime of a swapchain, rebuilds included.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PresentId(pub u64);

impl PresentId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// What the backend reports once a present has reached the display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PastPresentTiming {
    pub present_id: PresentId,
    /// Actual scan-out time on the host clock's timeline, in nanoseconds.
    pub actual_present_ns: u64,
}

/// Bookkeeping for one present request inside the predictive pacer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PresentTimingSample {
    pub present_id: PresentId,
    pub cpu_request: Duration,
    pub actual_present_ns: Option<u64>,
    /// `actual - cpu_request` in nanoseconds, set once the report arrives.
    pub offset_ns: Option<i64>,
}

impl PresentTimingSample {
    pub fn requested(present_id: PresentId, cpu_request: Duration) -> Self {
        Self {
            present_id,
            cpu_request,
            actual_present_ns: None,
            offset_ns: None,
        }
    }

    /// Fills in the report and returns the measured offset.
    pub fn complete(&mut self, actual_present_ns: u64) -> i64 {
        let request_ns = i128::try_from(self.cpu_request.as_nanos()).unwrap_or(i128::MAX);
        let delta = i128::from(actual_present_ns) - request_ns;
        let delta = delta.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        self.actual_present_ns = Some(actual_present_ns);
        self.offset_ns = Some(delta);
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_records_signed_offset() {
        let mut s = PresentTimingSample::requested(PresentId(7), Duration::from_millis(20));
        assert_eq!(s.complete(25_000_000), 5_000_000);
        assert_eq!(s.actual_present_ns, Some(25_000_000));

        let mut early = PresentTimingSample::requested(PresentId(8), Duration::from_millis(20));
        assert_eq!(early.complete(19_000_000), -1_000_000);
    }

    #[test]
    fn ids_order_by_issue() {
        let a = PresentId::default();
        assert!(a.next() > a);
        assert_eq!(a.next().next(), PresentId(2));
    }
}
