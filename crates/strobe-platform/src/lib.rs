// SPDX-License-Identifier: CEPL-1.0
//! Windowing for the demo app. Re-exports the `winit` the workspace builds
//! against so the app and any future platform code agree on one version.

pub use winit;

use winit::dpi::PhysicalSize;

/// A zero-area window (minimised, or mid-resize on some compositors) has
/// nothing to present to.
pub fn has_area(size: PhysicalSize<u32>) -> bool {
    size.width > 0 && size.height > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_windows_have_no_area() {
        assert!(!has_area(PhysicalSize::new(0, 600)));
        assert!(!has_area(PhysicalSize::new(800, 0)));
        assert!(has_area(PhysicalSize::new(1, 1)));
    }
}
