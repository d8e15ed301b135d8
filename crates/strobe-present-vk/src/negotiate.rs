// SPDX-License-Identifier: CEPL-1.0
//! Surface negotiation: turning a [`SwapSetRequest`] into concrete swapchain
//! parameters against what the surface reports.

use ash::vk;
use strobe_present::backend::{PresentMode, SurfaceFormat};
use strobe_present::RenderSize;

pub(crate) fn vk_format(f: SurfaceFormat) -> vk::Format {
    match f {
        SurfaceFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        SurfaceFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        SurfaceFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        SurfaceFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        SurfaceFormat::Rgb10a2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        SurfaceFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
    }
}

pub(crate) fn surface_format(f: vk::Format) -> Option<SurfaceFormat> {
    Some(match f {
        vk::Format::B8G8R8A8_UNORM => SurfaceFormat::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => SurfaceFormat::Bgra8Srgb,
        vk::Format::R8G8B8A8_UNORM => SurfaceFormat::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => SurfaceFormat::Rgba8Srgb,
        vk::Format::A2B10G10R10_UNORM_PACK32 => SurfaceFormat::Rgb10a2Unorm,
        vk::Format::R16G16B16A16_SFLOAT => SurfaceFormat::Rgba16Float,
        _ => return None,
    })
}

/// Exact match on the requested format first, then the usual SDR fallbacks.
/// Only formats the core can name are ever picked.
pub(crate) fn pick_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    want: SurfaceFormat,
) -> Option<(vk::SurfaceFormatKHR, SurfaceFormat)> {
    let srgb_nonlinear = |f: &&vk::SurfaceFormatKHR| {
        f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    };
    let find = |fmt: vk::Format| {
        formats
            .iter()
            .filter(srgb_nonlinear)
            .copied()
            .find(|f| f.format == fmt)
    };

    // A single UNDEFINED entry means the surface takes anything.
    if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
        let f = vk::SurfaceFormatKHR {
            format: vk_format(want),
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        return Some((f, want));
    }

    [
        vk_format(want),
        vk::Format::B8G8R8A8_SRGB,
        vk::Format::R8G8B8A8_SRGB,
        vk::Format::B8G8R8A8_UNORM,
        vk::Format::R8G8B8A8_UNORM,
    ]
    .into_iter()
    .find_map(find)
    .or_else(|| {
        formats
            .iter()
            .filter(srgb_nonlinear)
            .copied()
            .find(|f| surface_format(f.format).is_some())
    })
    .and_then(|f| surface_format(f.format).map(|sf| (f, sf)))
}

/// FIFO is always available, so it terminates every preference list.
pub(crate) fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    mode: PresentMode,
) -> vk::PresentModeKHR {
    let prefs: &[vk::PresentModeKHR] = match mode {
        PresentMode::Immediate => &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ],
        PresentMode::Fifo => &[vk::PresentModeKHR::FIFO],
    };
    prefs
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub(crate) fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: want
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: want
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// `max_image_count == 0` means no upper bound.
pub(crate) fn image_count(caps: &vk::SurfaceCapabilitiesKHR, desired: u32) -> u32 {
    let n = desired.max(caps.min_image_count);
    if caps.max_image_count == 0 {
        n
    } else {
        n.min(caps.max_image_count)
    }
}

pub(crate) fn fmt_name(f: vk::Format) -> &'static str {
    match f {
        vk::Format::B8G8R8A8_SRGB => "B8G8R8A8_SRGB",
        vk::Format::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
        vk::Format::R8G8B8A8_SRGB => "R8G8B8A8_SRGB",
        vk::Format::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
        vk::Format::A2B10G10R10_UNORM_PACK32 => "A2B10G10R10_UNORM_PACK32",
        vk::Format::R16G16B16A16_SFLOAT => "R16G16B16A16_SFLOAT",
        _ => "other",
    }
}

pub(crate) fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn requested_format_wins_when_offered() {
        let formats = [sf(vk::Format::B8G8R8A8_SRGB), sf(vk::Format::B8G8R8A8_UNORM)];
        let (f, named) = pick_surface_format(&formats, SurfaceFormat::Bgra8Unorm).unwrap();
        assert_eq!(f.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(named, SurfaceFormat::Bgra8Unorm);
    }

    #[test]
    fn falls_back_to_srgb_then_anything_nameable() {
        let formats = [sf(vk::Format::R8G8B8A8_SRGB)];
        let (_, named) = pick_surface_format(&formats, SurfaceFormat::Rgba16Float).unwrap();
        assert_eq!(named, SurfaceFormat::Rgba8Srgb);

        let formats = [sf(vk::Format::R5G6B5_UNORM_PACK16)];
        assert!(pick_surface_format(&formats, SurfaceFormat::Bgra8Srgb).is_none());
    }

    #[test]
    fn undefined_surface_format_takes_the_request() {
        let formats = [sf(vk::Format::UNDEFINED)];
        let (f, named) = pick_surface_format(&formats, SurfaceFormat::Rgba8Unorm).unwrap();
        assert_eq!(f.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(named, SurfaceFormat::Rgba8Unorm);
    }

    #[test]
    fn immediate_degrades_to_mailbox_then_fifo() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&all, PresentMode::Immediate),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&all[..2], PresentMode::Immediate),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&all[..1], PresentMode::Immediate),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&all, PresentMode::Fifo),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_is_clamped() {
        assert_eq!(image_count(&caps(2, 3, (1, 1)), 4), 3);
        assert_eq!(image_count(&caps(3, 8, (1, 1)), 2), 3);
        assert_eq!(image_count(&caps(2, 0, (1, 1)), 6), 6);
    }

    #[test]
    fn extent_follows_surface_unless_free() {
        let want = RenderSize {
            width: 800,
            height: 600,
        };
        let fixed = extent_from_caps(&caps(2, 3, (1024, 768)), want);
        assert_eq!((fixed.width, fixed.height), (1024, 768));

        let free = extent_from_caps(&caps(2, 3, (u32::MAX, u32::MAX)), want);
        assert_eq!((free.width, free.height), (800, 600));
    }
}
