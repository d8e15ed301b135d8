// SPDX-License-Identifier: CEPL-1.0
//! Vulkan implementation of [`PresentBackend`] on top of `ash`.
//!
//! Display timing (`VK_GOOGLE_display_timing`) is enabled when the device
//! exposes it. Its timestamps live on `CLOCK_MONOTONIC`, so pair this
//! backend with `strobe_core::MonotonicClock` for predictive pacing.

#![deny(unsafe_op_in_unsafe_fn)]

mod clear;
mod init;
mod negotiate;

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ash::ext::debug_utils;
use ash::google::display_timing;
use ash::khr::{surface, swapchain};
use ash::vk::{self, Handle};
use ash::{Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use strobe_present::backend::{
    Acquired, BackendStatus, CommandStream, FenceHandle, ImageBarrier, ImageHandle, ImageLayout,
    PresentBackend, PresentRequest, QueueRole, SemaphoreHandle, Submission, SurfaceHandle,
    SwapSetCreated, SwapSetRequest,
};
use strobe_present::{BackendError, PastPresentTiming, RenderSize};
use tracing::{debug, info, warn};

use crate::clear::ClearPass;
use crate::init::QueueFamilies;
use crate::negotiate::{
    choose_present_mode, extent_from_caps, fmt_name, image_count, pick_surface_format, pm_name,
};

pub use crate::init::VALIDATION_ENV;

/// Anything a surface can be created from. Held for the backend's lifetime
/// so surfaces can be recreated after loss.
pub trait WindowTarget: HasWindowHandle + HasDisplayHandle + Send + Sync {}
impl<T: HasWindowHandle + HasDisplayHandle + Send + Sync + ?Sized> WindowTarget for T {}

pub(crate) fn status_of(r: vk::Result) -> BackendStatus {
    match r {
        vk::Result::SUCCESS => BackendStatus::Success,
        vk::Result::SUBOPTIMAL_KHR => BackendStatus::Suboptimal,
        vk::Result::ERROR_OUT_OF_DATE_KHR => BackendStatus::OutOfDate,
        vk::Result::ERROR_SURFACE_LOST_KHR => BackendStatus::SurfaceLost,
        vk::Result::TIMEOUT | vk::Result::NOT_READY => BackendStatus::Timeout,
        vk::Result::ERROR_DEVICE_LOST => BackendStatus::DeviceLost,
        other => BackendStatus::Other(other.as_raw()),
    }
}

fn fail(op: &'static str) -> impl Fn(vk::Result) -> BackendError {
    move |r| BackendError::new(op, status_of(r))
}

/// Display timing reports carry 32-bit present IDs. Recovers the full ID
/// relative to the most recently issued one.
pub(crate) fn widen_present_id(last_issued: u64, id: u32) -> u64 {
    let candidate = (last_issued & !0xffff_ffff) | u64::from(id);
    if candidate > last_issued && candidate >= 1 << 32 {
        candidate - (1 << 32)
    } else {
        candidate
    }
}

fn vk_layout(l: ImageLayout) -> vk::ImageLayout {
    match l {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

fn access_and_stage(l: ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match l {
        // Matches the wait stage of the acquire semaphore.
        ImageLayout::Undefined => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::ColorAttachment => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::ShaderRead => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        ImageLayout::PresentSrc => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
    }
}

#[derive(Clone, Copy, Debug)]
struct StreamInfo {
    role: QueueRole,
    slot: usize,
}

/// Per-queue command buffers, one per acquire slot, allocated on demand.
struct QueueStreams {
    queue: vk::Queue,
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

pub struct VkBackend {
    window: Arc<dyn WindowTarget>,
    entry: Entry,
    instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: surface::Instance,
    /// Surface made for device selection, handed out by the first
    /// `create_surface`.
    spare_surface: Option<vk::SurfaceKHR>,

    phys: vk::PhysicalDevice,
    families: QueueFamilies,
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    timing_loader: Option<display_timing::Device>,

    swapchain: vk::SwapchainKHR,
    /// Destroyed set kept alive to seed the next creation as `old_swapchain`.
    retired: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    extent: vk::Extent2D,
    clear: Option<ClearPass>,

    graphics: QueueStreams,
    present: QueueStreams,
    /// Guards reuse of present-queue command buffers; the core's slot fences
    /// only cover the graphics submission.
    present_fences: Vec<vk::Fence>,
    streams: HashMap<u64, StreamInfo>,

    last_present_id: u64,
}

impl VkBackend {
    pub fn new<W: WindowTarget + 'static>(window: Arc<W>) -> Result<Self> {
        let window: Arc<dyn WindowTarget> = window;
        unsafe { Self::build(window) }
    }

    // STRICT ORDER:
    // 1) Instance (platform WSI + optional debug ext)
    // 2) Surface from this instance
    // 3) Physical device/queues checked against that surface
    // 4) Device with the extensions the chosen device supports
    unsafe fn build(window: Arc<dyn WindowTarget>) -> Result<Self> {
        let dh = window
            .display_handle()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .as_raw();

        let entry = Entry::linked();
        let validation = init::validation_requested();
        let instance = unsafe { init::create_instance(&entry, dh, validation) }
            .context("create_instance")?;
        let debug = if validation {
            Some(unsafe { init::create_debug_messenger(&entry, &instance) }?)
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = unsafe { ash_window::create_surface(&entry, &instance, dh, wh, None) }
            .context("ash_window::create_surface")?;

        let (phys, families) =
            unsafe { init::pick_device_and_queues(&instance, &surface_loader, surface) }?;
        let bundle = unsafe { init::create_device(&instance, phys, families) }?;
        let device = bundle.device;

        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let timing_loader = bundle
            .display_timing
            .then(|| display_timing::Device::new(&instance, &device));

        let graphics_pool = unsafe { init::create_command_pool(&device, families.graphics) }?;
        let present_pool = unsafe { init::create_command_pool(&device, families.present) }?;

        Ok(Self {
            window,
            entry,
            instance,
            debug,
            surface_loader,
            spare_surface: Some(surface),
            phys,
            families,
            device,
            swapchain_loader,
            timing_loader,
            swapchain: vk::SwapchainKHR::null(),
            retired: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            extent: vk::Extent2D::default(),
            clear: None,
            graphics: QueueStreams {
                queue: bundle.graphics_queue,
                pool: graphics_pool,
                buffers: Vec::new(),
            },
            present: QueueStreams {
                queue: bundle.present_queue,
                pool: present_pool,
                buffers: Vec::new(),
            },
            present_fences: Vec::new(),
            streams: HashMap::new(),
            last_present_id: 0,
        })
    }

    /// Clears image `image_index` inside an open graphics stream. The image
    /// must have been prepared for rendering.
    pub fn record_clear(&mut self, commands: CommandStream, image_index: u32, rgba: [f32; 4]) {
        let cmd = vk::CommandBuffer::from_raw(commands.0);
        if let Some(clear) = &self.clear {
            unsafe { clear.record(&self.device, cmd, image_index as usize, rgba) };
        }
    }

    fn streams_mut(&mut self, role: QueueRole) -> &mut QueueStreams {
        match role {
            QueueRole::Graphics => &mut self.graphics,
            QueueRole::Present => &mut self.present,
        }
    }

    unsafe fn stream_for_slot(
        &mut self,
        role: QueueRole,
        slot: usize,
    ) -> Result<vk::CommandBuffer, vk::Result> {
        let device = self.device.clone();
        let streams = self.streams_mut(role);
        while streams.buffers.len() <= slot {
            let alloc = vk::CommandBufferAllocateInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
                command_pool: streams.pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            };
            let bufs = unsafe { device.allocate_command_buffers(&alloc) }?;
            streams.buffers.extend(bufs);
        }
        let cmd = streams.buffers[slot];

        if role == QueueRole::Present {
            while self.present_fences.len() <= slot {
                let ci = vk::FenceCreateInfo {
                    s_type: vk::StructureType::FENCE_CREATE_INFO,
                    flags: vk::FenceCreateFlags::SIGNALED,
                    ..Default::default()
                };
                self.present_fences
                    .push(unsafe { device.create_fence(&ci, None) }?);
            }
            let fence = self.present_fences[slot];
            unsafe {
                device.wait_for_fences(&[fence], true, u64::MAX)?;
                device.reset_fences(&[fence])?;
            }
        }
        Ok(cmd)
    }

    unsafe fn destroy_views(&mut self) {
        if let Some(clear) = self.clear.as_mut() {
            unsafe { clear.release_framebuffers(&self.device) };
        }
        for view in self.image_views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        self.images.clear();
    }

    unsafe fn destroy_retired(&mut self) {
        if self.retired != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(self.retired, None) };
            self.retired = vk::SwapchainKHR::null();
        }
    }

    unsafe fn create_views(&mut self, format: vk::Format) -> Result<(), vk::Result> {
        for &img in &self.images {
            let iv_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image: img,
                view_type: vk::ImageViewType::TYPE_2D,
                format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            self.image_views
                .push(unsafe { self.device.create_image_view(&iv_info, None) }?);
        }

        if self.clear.as_ref().is_some_and(|c| c.format() != format) {
            if let Some(old) = self.clear.take() {
                unsafe { old.destroy(&self.device) };
            }
        }
        if self.clear.is_none() {
            self.clear = Some(unsafe { ClearPass::new(&self.device, format) }?);
        }
        if let Some(clear) = self.clear.as_mut() {
            unsafe { clear.bind_views(&self.device, &self.image_views, self.extent) }?;
        }
        Ok(())
    }
}

impl PresentBackend for VkBackend {
    fn create_surface(&mut self) -> Result<SurfaceHandle, BackendError> {
        if let Some(s) = self.spare_surface.take() {
            return Ok(SurfaceHandle(s.as_raw()));
        }
        let not_ready = BackendError::new("create_surface", BackendStatus::SurfaceLost);
        let dh = self.window.display_handle().map_err(|_| not_ready)?.as_raw();
        let wh = self.window.window_handle().map_err(|_| not_ready)?.as_raw();
        let surface =
            unsafe { ash_window::create_surface(&self.entry, &self.instance, dh, wh, None) }
                .map_err(fail("create_surface"))?;

        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.phys,
                self.families.present,
                surface,
            )
        }
        .unwrap_or(false);
        if !supported {
            unsafe { self.surface_loader.destroy_surface(surface, None) };
            return Err(BackendError::new(
                "create_surface",
                status_of(vk::Result::ERROR_INCOMPATIBLE_DISPLAY_KHR),
            ));
        }
        Ok(SurfaceHandle(surface.as_raw()))
    }

    fn destroy_surface(&mut self, handle: SurfaceHandle) {
        // Swapchains must go before the surface they were made for.
        unsafe {
            self.destroy_retired();
            self.surface_loader
                .destroy_surface(vk::SurfaceKHR::from_raw(handle.0), None);
        }
    }

    fn create_swap_surface_set(
        &mut self,
        handle: SurfaceHandle,
        request: &SwapSetRequest,
    ) -> Result<SwapSetCreated, BackendError> {
        let surface = vk::SurfaceKHR::from_raw(handle.0);
        let surf_i = &self.surface_loader;
        let (caps, formats, modes) = unsafe {
            (
                surf_i
                    .get_physical_device_surface_capabilities(self.phys, surface)
                    .map_err(fail("get_surface_capabilities"))?,
                surf_i
                    .get_physical_device_surface_formats(self.phys, surface)
                    .map_err(fail("get_surface_formats"))?,
                surf_i
                    .get_physical_device_surface_present_modes(self.phys, surface)
                    .map_err(fail("get_surface_present_modes"))?,
            )
        };

        let (surf_format, format) = pick_surface_format(&formats, request.format).ok_or(
            BackendError::new(
                "pick_surface_format",
                status_of(vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
            ),
        )?;
        let present_mode = choose_present_mode(&modes, request.present_mode);
        let extent = extent_from_caps(&caps, request.size);
        if extent.width == 0 || extent.height == 0 {
            // Minimised; nothing can be built until the window has area again.
            return Err(BackendError::new("create_swapchain", BackendStatus::OutOfDate));
        }
        let min_count = image_count(&caps, request.buffer_count);

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface,
            min_image_count: min_count,
            image_format: surf_format.format,
            image_color_space: surf_format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            // Split queues hand images over with explicit ownership transfers.
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: self.retired,
            ..Default::default()
        };

        let created = unsafe { self.swapchain_loader.create_swapchain(&swap_info, None) };
        // The old swapchain is retired whether or not creation succeeded.
        unsafe { self.destroy_retired() };
        self.swapchain = created.map_err(fail("create_swapchain"))?;
        self.extent = extent;

        self.images = unsafe { self.swapchain_loader.get_swapchain_images(self.swapchain) }
            .map_err(fail("get_swapchain_images"))?;
        if let Err(e) = unsafe { self.create_views(surf_format.format) } {
            unsafe {
                self.destroy_views();
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.swapchain = vk::SwapchainKHR::null();
            return Err(fail("create_image_views")(e));
        }

        info!(
            "swapchain: {} / {}, {}x{}, images(min={} requested={} got={})",
            fmt_name(surf_format.format),
            pm_name(present_mode),
            extent.width,
            extent.height,
            caps.min_image_count,
            request.buffer_count,
            self.images.len()
        );

        Ok(SwapSetCreated {
            images: self
                .images
                .iter()
                .map(|i| ImageHandle(i.as_raw()))
                .collect(),
            buffer_count: self.images.len() as u32,
            format,
            extent: RenderSize {
                width: extent.width,
                height: extent.height,
            },
        })
    }

    fn destroy_swap_surface_set(&mut self) {
        unsafe {
            self.destroy_views();
            self.destroy_retired();
        }
        self.retired = std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null());
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreHandle, BackendError> {
        let ci = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        let sem = unsafe { self.device.create_semaphore(&ci, None) }
            .map_err(fail("create_semaphore"))?;
        Ok(SemaphoreHandle(sem.as_raw()))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        unsafe {
            self.device
                .destroy_semaphore(vk::Semaphore::from_raw(semaphore.0), None)
        };
    }

    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle, BackendError> {
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        let fence = unsafe { self.device.create_fence(&ci, None) }.map_err(fail("create_fence"))?;
        Ok(FenceHandle(fence.as_raw()))
    }

    fn wait_fence(
        &mut self,
        fence: FenceHandle,
        timeout: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let ns = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u128::from(u64::MAX)) as u64);
        match unsafe {
            self.device
                .wait_for_fences(&[vk::Fence::from_raw(fence.0)], true, ns)
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(fail("wait_for_fences")(e)),
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> Result<(), BackendError> {
        unsafe { self.device.reset_fences(&[vk::Fence::from_raw(fence.0)]) }
            .map_err(fail("reset_fences"))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        unsafe { self.device.destroy_fence(vk::Fence::from_raw(fence.0), None) };
    }

    fn acquire_next(
        &mut self,
        timeout: Option<Duration>,
        signal: SemaphoreHandle,
    ) -> Result<Acquired, BackendStatus> {
        let ns = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u128::from(u64::MAX)) as u64);
        let (image_index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                ns,
                vk::Semaphore::from_raw(signal.0),
                vk::Fence::null(),
            )
        }
        .map_err(status_of)?;
        Ok(Acquired {
            image_index,
            suboptimal,
        })
    }

    fn begin_commands(
        &mut self,
        queue: QueueRole,
        slot: usize,
    ) -> Result<CommandStream, BackendError> {
        let cmd = unsafe { self.stream_for_slot(queue, slot) }.map_err(fail("begin_commands"))?;
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(fail("reset_command_buffer"))?;
            self.device
                .begin_command_buffer(cmd, &begin)
                .map_err(fail("begin_command_buffer"))?;
        }
        self.streams
            .insert(cmd.as_raw(), StreamInfo { role: queue, slot });
        Ok(CommandStream(cmd.as_raw()))
    }

    fn record_image_barrier(&mut self, commands: CommandStream, barrier: &ImageBarrier) {
        let Some(info) = self.streams.get(&commands.0).copied() else {
            warn!("barrier recorded into unknown command stream {:#x}", commands.0);
            return;
        };
        let (mut src_access, mut src_stage) = access_and_stage(barrier.old_layout);
        let (mut dst_access, mut dst_stage) = access_and_stage(barrier.new_layout);
        let (src_family, dst_family) = match barrier.transfer {
            Some(t) => {
                // Release half on the source queue, acquire half on the other.
                if info.role == QueueRole::Present {
                    src_access = vk::AccessFlags::empty();
                    src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
                } else {
                    dst_access = vk::AccessFlags::empty();
                    dst_stage = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
                }
                (t.src_family, t.dst_family)
            }
            None => (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
        };

        let b = vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: src_access,
            dst_access_mask: dst_access,
            old_layout: vk_layout(barrier.old_layout),
            new_layout: vk_layout(barrier.new_layout),
            src_queue_family_index: src_family,
            dst_queue_family_index: dst_family,
            image: vk::Image::from_raw(barrier.image.0),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe {
            self.device.cmd_pipeline_barrier(
                vk::CommandBuffer::from_raw(commands.0),
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[b],
            );
        }
    }

    fn submit(&mut self, submission: &Submission) -> Result<(), BackendError> {
        let cmd = vk::CommandBuffer::from_raw(submission.commands.0);
        let info = self.streams.remove(&submission.commands.0).unwrap_or(StreamInfo {
            role: submission.queue,
            slot: 0,
        });
        unsafe { self.device.end_command_buffer(cmd) }.map_err(fail("end_command_buffer"))?;

        let waits: Vec<vk::Semaphore> = submission
            .wait
            .map(|s| vk::Semaphore::from_raw(s.0))
            .into_iter()
            .collect();
        let signals: Vec<vk::Semaphore> = submission
            .signal
            .map(|s| vk::Semaphore::from_raw(s.0))
            .into_iter()
            .collect();
        let (queue, wait_stage, fence) = match submission.queue {
            QueueRole::Graphics => (
                self.graphics.queue,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                submission
                    .fence
                    .map_or(vk::Fence::null(), |f| vk::Fence::from_raw(f.0)),
            ),
            QueueRole::Present => (
                self.present.queue,
                vk::PipelineStageFlags::ALL_COMMANDS,
                self.present_fences
                    .get(info.slot)
                    .copied()
                    .unwrap_or(vk::Fence::null()),
            ),
        };
        let stages = vec![wait_stage; waits.len()];

        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: waits.len() as u32,
            p_wait_semaphores: waits.as_ptr(),
            p_wait_dst_stage_mask: stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: signals.len() as u32,
            p_signal_semaphores: signals.as_ptr(),
            ..Default::default()
        };
        unsafe { self.device.queue_submit(queue, &[submit], fence) }.map_err(fail("queue_submit"))
    }

    fn present(&mut self, request: &PresentRequest) -> BackendStatus {
        let wait = [vk::Semaphore::from_raw(request.wait.0)];
        let swapchains = [self.swapchain];
        let indices = [request.image_index];

        let times = request.timing.map(|t| {
            self.last_present_id = t.present_id.0;
            [vk::PresentTimeGOOGLE {
                present_id: t.present_id.0 as u32,
                desired_present_time: t.desired_present_ns.unwrap_or(0),
            }]
        });
        let times_info = times.as_ref().map(|times| vk::PresentTimesInfoGOOGLE {
            s_type: vk::StructureType::PRESENT_TIMES_INFO_GOOGLE,
            swapchain_count: 1,
            p_times: times.as_ptr(),
            ..Default::default()
        });
        let p_next = match (&times_info, &self.timing_loader) {
            (Some(ti), Some(_)) => ti as *const vk::PresentTimesInfoGOOGLE as *const c_void,
            _ => std::ptr::null(),
        };

        let present_info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            p_next,
            wait_semaphore_count: 1,
            p_wait_semaphores: wait.as_ptr(),
            swapchain_count: 1,
            p_swapchains: swapchains.as_ptr(),
            p_image_indices: indices.as_ptr(),
            ..Default::default()
        };

        match unsafe {
            self.swapchain_loader
                .queue_present(self.present.queue, &present_info)
        } {
            Ok(false) => BackendStatus::Success,
            Ok(true) => BackendStatus::Suboptimal,
            Err(e) => status_of(e),
        }
    }

    fn queue_family(&self, role: QueueRole) -> u32 {
        match role {
            QueueRole::Graphics => self.families.graphics,
            QueueRole::Present => self.families.present,
        }
    }

    fn supports_present_timing(&self) -> bool {
        self.timing_loader.is_some()
    }

    fn refresh_duration(&mut self) -> Option<Duration> {
        let loader = self.timing_loader.as_ref()?;
        if self.swapchain == vk::SwapchainKHR::null() {
            return None;
        }
        match unsafe { loader.get_refresh_cycle_duration(self.swapchain) } {
            Ok(r) if r.refresh_duration > 0 => Some(Duration::from_nanos(r.refresh_duration)),
            Ok(_) => None,
            Err(e) => {
                debug!("get_refresh_cycle_duration: {e:?}");
                None
            }
        }
    }

    fn query_past_presentation_timings(&mut self) -> Vec<PastPresentTiming> {
        let Some(loader) = self.timing_loader.as_ref() else {
            return Vec::new();
        };
        if self.swapchain == vk::SwapchainKHR::null() {
            return Vec::new();
        }
        match unsafe { loader.get_past_presentation_timing(self.swapchain) } {
            Ok(reports) => reports
                .into_iter()
                .map(|r| PastPresentTiming {
                    present_id: strobe_present::PresentId(widen_present_id(
                        self.last_present_id,
                        r.present_id,
                    )),
                    actual_present_ns: r.actual_present_time,
                })
                .collect(),
            Err(e) => {
                debug!("get_past_presentation_timing: {e:?}");
                Vec::new()
            }
        }
    }

    fn wait_idle(&mut self) -> Result<(), BackendError> {
        unsafe { self.device.device_wait_idle() }.map_err(fail("device_wait_idle"))
    }
}

// STRICT TEARDOWN ORDER:
// - device_wait_idle()
// - Framebuffers/render pass and image views BEFORE swapchain
// - Swapchains (live + retired) BEFORE device and surface
// - Fences and command pools BEFORE device
// - Surfaces AFTER device; debug messenger, then instance last.
// Semaphores, slot fences and the core's surface are released by the core
// before this runs.
impl Drop for VkBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.destroy_views();
            if let Some(clear) = self.clear.take() {
                clear.destroy(&self.device);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.destroy_retired();
            for fence in self.present_fences.drain(..) {
                self.device.destroy_fence(fence, None);
            }
            self.device.destroy_command_pool(self.graphics.pool, None);
            self.device.destroy_command_pool(self.present.pool, None);
            self.device.destroy_device(None);
            if let Some(s) = self.spare_surface.take() {
                self.surface_loader.destroy_surface(s, None);
            }
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
