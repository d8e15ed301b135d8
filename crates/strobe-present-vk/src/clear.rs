// SPDX-License-Identifier: CEPL-1.0
//! Single-attachment clear pass over the swap images.
//!
//! The pass neither transitions into nor out of the colour-attachment layout;
//! the presentation core records those barriers around it.

use ash::vk;

pub(crate) struct ClearPass {
    format: vk::Format,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
}

impl ClearPass {
    pub(crate) unsafe fn new(device: &ash::Device, format: vk::Format) -> Result<Self, vk::Result> {
        let color_att = vk::AttachmentDescription {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..Default::default()
        };
        let att_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: 1,
            p_color_attachments: &att_ref,
            ..Default::default()
        };
        let rp_info = vk::RenderPassCreateInfo {
            s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
            attachment_count: 1,
            p_attachments: &color_att,
            subpass_count: 1,
            p_subpasses: &subpass,
            ..Default::default()
        };
        let render_pass = unsafe { device.create_render_pass(&rp_info, None)? };
        Ok(Self {
            format,
            render_pass,
            framebuffers: Vec::new(),
            extent: vk::Extent2D::default(),
        })
    }

    pub(crate) fn format(&self) -> vk::Format {
        self.format
    }

    /// Replaces the framebuffers with ones over `views`.
    pub(crate) unsafe fn bind_views(
        &mut self,
        device: &ash::Device,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<(), vk::Result> {
        unsafe { self.release_framebuffers(device) };
        for view in views {
            let fb_info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: self.render_pass,
                attachment_count: 1,
                p_attachments: view,
                width: extent.width,
                height: extent.height,
                layers: 1,
                ..Default::default()
            };
            self.framebuffers
                .push(unsafe { device.create_framebuffer(&fb_info, None)? });
        }
        self.extent = extent;
        Ok(())
    }

    pub(crate) unsafe fn release_framebuffers(&mut self, device: &ash::Device) {
        for fb in self.framebuffers.drain(..) {
            unsafe { device.destroy_framebuffer(fb, None) };
        }
    }

    /// Records a clear of image `index`. The image must already be in the
    /// colour-attachment layout.
    pub(crate) unsafe fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        index: usize,
        rgba: [f32; 4],
    ) {
        let Some(&framebuffer) = self.framebuffers.get(index) else {
            return;
        };
        let clears = [vk::ClearValue {
            color: vk::ClearColorValue { float32: rgba },
        }];
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        unsafe {
            device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            device.cmd_end_render_pass(cmd);
        }
    }

    pub(crate) unsafe fn destroy(mut self, device: &ash::Device) {
        unsafe {
            self.release_framebuffers(device);
            device.destroy_render_pass(self.render_pass, None);
        }
    }
}
