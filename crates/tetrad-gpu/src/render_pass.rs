//! The forward render pass.
//!
//! With MSAA the pass renders into a multisampled color target that is
//! resolved into the swapchain image at the end of the subpass. Without MSAA
//! it renders straight into the swapchain image. Depth is always attached
//! last.

use ash::vk;

use crate::destruction::{is_null, DestructionQueue};
use crate::error::{GpuError, Result};

/// Attachment layout of the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardPassLayout {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
}

impl ForwardPassLayout {
    /// Describe a forward pass.
    pub fn new(
        color_format: vk::Format,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Self {
        Self {
            color_format,
            depth_format,
            samples,
        }
    }

    /// Whether color is rendered multisampled and resolved.
    pub fn is_multisampled(&self) -> bool {
        self.samples != vk::SampleCountFlags::TYPE_1
    }

    /// Number of framebuffer attachments.
    pub fn attachment_count(&self) -> usize {
        if self.is_multisampled() {
            3
        } else {
            2
        }
    }

    /// Index of the depth attachment.
    pub fn depth_index(&self) -> u32 {
        self.attachment_count() as u32 - 1
    }

    /// Attachment descriptions in framebuffer order.
    pub fn attachments(&self) -> Vec<vk::AttachmentDescription> {
        let depth = vk::AttachmentDescription::default()
            .format(self.depth_format)
            .samples(self.samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let present = vk::AttachmentDescription::default()
            .format(self.color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .store_op(vk::AttachmentStoreOp::STORE);

        if self.is_multisampled() {
            let color = vk::AttachmentDescription::default()
                .format(self.color_format)
                .samples(self.samples)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            // The resolve target is fully overwritten.
            let resolve = present.load_op(vk::AttachmentLoadOp::DONT_CARE);
            vec![color, resolve, depth]
        } else {
            vec![present.load_op(vk::AttachmentLoadOp::CLEAR), depth]
        }
    }

    /// Clear values in attachment order.
    pub fn clear_values(&self, color: [f32; 4]) -> Vec<vk::ClearValue> {
        let color = vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        };
        let depth = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        };
        if self.is_multisampled() {
            vec![color, color, depth]
        } else {
            vec![color, depth]
        }
    }

    /// Views for one framebuffer, in attachment order.
    ///
    /// `color` is the multisampled target and must be given exactly when the
    /// pass is multisampled.
    pub fn framebuffer_attachments(
        &self,
        present: vk::ImageView,
        color: Option<vk::ImageView>,
        depth: vk::ImageView,
    ) -> Result<Vec<vk::ImageView>> {
        match (self.is_multisampled(), color) {
            (true, Some(color)) => Ok(vec![color, present, depth]),
            (false, None) => Ok(vec![present, depth]),
            (true, None) => Err(GpuError::InvalidState(
                "Multisampled pass needs a color target".to_string(),
            )),
            (false, Some(_)) => Err(GpuError::InvalidState(
                "Single-sampled pass takes no separate color target".to_string(),
            )),
        }
    }
}

/// Render pass wrapper.
pub struct RenderPass {
    pub(crate) handle: vk::RenderPass,
    pub(crate) layout: ForwardPassLayout,
}

impl RenderPass {
    /// Create the forward render pass.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, layout: ForwardPassLayout) -> Result<Self> {
        let attachments = layout.attachments();

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let resolve_refs = [vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: layout.depth_index(),
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref);
        if layout.is_multisampled() {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .dst_stage_mask(stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let subpasses = [subpass];
        let dependencies = [dependency];
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { device.create_render_pass(&create_info, None)? };
        Ok(Self { handle, layout })
    }

    /// Raw handle.
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// Attachment layout the pass was built with.
    pub fn layout(&self) -> &ForwardPassLayout {
        &self.layout
    }

    /// Hand the pass to the destruction queue.
    pub fn relay(&mut self, queue: &mut DestructionQueue) {
        if !is_null(self.handle) {
            queue.push(std::mem::take(&mut self.handle));
        }
    }

    /// Destroy the pass now, or defer it through `queue`.
    ///
    /// # Safety
    /// Without a queue the pass must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device, queue: Option<&mut DestructionQueue>) {
        match queue {
            Some(queue) => self.relay(queue),
            None => {
                let handle = std::mem::take(&mut self.handle);
                if !is_null(handle) {
                    unsafe { device.destroy_render_pass(handle, None) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn layout(samples: vk::SampleCountFlags) -> ForwardPassLayout {
        ForwardPassLayout::new(
            vk::Format::B8G8R8A8_SRGB,
            vk::Format::D32_SFLOAT,
            samples,
        )
    }

    #[test]
    fn multisampled_pass_resolves_into_present_image() {
        let layout = layout(vk::SampleCountFlags::TYPE_4);
        let attachments = layout.attachments();

        assert_eq!(layout.attachment_count(), 3);
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[1].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachments[1].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachments[2].format, vk::Format::D32_SFLOAT);
        assert_eq!(layout.depth_index(), 2);
        assert_eq!(layout.clear_values([0.0; 4]).len(), 3);
    }

    #[test]
    fn single_sampled_pass_renders_into_present_image() {
        let layout = layout(vk::SampleCountFlags::TYPE_1);
        let attachments = layout.attachments();

        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(layout.depth_index(), 1);
    }

    #[test]
    fn framebuffer_views_follow_attachment_order() {
        let present = vk::ImageView::from_raw(1);
        let color = vk::ImageView::from_raw(2);
        let depth = vk::ImageView::from_raw(3);

        let msaa = layout(vk::SampleCountFlags::TYPE_2);
        assert_eq!(
            msaa.framebuffer_attachments(present, Some(color), depth).unwrap(),
            vec![color, present, depth]
        );
        assert!(msaa.framebuffer_attachments(present, None, depth).is_err());

        let single = layout(vk::SampleCountFlags::TYPE_1);
        assert_eq!(
            single.framebuffer_attachments(present, None, depth).unwrap(),
            vec![present, depth]
        );
        assert!(single
            .framebuffer_attachments(present, Some(color), depth)
            .is_err());
    }
}
