//! Framebuffer wrapper.

use ash::vk;

use crate::destruction::{is_null, DestructionQueue};
use crate::error::Result;

/// Framebuffer wrapper.
pub struct Framebuffer {
    pub(crate) handle: vk::Framebuffer,
    pub(crate) extent: vk::Extent2D,
}

impl Framebuffer {
    /// Create a framebuffer for `render_pass` over `attachments`.
    ///
    /// # Safety
    /// The device, pass and views must be valid and compatible.
    pub unsafe fn new(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let handle = unsafe { device.create_framebuffer(&create_info, None)? };
        Ok(Self { handle, extent })
    }

    /// Raw handle.
    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    /// Size of the attachments.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Hand the framebuffer to the destruction queue.
    pub fn relay(&mut self, queue: &mut DestructionQueue) {
        if !is_null(self.handle) {
            queue.push(std::mem::take(&mut self.handle));
        }
    }

    /// Destroy the framebuffer now, or defer it through `queue`.
    ///
    /// # Safety
    /// Without a queue the framebuffer must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device, queue: Option<&mut DestructionQueue>) {
        match queue {
            Some(queue) => self.relay(queue),
            None => {
                let handle = std::mem::take(&mut self.handle);
                if !is_null(handle) {
                    unsafe { device.destroy_framebuffer(handle, None) };
                }
            }
        }
    }
}
