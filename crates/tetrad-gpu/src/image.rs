//! Image views and render-target images.

use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::destruction::{is_null, DestructionQueue};
use crate::error::Result;
use crate::memory::{GpuAllocator, GpuImage};

/// Create a 2D view covering the first mip level and layer of `image`.
///
/// # Safety
/// The device and image must be valid.
pub unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    Ok(unsafe { device.create_image_view(&view_info, None)? })
}

/// Whether a depth format carries a stencil component.
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::S8_UINT
    )
}

/// Aspect mask for views of a depth attachment.
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

/// An allocated image plus its view, used as a framebuffer attachment.
pub struct AttachmentImage {
    pub image: GpuImage,
    pub view: vk::ImageView,
}

impl AttachmentImage {
    /// Multisampled color target resolved into a swapchain image.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn color(
        device: &ash::Device,
        allocator: &Mutex<GpuAllocator>,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        unsafe {
            Self::new(
                device,
                allocator,
                extent,
                format,
                samples,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
                "msaa color target",
            )
        }
    }

    /// Depth target.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn depth(
        device: &ash::Device,
        allocator: &Mutex<GpuAllocator>,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        unsafe {
            Self::new(
                device,
                allocator,
                extent,
                format,
                samples,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                depth_aspect(format),
                "depth target",
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn new(
        device: &ash::Device,
        allocator: &Mutex<GpuAllocator>,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        name: &str,
    ) -> Result<Self> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut image = allocator
            .lock()
            .create_image(&create_info, MemoryLocation::GpuOnly, name)?;

        let view = match unsafe { create_image_view(device, image.image, format, aspect) } {
            Ok(view) => view,
            Err(e) => {
                // SAFETY: the image was never used.
                unsafe { allocator.lock().free_image(&mut image)? };
                return Err(e);
            }
        };

        Ok(Self { image, view })
    }

    /// Whether the attachment has already been released.
    pub fn is_released(&self) -> bool {
        is_null(self.view) && self.image.is_released()
    }

    /// Hand the view, image and memory to the destruction queue.
    pub fn relay(&mut self, queue: &mut DestructionQueue) {
        if !is_null(self.view) {
            queue.push(std::mem::take(&mut self.view));
        }
        self.image.relay(queue);
    }

    /// Destroy the attachment now, or defer it through `queue`.
    ///
    /// # Safety
    /// Without a queue the attachment must not be in use.
    pub unsafe fn destroy(
        &mut self,
        device: &ash::Device,
        allocator: &Mutex<GpuAllocator>,
        queue: Option<&mut DestructionQueue>,
    ) -> Result<()> {
        if let Some(queue) = queue {
            self.relay(queue);
            return Ok(());
        }
        let view = std::mem::take(&mut self.view);
        if !is_null(view) {
            unsafe { device.destroy_image_view(view, None) };
        }
        unsafe { self.image.destroy(allocator, None) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destruction::DestructibleKind;
    use ash::vk::Handle;

    #[test]
    fn depth_aspect_includes_stencil_only_when_present() {
        assert_eq!(
            depth_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn attachment_relays_view_before_image() {
        let mut attachment = AttachmentImage {
            image: GpuImage {
                image: vk::Image::from_raw(1),
                allocation: None,
                format: vk::Format::D32_SFLOAT,
                extent: vk::Extent3D {
                    width: 8,
                    height: 8,
                    depth: 1,
                },
            },
            view: vk::ImageView::from_raw(2),
        };

        let mut queue = DestructionQueue::new();
        attachment.relay(&mut queue);
        attachment.relay(&mut queue);

        assert!(attachment.is_released());
        assert_eq!(
            queue.pending_kinds(0),
            vec![DestructibleKind::ImageView, DestructibleKind::Image]
        );
    }
}
