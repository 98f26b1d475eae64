//! Per-frame context for rendering.

use ash::vk;
use glam::Vec4;

/// Context for the current frame being rendered.
///
/// The forward render pass is already begun on `command_buffer`; everything
/// recorded here lands in it.
pub struct FrameContext<'a> {
    device: &'a ash::Device,
    /// Command buffer for recording rendering commands.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// Frame slot being recorded.
    pub slot: usize,
    /// Render area.
    pub extent: vk::Extent2D,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number.
    pub frame_number: u64,
}

impl<'a> FrameContext<'a> {
    pub(crate) fn new(
        device: &'a ash::Device,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
        slot: usize,
        extent: vk::Extent2D,
        dt: f32,
        frame_number: u64,
    ) -> Self {
        Self {
            device,
            command_buffer,
            image_index,
            slot,
            extent,
            dt,
            frame_number,
        }
    }

    /// Fill a pixel rectangle with a solid color.
    ///
    /// The rectangle is clipped to the render area; nothing is recorded when
    /// it lies fully outside.
    pub fn fill_rect(&self, x: i32, y: i32, width: u32, height: u32, color: Vec4) {
        let Some(rect) = clip_rect(x, y, width, height, self.extent) else {
            return;
        };

        let attachment = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: color.to_array(),
                },
            },
        };
        let clear_rect = vk::ClearRect {
            rect,
            base_array_layer: 0,
            layer_count: 1,
        };

        // SAFETY: the render pass is active on this command buffer and the
        // rect lies inside its render area.
        unsafe {
            self.device
                .cmd_clear_attachments(self.command_buffer, &[attachment], &[clear_rect]);
        }
    }
}

/// Intersect a rectangle with the render area.
pub fn clip_rect(x: i32, y: i32, width: u32, height: u32, extent: vk::Extent2D) -> Option<vk::Rect2D> {
    let x0 = i64::from(x).max(0);
    let y0 = i64::from(y).max(0);
    let x1 = (i64::from(x) + i64::from(width)).min(i64::from(extent.width));
    let y1 = (i64::from(y) + i64::from(height)).min(i64::from(extent.height));
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some(vk::Rect2D {
        offset: vk::Offset2D {
            x: x0 as i32,
            y: y0 as i32,
        },
        extent: vk::Extent2D {
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    #[test]
    fn inside_rect_is_unchanged() {
        let rect = clip_rect(10, 20, 30, 40, EXTENT).unwrap();
        assert_eq!((rect.offset.x, rect.offset.y), (10, 20));
        assert_eq!((rect.extent.width, rect.extent.height), (30, 40));
    }

    #[test]
    fn overhanging_rect_is_clipped() {
        let rect = clip_rect(-5, 590, 20, 50, EXTENT).unwrap();
        assert_eq!((rect.offset.x, rect.offset.y), (0, 590));
        assert_eq!((rect.extent.width, rect.extent.height), (15, 10));
    }

    #[test]
    fn outside_or_empty_rect_is_dropped() {
        assert!(clip_rect(800, 0, 10, 10, EXTENT).is_none());
        assert!(clip_rect(-20, 0, 10, 10, EXTENT).is_none());
        assert!(clip_rect(0, 0, 0, 10, EXTENT).is_none());
    }
}
