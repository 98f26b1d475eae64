//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;
use tetrad_core::constants::MAX_MSAA_SAMPLES;

use crate::error::{GpuError, Result};

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Timeline semaphore support (VK 1.2 core, `VK_KHR_timeline_semaphore` before)
    pub supports_timeline_semaphore: bool,

    /// Sample counts usable for both color and depth framebuffer attachments
    pub framebuffer_sample_counts: vk::SampleCountFlags,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                ext.extension_name_as_c_str()
                    .ok()
                    .and_then(|name| name.to_str().ok())
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = properties
            .device_name_as_c_str()
            .map(CStr::to_string_lossy)
            .map(|name| name.into_owned())
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_2 =
            vk::api_version_major(api_version) >= 1 && vk::api_version_minor(api_version) >= 2;

        let limits = properties.limits;

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_timeline_semaphore: has_vulkan_1_2
                || available_extensions.contains("VK_KHR_timeline_semaphore"),

            framebuffer_sample_counts: limits.framebuffer_color_sample_counts
                & limits.framebuffer_depth_sample_counts,

            device_local_memory_mb,
            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements for the engine.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 2) {
            return false;
        }

        self.supports_timeline_semaphore && self.available_extensions.contains("VK_KHR_swapchain")
    }

    /// Sample count used by the forward pass on this device.
    pub fn msaa_samples(&self) -> vk::SampleCountFlags {
        select_msaa_samples(max_sample_count(self.framebuffer_sample_counts))
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - up to {}x MSAA",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            max_sample_count(self.framebuffer_sample_counts),
        )
    }
}

/// Highest sample count contained in `flags` (1 when empty).
pub fn max_sample_count(flags: vk::SampleCountFlags) -> u32 {
    let raw = flags.as_raw();
    if raw == 0 {
        1
    } else {
        1 << (31 - raw.leading_zeros())
    }
}

/// Pick the MSAA sample count for a device supporting up to `device_max` samples.
///
/// Half the device maximum, capped at [`MAX_MSAA_SAMPLES`], rounded down to a
/// power of two and never below one sample.
pub fn select_msaa_samples(device_max: u32) -> vk::SampleCountFlags {
    let limit = (device_max / 2).min(MAX_MSAA_SAMPLES);
    let samples = if limit == 0 {
        1
    } else {
        1 << (31 - limit.leading_zeros())
    };
    vk::SampleCountFlags::from_raw(samples)
}

/// First candidate for which `supports` holds.
pub fn select_depth_format(
    candidates: &[vk::Format],
    mut supports: impl FnMut(&vk::Format) -> bool,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|f| supports(f))
}

/// Find the depth format to use on a physical device.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn find_depth_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<vk::Format> {
    select_depth_format(&DEPTH_FORMAT_CANDIDATES, |&format| {
        let properties =
            unsafe { instance.get_physical_device_format_properties(physical_device, format) };
        properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
    .ok_or_else(|| GpuError::Other("No supported depth attachment format".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn max_sample_count_picks_highest_bit() {
        let flags = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        assert_eq!(max_sample_count(flags), 8);
        assert_eq!(max_sample_count(vk::SampleCountFlags::empty()), 1);
    }

    #[test]
    fn msaa_is_half_the_device_max_capped_at_four() {
        assert_eq!(select_msaa_samples(64), vk::SampleCountFlags::TYPE_4);
        assert_eq!(select_msaa_samples(8), vk::SampleCountFlags::TYPE_4);
        assert_eq!(select_msaa_samples(4), vk::SampleCountFlags::TYPE_2);
        assert_eq!(select_msaa_samples(2), vk::SampleCountFlags::TYPE_1);
        assert_eq!(select_msaa_samples(1), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn msaa_rounds_down_to_power_of_two() {
        // A non power-of-two bound still yields a valid sample count.
        assert_eq!(select_msaa_samples(6), vk::SampleCountFlags::TYPE_2);
    }

    #[test]
    fn depth_format_prefers_first_supported() {
        let all = select_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| true);
        assert_eq!(all, Some(vk::Format::D32_SFLOAT));

        let stencil_only = select_depth_format(&DEPTH_FORMAT_CANDIDATES, |f| {
            *f == vk::Format::D24_UNORM_S8_UINT
        });
        assert_eq!(stencil_only, Some(vk::Format::D24_UNORM_S8_UINT));

        assert_eq!(select_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| false), None);
    }
}
