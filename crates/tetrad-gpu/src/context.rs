//! GPU context management.

use std::ffi::c_char;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;

use crate::capabilities::{find_depth_format, GpuCapabilities};
use crate::destruction::VulkanDestroyer;
use crate::error::{GpuError, Result};
use crate::instance::{
    create_instance, find_graphics_queue_family, select_physical_device, DebugMessenger,
};
use crate::memory::GpuAllocator;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    allocator: Mutex<GpuAllocator>,

    // Graphics and present share one queue.
    graphics_queue_family: u32,
    graphics_queue: vk::Queue,

    msaa_samples: vk::SampleCountFlags,
    depth_format: vk::Format,
}

impl GpuContext {
    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle to the device, for wrappers that outlive a borrow.
    pub fn shared_device(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Sample count of the forward pass.
    pub fn msaa_samples(&self) -> vk::SampleCountFlags {
        self.msaa_samples
    }

    /// Depth attachment format.
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Whether validation messages are being forwarded.
    pub fn has_validation(&self) -> bool {
        self.debug_messenger.is_some()
    }

    /// Destroyer for device-level handles and allocations.
    pub fn destroyer(&self) -> VulkanDestroyer<'_> {
        VulkanDestroyer::new(&self.device).with_allocator(&self.allocator)
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            if let Some(messenger) = self.debug_messenger.as_mut() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    display: Option<RawDisplayHandle>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Tetrad".to_string(),
            enable_validation: cfg!(debug_assertions),
            display: None,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Enable the surface extensions needed for windows on `display`.
    pub fn display(mut self, display: RawDisplayHandle) -> Self {
        self.display = Some(display);
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let created =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation, self.display) }?;
        let instance = created.instance;

        // From here on, failures must tear the instance down again.
        match unsafe { Self::finish(entry.clone(), instance.clone(), created.validation) } {
            Ok(context) => Ok(context),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    unsafe fn finish(
        entry: ash::Entry,
        instance: ash::Instance,
        validation: bool,
    ) -> Result<GpuContext> {
        let (physical_device, capabilities) = unsafe { select_physical_device(&instance)? };
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let graphics_queue_family = unsafe {
            find_graphics_queue_family(&instance, physical_device)
        }
        .ok_or(GpuError::NoSuitableDevice)?;
        let depth_format = unsafe { find_depth_format(&instance, physical_device)? };
        let msaa_samples = capabilities.msaa_samples();

        let device = unsafe { create_device(&instance, physical_device, graphics_queue_family)? };
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let device = Arc::new(device);

        let allocator =
            match unsafe { GpuAllocator::new(&instance, Arc::clone(&device), physical_device) } {
                Ok(allocator) => allocator,
                Err(e) => {
                    unsafe { device.destroy_device(None) };
                    return Err(e);
                }
            };

        // Installed last so nothing above leaks it on failure.
        let debug_messenger = if validation {
            match unsafe { DebugMessenger::new(&entry, &instance) } {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    tracing::warn!("Failed to install debug messenger: {e}");
                    None
                }
            }
        } else {
            None
        };

        tracing::debug!(
            samples = msaa_samples.as_raw(),
            depth = ?depth_format,
            "Forward pass attachments"
        );

        Ok(GpuContext {
            entry,
            instance,
            debug_messenger,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            graphics_queue_family,
            graphics_queue,
            msaa_samples,
            depth_format,
        })
    }
}

/// Create the logical device with a single graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names: Vec<*const c_char> = vec![ash::khr::swapchain::NAME.as_ptr()];

    let mut vulkan_1_2_features =
        vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };
    Ok(device)
}
