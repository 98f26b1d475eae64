//! Vulkan instance creation and physical device selection.

use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr, CString};

use ash::vk;
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, warn, Level};

use crate::capabilities::GpuCapabilities;
use crate::destruction::is_null;
use crate::error::{GpuError, Result};

/// Lowest Vulkan version the engine runs on.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_2;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions needed to present to `display`, or none when headless.
pub fn required_instance_extensions(display: Option<RawDisplayHandle>) -> Result<Vec<*const c_char>> {
    #[allow(unused_mut)]
    let mut extensions = match display {
        Some(display) => ash_window::enumerate_required_extensions(display)?.to_vec(),
        None => Vec::new(),
    };

    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());

    Ok(extensions)
}

/// Whether the validation layer is installed.
///
/// # Safety
/// The entry must be valid.
unsafe fn validation_available(entry: &ash::Entry) -> Result<bool> {
    let layers = unsafe { entry.enumerate_instance_layer_properties()? };
    Ok(layers
        .iter()
        .any(|props| props.layer_name_as_c_str().ok() == Some(VALIDATION_LAYER)))
}

/// A created instance and whether validation ended up enabled.
pub struct CreatedInstance {
    pub instance: ash::Instance,
    pub validation: bool,
}

/// Create a Vulkan instance.
///
/// Validation is skipped with a warning when the layer is not installed.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    display: Option<RawDisplayHandle>,
) -> Result<CreatedInstance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Tetrad")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(MIN_API_VERSION);

    let validation = enable_validation && unsafe { validation_available(entry)? };
    if enable_validation && !validation {
        warn!("Validation layer {VALIDATION_LAYER:?} not available");
    }

    let mut extension_names = required_instance_extensions(display)?;
    let mut layer_names = Vec::new();
    if validation {
        extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
        layer_names.push(VALIDATION_LAYER.as_ptr());
    }

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None)? };
    Ok(CreatedInstance {
        instance,
        validation,
    })
}

/// Debug messenger forwarding validation messages into `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Install the messenger.
    ///
    /// # Safety
    /// The instance must have been created with `VK_EXT_debug_utils`.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let handle = unsafe { loader.create_debug_utils_messenger(&create_info, None)? };
        info!("Vulkan validation enabled");
        Ok(Self { loader, handle })
    }

    /// Remove the messenger. Must run before the instance is destroyed.
    ///
    /// # Safety
    /// The instance must still be alive.
    pub unsafe fn destroy(&mut self) {
        let handle = std::mem::take(&mut self.handle);
        if !is_null(handle) {
            unsafe { self.loader.destroy_debug_utils_messenger(handle, None) };
        }
    }
}

/// Log level for a validation message severity.
pub fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Level::ERROR
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Level::WARN
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        Level::INFO
    } else {
        Level::DEBUG
    }
}

fn message_kind(message_type: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }

    let callback_data = unsafe { &*p_callback_data };
    let message = if callback_data.p_message.is_null() {
        Cow::Borrowed("(no message)")
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message).to_string_lossy() }
    };
    let kind = message_kind(message_type);

    let level = severity_level(message_severity);
    if level == Level::ERROR {
        error!(kind, "{message}");
    } else if level == Level::WARN {
        warn!(kind, "{message}");
    } else if level == Level::INFO {
        info!(kind, "{message}");
    } else {
        debug!(kind, "{message}");
    }

    vk::FALSE
}

/// Score a device for selection; `None` when it cannot run the engine.
pub fn score_device(
    device_type: vk::PhysicalDeviceType,
    capabilities: &GpuCapabilities,
    has_graphics_queue: bool,
) -> Option<u64> {
    if !has_graphics_queue || !capabilities.meets_requirements() {
        return None;
    }

    let type_score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 1,
    };

    // +1 per GB of VRAM
    Some(type_score + capabilities.device_local_memory_mb / 1024)
}

/// First queue family with graphics support.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}

/// Pick the best physical device, preferring discrete GPUs.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, GpuCapabilities)> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    let mut best: Option<(u64, vk::PhysicalDevice, GpuCapabilities)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let capabilities = unsafe { GpuCapabilities::query(instance, device) };
        let has_graphics = unsafe { find_graphics_queue_family(instance, device) }.is_some();

        let Some(score) = score_device(properties.device_type, &capabilities, has_graphics) else {
            debug!(device = %capabilities.device_name, "Skipping unsuitable GPU");
            continue;
        };
        if best.as_ref().map_or(true, |(best_score, ..)| score > *best_score) {
            best = Some((score, device, capabilities));
        }
    }

    best.map(|(_, device, capabilities)| (device, capabilities))
        .ok_or(GpuError::NoSuitableDevice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::GpuVendor;
    use std::collections::HashSet;

    fn capabilities(api_version: u32, vram_mb: u64) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "test".to_string(),
            api_version,
            driver_version: 0,
            supports_timeline_semaphore: true,
            framebuffer_sample_counts: vk::SampleCountFlags::TYPE_1,
            device_local_memory_mb: vram_mb,
            available_extensions: HashSet::from(["VK_KHR_swapchain".to_string()]),
        }
    }

    #[test]
    fn discrete_gpus_score_highest() {
        let caps = capabilities(vk::API_VERSION_1_2, 8192);
        let discrete = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, &caps, true);
        let integrated = score_device(vk::PhysicalDeviceType::INTEGRATED_GPU, &caps, true);
        assert!(discrete > integrated);
        assert_eq!(discrete, Some(1008));
    }

    #[test]
    fn unsuitable_devices_are_rejected() {
        let old = capabilities(vk::API_VERSION_1_1, 8192);
        assert_eq!(score_device(vk::PhysicalDeviceType::DISCRETE_GPU, &old, true), None);

        let caps = capabilities(vk::API_VERSION_1_3, 8192);
        assert_eq!(score_device(vk::PhysicalDeviceType::DISCRETE_GPU, &caps, false), None);

        let mut no_swapchain = capabilities(vk::API_VERSION_1_3, 8192);
        no_swapchain.available_extensions.clear();
        assert_eq!(
            score_device(vk::PhysicalDeviceType::CPU, &no_swapchain, true),
            None
        );
    }

    #[test]
    fn severities_map_to_log_levels() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;
        assert_eq!(severity_level(Severity::ERROR), Level::ERROR);
        assert_eq!(severity_level(Severity::WARNING), Level::WARN);
        assert_eq!(severity_level(Severity::INFO), Level::INFO);
        assert_eq!(severity_level(Severity::VERBOSE), Level::DEBUG);
        assert_eq!(
            message_kind(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION),
            "validation"
        );
    }
}
