//! Surface management for windowed rendering.
//!
//! Hides the raw-window-handle plumbing from application code and carries
//! the surface and swapchain extension loaders.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::context::GpuContext;
use crate::destruction::{is_null, DestructionQueue, VulkanDestroyer};
use crate::error::{GpuError, Result};

/// Surface context for windowed rendering.
pub struct SurfaceContext {
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    /// Create a surface for a window.
    ///
    /// # Safety
    /// The GPU context must be valid and the window must outlive the surface.
    pub unsafe fn from_window<W>(gpu: &GpuContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = unsafe {
            ash_window::create_surface(
                gpu.entry(),
                gpu.instance(),
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(gpu.entry(), gpu.instance());
        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());

        let mut context = Self {
            surface,
            surface_loader,
            swapchain_loader,
        };

        let family = gpu.graphics_queue_family();
        if !unsafe { context.supports_present(gpu, family)? } {
            unsafe { context.destroy(None) };
            return Err(GpuError::SurfaceCreation(format!(
                "Queue family {family} cannot present to this surface"
            )));
        }

        Ok(context)
    }

    /// Raw surface handle.
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Surface extension loader.
    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    /// Swapchain extension loader.
    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Whether `queue_family` can present to this surface.
    ///
    /// # Safety
    /// The GPU context must be valid.
    pub unsafe fn supports_present(&self, gpu: &GpuContext, queue_family: u32) -> Result<bool> {
        Ok(unsafe {
            self.surface_loader.get_physical_device_surface_support(
                gpu.physical_device(),
                queue_family,
                self.surface,
            )?
        })
    }

    /// Query what the surface supports.
    ///
    /// # Safety
    /// The GPU context must be valid.
    pub unsafe fn support(&self, gpu: &GpuContext) -> Result<SurfaceSupport> {
        let physical_device = gpu.physical_device();
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            })
        }
    }

    /// Destroyer able to release every kind of handle queued by the engine.
    pub fn destroyer<'a>(&'a self, gpu: &'a GpuContext) -> VulkanDestroyer<'a> {
        gpu.destroyer()
            .with_swapchain_loader(&self.swapchain_loader)
            .with_surface_loader(&self.surface_loader)
    }

    /// Hand the surface to the destruction queue.
    pub fn relay(&mut self, queue: &mut DestructionQueue) {
        if !is_null(self.surface) {
            queue.push(std::mem::take(&mut self.surface));
        }
    }

    /// Destroy the surface now, or defer it through `queue`.
    ///
    /// # Safety
    /// Without a queue no swapchain may still use the surface.
    pub unsafe fn destroy(&mut self, queue: Option<&mut DestructionQueue>) {
        match queue {
            Some(queue) => self.relay(queue),
            None => {
                let surface = std::mem::take(&mut self.surface);
                if !is_null(surface) {
                    unsafe { self.surface_loader.destroy_surface(surface, None) };
                }
            }
        }
    }
}

impl Drop for SurfaceContext {
    fn drop(&mut self) {
        if !is_null(self.surface) {
            tracing::warn!("Surface dropped without being destroyed; potential leak");
        }
    }
}

/// Surface support query result.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}
