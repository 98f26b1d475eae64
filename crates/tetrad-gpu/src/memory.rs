//! GPU memory management.

use crate::destruction::{is_null, DestructionQueue};
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Allocate a buffer and bind its memory.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Allocate an image and bind its memory.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(name, requirements, location, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        Ok(GpuImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
        })
    }

    /// Return an allocation to the allocator.
    pub fn free_allocation(&mut self, allocation: Allocation) -> Result<()> {
        if allocation.is_null() {
            tracing::warn!("Freeing a null allocation");
            return Ok(());
        }
        self.inner()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Free a buffer and its allocation immediately.
    ///
    /// # Safety
    /// The buffer must not be in use by the GPU.
    pub unsafe fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.free_allocation(allocation)?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Free an image and its allocation immediately.
    ///
    /// # Safety
    /// The image must not be in use by the GPU.
    pub unsafe fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.free_allocation(allocation)?;
        }

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Host pointer of the buffer memory, if it is mapped.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(
                "Data range too large for buffer".to_string(),
            ));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Whether the buffer has already been released.
    pub fn is_released(&self) -> bool {
        is_null(self.buffer) && self.allocation.is_none()
    }

    /// Hand the buffer and its memory to the destruction queue.
    pub fn relay(&mut self, queue: &mut DestructionQueue) {
        if self.is_released() {
            return;
        }
        queue.push(std::mem::take(&mut self.buffer));
        if let Some(allocation) = self.allocation.take() {
            queue.push(allocation);
        }
    }

    /// Destroy the buffer now, or defer it through `queue`.
    ///
    /// # Safety
    /// Without a queue the buffer must not be in use by the GPU.
    pub unsafe fn destroy(
        &mut self,
        allocator: &Mutex<GpuAllocator>,
        queue: Option<&mut DestructionQueue>,
    ) -> Result<()> {
        match queue {
            Some(queue) => {
                self.relay(queue);
                Ok(())
            }
            None if self.is_released() => Ok(()),
            None => unsafe { allocator.lock().free_buffer(self) },
        }
    }
}

/// A GPU image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

impl GpuImage {
    /// Whether the image has already been released.
    pub fn is_released(&self) -> bool {
        is_null(self.image) && self.allocation.is_none()
    }

    /// Hand the image and its memory to the destruction queue.
    pub fn relay(&mut self, queue: &mut DestructionQueue) {
        if self.is_released() {
            return;
        }
        queue.push(std::mem::take(&mut self.image));
        if let Some(allocation) = self.allocation.take() {
            queue.push(allocation);
        }
    }

    /// Destroy the image now, or defer it through `queue`.
    ///
    /// # Safety
    /// Without a queue the image must not be in use by the GPU.
    pub unsafe fn destroy(
        &mut self,
        allocator: &Mutex<GpuAllocator>,
        queue: Option<&mut DestructionQueue>,
    ) -> Result<()> {
        match queue {
            Some(queue) => {
                self.relay(queue);
                Ok(())
            }
            None if self.is_released() => Ok(()),
            None => unsafe { allocator.lock().free_image(self) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destruction::DestructibleKind;
    use ash::vk::Handle;

    fn fake_buffer() -> GpuBuffer {
        GpuBuffer {
            buffer: vk::Buffer::from_raw(0x10),
            allocation: None,
            size: 256,
        }
    }

    #[test]
    fn relayed_buffer_is_queued_once() {
        let mut queue = DestructionQueue::new();
        let mut buffer = fake_buffer();

        buffer.relay(&mut queue);
        buffer.relay(&mut queue);

        assert!(buffer.is_released());
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.pending_kinds(0), vec![DestructibleKind::Buffer]);
    }

    #[test]
    fn unmapped_buffer_rejects_writes() {
        let buffer = fake_buffer();
        assert!(buffer.mapped_ptr().is_none());
        assert!(matches!(
            buffer.write_bytes(0, &[1, 2, 3]),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn relayed_image_is_queued_once() {
        let mut queue = DestructionQueue::new();
        let mut image = GpuImage {
            image: vk::Image::from_raw(0x20),
            allocation: None,
            format: vk::Format::D32_SFLOAT,
            extent: vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            },
        };

        image.relay(&mut queue);
        image.relay(&mut queue);

        assert!(image.is_released());
        assert_eq!(queue.pending_kinds(0), vec![DestructibleKind::Image]);
    }
}
