//! Vulkan abstraction layer for the Tetrad engine.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - Fence, semaphore and command buffer wrappers
//! - Swapchain handling with frames in flight
//! - Deferred destruction of GPU handles

pub mod capabilities;
pub mod command;
pub mod context;
pub mod destruction;
pub mod error;
pub mod frame;
pub mod framebuffer;
pub mod image;
pub mod instance;
pub mod memory;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{begin_command_buffer, end_command_buffer, CommandPool, SubmitBatch};
pub use context::{GpuContext, GpuContextBuilder};
pub use destruction::{
    CycleToken, Destroyer, Destructible, DestructibleKind, DestructionQueue, VulkanDestroyer,
};
pub use error::{GpuError, Result};
pub use frame::{FrameCycle, SlotImage};
pub use framebuffer::Framebuffer;
pub use image::AttachmentImage;
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use render_pass::{ForwardPassLayout, RenderPass};
pub use surface::{SurfaceContext, SurfaceSupport};
pub use swapchain::{
    FrameTarget, PresentStatus, PresentTarget, Swapchain, SwapchainConfig, SwapchainOptions,
};
pub use sync::{Fence, Ownership, Semaphore, SemaphoreIds, SemaphoreKind, WaitStatus};
