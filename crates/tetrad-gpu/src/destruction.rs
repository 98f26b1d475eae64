//! Deferred destruction of GPU handles for multi-frame-in-flight rendering.
//!
//! With several frames in flight a handle cannot be destroyed the moment the
//! CPU is done with it, since a previously submitted frame may still read it.
//! Handles are instead pushed into the bucket of the frame that retired them
//! and destroyed when that bucket is cleared.
//!
//! A bucket may only be cleared once the in-flight fence of the frame that
//! filled it has been observed signaled. That observation is carried by a
//! [`CycleToken`], which the swapchain hands out after its fence wait.

use std::any::Any;
use std::fmt;

use ash::vk::{self, Handle};
use gpu_allocator::vulkan::Allocation;
use parking_lot::Mutex;
use tetrad_core::constants::FRAMES_IN_FLIGHT;
use tracing::{debug, error, warn};

use crate::error::{GpuError, Result};
use crate::memory::GpuAllocator;

/// Whether a raw Vulkan handle is `VK_NULL_HANDLE`.
#[inline]
pub fn is_null<H: Handle>(handle: H) -> bool {
    handle.as_raw() == 0
}

/// Kind of a queued handle, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestructibleKind {
    Memory,
    Allocation,
    Buffer,
    Image,
    ImageView,
    Semaphore,
    Fence,
    CommandPool,
    CommandBuffer,
    RenderPass,
    Framebuffer,
    Swapchain,
    Surface,
    Window,
}

/// A handle whose destruction can be deferred.
pub enum Destructible {
    Memory(vk::DeviceMemory),
    Allocation(Allocation),
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
    CommandPool(vk::CommandPool),
    /// A command buffer together with the pool it was allocated from.
    CommandBuffer {
        buffer: vk::CommandBuffer,
        pool: vk::CommandPool,
    },
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    Swapchain(vk::SwapchainKHR),
    Surface(vk::SurfaceKHR),
    /// A host object, such as an OS window, released by dropping it.
    Window(Box<dyn Any + Send>),
}

impl Destructible {
    /// Kind of this entry.
    pub fn kind(&self) -> DestructibleKind {
        match self {
            Self::Memory(_) => DestructibleKind::Memory,
            Self::Allocation(_) => DestructibleKind::Allocation,
            Self::Buffer(_) => DestructibleKind::Buffer,
            Self::Image(_) => DestructibleKind::Image,
            Self::ImageView(_) => DestructibleKind::ImageView,
            Self::Semaphore(_) => DestructibleKind::Semaphore,
            Self::Fence(_) => DestructibleKind::Fence,
            Self::CommandPool(_) => DestructibleKind::CommandPool,
            Self::CommandBuffer { .. } => DestructibleKind::CommandBuffer,
            Self::RenderPass(_) => DestructibleKind::RenderPass,
            Self::Framebuffer(_) => DestructibleKind::Framebuffer,
            Self::Swapchain(_) => DestructibleKind::Swapchain,
            Self::Surface(_) => DestructibleKind::Surface,
            Self::Window(_) => DestructibleKind::Window,
        }
    }

    /// Whether the entry refers to nothing.
    pub fn is_null(&self) -> bool {
        match self {
            Self::Memory(h) => is_null(*h),
            Self::Allocation(a) => a.is_null(),
            Self::Buffer(h) => is_null(*h),
            Self::Image(h) => is_null(*h),
            Self::ImageView(h) => is_null(*h),
            Self::Semaphore(h) => is_null(*h),
            Self::Fence(h) => is_null(*h),
            Self::CommandPool(h) => is_null(*h),
            Self::CommandBuffer { buffer, .. } => is_null(*buffer),
            Self::RenderPass(h) => is_null(*h),
            Self::Framebuffer(h) => is_null(*h),
            Self::Swapchain(h) => is_null(*h),
            Self::Surface(h) => is_null(*h),
            Self::Window(_) => false,
        }
    }

    /// Raw handle value, when the entry is a plain Vulkan handle.
    pub fn raw(&self) -> Option<u64> {
        match self {
            Self::Memory(h) => Some(h.as_raw()),
            Self::Buffer(h) => Some(h.as_raw()),
            Self::Image(h) => Some(h.as_raw()),
            Self::ImageView(h) => Some(h.as_raw()),
            Self::Semaphore(h) => Some(h.as_raw()),
            Self::Fence(h) => Some(h.as_raw()),
            Self::CommandPool(h) => Some(h.as_raw()),
            Self::CommandBuffer { buffer, .. } => Some(buffer.as_raw()),
            Self::RenderPass(h) => Some(h.as_raw()),
            Self::Framebuffer(h) => Some(h.as_raw()),
            Self::Swapchain(h) => Some(h.as_raw()),
            Self::Surface(h) => Some(h.as_raw()),
            Self::Allocation(_) | Self::Window(_) => None,
        }
    }
}

impl fmt::Debug for Destructible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw() {
            Some(raw) => write!(f, "{:?}({raw:#x})", self.kind()),
            None => write!(f, "{:?}", self.kind()),
        }
    }
}

macro_rules! impl_from_handle {
    ($($handle:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$handle> for Destructible {
                fn from(handle: $handle) -> Self {
                    Self::$variant(handle)
                }
            }
        )*
    };
}

impl_from_handle! {
    vk::DeviceMemory => Memory,
    Allocation => Allocation,
    vk::Buffer => Buffer,
    vk::Image => Image,
    vk::ImageView => ImageView,
    vk::Semaphore => Semaphore,
    vk::Fence => Fence,
    vk::CommandPool => CommandPool,
    vk::RenderPass => RenderPass,
    vk::Framebuffer => Framebuffer,
    vk::SwapchainKHR => Swapchain,
    vk::SurfaceKHR => Surface,
}

/// Proof that the GPU finished every frame that wrote into a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleToken {
    sub_index: usize,
}

impl CycleToken {
    /// Token for a bucket whose fence was just observed signaled.
    pub(crate) const fn observed(sub_index: usize) -> Self {
        Self { sub_index }
    }

    /// Token for a bucket without a fence observation.
    ///
    /// # Safety
    /// No GPU work that may still reference a handle in bucket `sub_index`
    /// can be pending, e.g. the device has been waited idle.
    pub const unsafe fn assume_completed(sub_index: usize) -> Self {
        Self { sub_index }
    }

    /// Bucket this token unlocks.
    pub const fn sub_index(self) -> usize {
        self.sub_index
    }
}

/// Performs the actual destruction of queued entries.
pub trait Destroyer {
    /// Destroy one entry.
    ///
    /// # Safety
    /// The resource must no longer be in use by the GPU.
    unsafe fn destroy(&mut self, resource: Destructible) -> Result<()>;
}

/// Ring of per-frame-slot deferred destruction lists.
pub struct DestructionQueue {
    buckets: Vec<Vec<Destructible>>,
    current: usize,
}

impl Default for DestructionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DestructionQueue {
    /// Create a queue with one bucket per frame in flight.
    pub fn new() -> Self {
        Self::with_buckets(FRAMES_IN_FLIGHT)
    }

    /// Create a queue with `bucket_count` buckets.
    ///
    /// Fewer buckets than frames in flight would release handles a pending
    /// frame still uses, so the count is raised to `FRAMES_IN_FLIGHT`.
    pub fn with_buckets(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(FRAMES_IN_FLIGHT);
        Self {
            buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
            current: 0,
        }
    }

    /// Queue a handle into the current bucket.
    ///
    /// Null handles are ignored with a warning.
    pub fn push(&mut self, resource: impl Into<Destructible>) {
        let resource = resource.into();
        if resource.is_null() {
            warn!(kind = ?resource.kind(), "Ignoring null handle queued for destruction");
            return;
        }
        self.buckets[self.current].push(resource);
    }

    /// Queue a command buffer that has to be freed through its pool.
    ///
    /// Both handles must be valid, or both null (ignored with a warning).
    pub fn push_dependent(
        &mut self,
        buffer: vk::CommandBuffer,
        pool: vk::CommandPool,
    ) -> Result<()> {
        match (is_null(buffer), is_null(pool)) {
            (false, false) => {
                self.buckets[self.current].push(Destructible::CommandBuffer { buffer, pool });
                Ok(())
            }
            (true, true) => {
                warn!("Ignoring null command buffer queued for destruction");
                Ok(())
            }
            (buffer_null, _) => Err(GpuError::InvalidState(format!(
                "Command buffer and pool must both be valid or both null (buffer null: {buffer_null}, pool null: {})",
                !buffer_null
            ))),
        }
    }

    /// Select the bucket for `frame` as the target of later pushes.
    pub fn next(&mut self, frame: u64) {
        self.current = (frame % self.buckets.len() as u64) as usize;
    }

    /// Index of the bucket receiving pushes.
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of entries waiting in one bucket.
    pub fn pending(&self, sub_index: usize) -> usize {
        self.buckets.get(sub_index).map_or(0, Vec::len)
    }

    /// Number of entries waiting across all buckets.
    pub fn pending_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Kinds of the entries waiting in one bucket, in push order.
    pub fn pending_kinds(&self, sub_index: usize) -> Vec<DestructibleKind> {
        self.buckets
            .get(sub_index)
            .map(|bucket| bucket.iter().map(Destructible::kind).collect())
            .unwrap_or_default()
    }

    /// Destroy every entry of the bucket unlocked by `token`, in push order.
    ///
    /// All entries are attempted; the first failure is returned. Returns the
    /// number of entries processed.
    pub fn clear<D: Destroyer + ?Sized>(
        &mut self,
        destroyer: &mut D,
        token: CycleToken,
    ) -> Result<usize> {
        let bucket = self.buckets.get_mut(token.sub_index).ok_or_else(|| {
            GpuError::InvalidState(format!(
                "Destruction bucket {} out of range",
                token.sub_index
            ))
        })?;

        let drained = std::mem::take(bucket);
        let count = drained.len();
        let mut first_error = None;

        for resource in drained {
            let kind = resource.kind();
            // SAFETY: the token proves the frame that queued this bucket finished.
            if let Err(e) = unsafe { destroyer.destroy(resource) } {
                error!(?kind, "Deferred destruction failed: {e}");
                first_error.get_or_insert(e);
            }
        }

        if count > 0 {
            debug!(bucket = token.sub_index, count, "Cleared destruction bucket");
        }

        first_error.map_or(Ok(count), Err)
    }

    /// Destroy everything in every bucket.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn clear_all<D: Destroyer + ?Sized>(&mut self, destroyer: &mut D) -> Result<usize> {
        let mut total = 0;
        let mut first_error = None;
        for sub_index in 0..self.buckets.len() {
            // SAFETY: the caller guarantees the device is idle.
            let token = unsafe { CycleToken::assume_completed(sub_index) };
            match self.clear(destroyer, token) {
                Ok(count) => total += count,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(total), Err)
    }
}

impl Drop for DestructionQueue {
    fn drop(&mut self) {
        let pending = self.pending_count();
        if pending > 0 {
            warn!(pending, "Destruction queue dropped with pending entries; handles leaked");
        }
    }
}

/// Destroys queued entries through the Vulkan API.
pub struct VulkanDestroyer<'a> {
    device: &'a ash::Device,
    allocator: Option<&'a Mutex<GpuAllocator>>,
    swapchain_loader: Option<&'a ash::khr::swapchain::Device>,
    surface_loader: Option<&'a ash::khr::surface::Instance>,
}

impl<'a> VulkanDestroyer<'a> {
    /// Destroyer able to release device-level handles.
    pub fn new(device: &'a ash::Device) -> Self {
        Self {
            device,
            allocator: None,
            swapchain_loader: None,
            surface_loader: None,
        }
    }

    /// Also release gpu-allocator allocations.
    pub fn with_allocator(mut self, allocator: &'a Mutex<GpuAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Also release swapchains.
    pub fn with_swapchain_loader(mut self, loader: &'a ash::khr::swapchain::Device) -> Self {
        self.swapchain_loader = Some(loader);
        self
    }

    /// Also release surfaces.
    pub fn with_surface_loader(mut self, loader: &'a ash::khr::surface::Instance) -> Self {
        self.surface_loader = Some(loader);
        self
    }
}

fn missing(what: &str) -> GpuError {
    GpuError::InvalidState(format!("Destroyer has no {what}"))
}

impl Destroyer for VulkanDestroyer<'_> {
    unsafe fn destroy(&mut self, resource: Destructible) -> Result<()> {
        let device = self.device;
        // SAFETY: the caller guarantees the resource is no longer in use.
        unsafe {
            match resource {
                Destructible::Memory(memory) => device.free_memory(memory, None),
                Destructible::Allocation(allocation) => self
                    .allocator
                    .ok_or_else(|| missing("allocator"))?
                    .lock()
                    .free_allocation(allocation)?,
                Destructible::Buffer(buffer) => device.destroy_buffer(buffer, None),
                Destructible::Image(image) => device.destroy_image(image, None),
                Destructible::ImageView(view) => device.destroy_image_view(view, None),
                Destructible::Semaphore(semaphore) => device.destroy_semaphore(semaphore, None),
                Destructible::Fence(fence) => device.destroy_fence(fence, None),
                Destructible::CommandPool(pool) => device.destroy_command_pool(pool, None),
                Destructible::CommandBuffer { buffer, pool } => {
                    device.free_command_buffers(pool, &[buffer]);
                }
                Destructible::RenderPass(pass) => device.destroy_render_pass(pass, None),
                Destructible::Framebuffer(framebuffer) => {
                    device.destroy_framebuffer(framebuffer, None);
                }
                Destructible::Swapchain(swapchain) => self
                    .swapchain_loader
                    .ok_or_else(|| missing("swapchain loader"))?
                    .destroy_swapchain(swapchain, None),
                Destructible::Surface(surface) => self
                    .surface_loader
                    .ok_or_else(|| missing("surface loader"))?
                    .destroy_surface(surface, None),
                Destructible::Window(window) => drop(window),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records what it was asked to destroy.
    #[derive(Default)]
    pub(crate) struct RecordingDestroyer {
        pub destroyed: Vec<(DestructibleKind, Option<u64>)>,
        pub fail_on: Option<DestructibleKind>,
    }

    impl Destroyer for RecordingDestroyer {
        unsafe fn destroy(&mut self, resource: Destructible) -> Result<()> {
            let kind = resource.kind();
            self.destroyed.push((kind, resource.raw()));
            if self.fail_on == Some(kind) {
                return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
            }
            Ok(())
        }
    }

    fn token(sub_index: usize) -> CycleToken {
        CycleToken::observed(sub_index)
    }

    #[test]
    fn clear_destroys_bucket_exactly_once() {
        let mut queue = DestructionQueue::new();
        let mut destroyer = RecordingDestroyer::default();

        queue.next(1);
        queue.push(vk::Buffer::from_raw(7));
        assert_eq!(queue.pending(1), 1);

        assert_eq!(queue.clear(&mut destroyer, token(1)).unwrap(), 1);
        assert_eq!(
            destroyer.destroyed,
            vec![(DestructibleKind::Buffer, Some(7))]
        );
        assert_eq!(queue.pending(1), 0);

        // A second clear of the same bucket has nothing left to destroy.
        assert_eq!(queue.clear(&mut destroyer, token(1)).unwrap(), 0);
        assert_eq!(destroyer.destroyed.len(), 1);
    }

    #[test]
    fn clearing_another_bucket_leaves_entry_untouched() {
        let mut queue = DestructionQueue::new();
        let mut destroyer = RecordingDestroyer::default();

        let k = 0;
        queue.next(k as u64);
        queue.push(vk::Image::from_raw(3));

        let other = (k + 1) % queue.bucket_count();
        assert_eq!(queue.clear(&mut destroyer, token(other)).unwrap(), 0);
        assert!(destroyer.destroyed.is_empty());
        assert_eq!(queue.pending(k), 1);

        queue.clear(&mut destroyer, token(k)).unwrap();
    }

    #[test]
    fn entries_are_destroyed_in_push_order() {
        let mut queue = DestructionQueue::new();
        let mut destroyer = RecordingDestroyer::default();

        queue.push(vk::Framebuffer::from_raw(1));
        queue.push(vk::RenderPass::from_raw(2));
        queue.push(vk::ImageView::from_raw(3));
        queue.push(vk::Image::from_raw(4));
        queue.push(vk::SwapchainKHR::from_raw(5));

        queue.clear(&mut destroyer, token(0)).unwrap();

        let kinds: Vec<_> = destroyer.destroyed.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                DestructibleKind::Framebuffer,
                DestructibleKind::RenderPass,
                DestructibleKind::ImageView,
                DestructibleKind::Image,
                DestructibleKind::Swapchain,
            ]
        );
    }

    #[test]
    fn null_handles_are_ignored() {
        let mut queue = DestructionQueue::new();
        queue.push(vk::Fence::null());
        queue.push(vk::Semaphore::null());
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn dependent_handles_must_match() {
        let mut queue = DestructionQueue::new();
        let buffer = vk::CommandBuffer::from_raw(11);
        let pool = vk::CommandPool::from_raw(12);

        assert!(matches!(
            queue.push_dependent(buffer, vk::CommandPool::null()),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            queue.push_dependent(vk::CommandBuffer::null(), pool),
            Err(GpuError::InvalidState(_))
        ));
        assert_eq!(queue.pending_count(), 0);

        queue
            .push_dependent(vk::CommandBuffer::null(), vk::CommandPool::null())
            .unwrap();
        assert_eq!(queue.pending_count(), 0);

        queue.push_dependent(buffer, pool).unwrap();
        assert_eq!(queue.pending_kinds(0), vec![DestructibleKind::CommandBuffer]);

        let mut destroyer = RecordingDestroyer::default();
        queue.clear(&mut destroyer, token(0)).unwrap();
    }

    #[test]
    fn next_selects_bucket_by_frame() {
        let mut queue = DestructionQueue::new();
        for frame in 0..6u64 {
            queue.next(frame);
            assert_eq!(queue.current_index(), (frame % FRAMES_IN_FLIGHT as u64) as usize);
            queue.push(vk::Fence::from_raw(frame + 1));
        }
        assert_eq!(queue.pending(0), 3);
        assert_eq!(queue.pending(1), 3);

        let mut destroyer = RecordingDestroyer::default();
        let cleared = unsafe { queue.clear_all(&mut destroyer) }.unwrap();
        assert_eq!(cleared, 6);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn bucket_count_never_drops_below_frames_in_flight() {
        assert_eq!(DestructionQueue::with_buckets(1).bucket_count(), FRAMES_IN_FLIGHT);
        assert_eq!(DestructionQueue::with_buckets(5).bucket_count(), 5);
    }

    #[test]
    fn failing_entry_does_not_stop_the_rest() {
        let mut queue = DestructionQueue::new();
        let mut destroyer = RecordingDestroyer {
            fail_on: Some(DestructibleKind::Semaphore),
            ..Default::default()
        };

        queue.push(vk::Semaphore::from_raw(1));
        queue.push(vk::Fence::from_raw(2));

        let result = queue.clear(&mut destroyer, token(0));
        assert!(matches!(
            result,
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert_eq!(destroyer.destroyed.len(), 2);
        assert_eq!(queue.pending(0), 0);
    }

    #[test]
    fn window_entries_are_dropped_on_clear() {
        let window = Arc::new(());
        let mut queue = DestructionQueue::new();
        queue.push(Destructible::Window(Box::new(Arc::clone(&window))));
        assert_eq!(Arc::strong_count(&window), 2);

        let mut destroyer = RecordingDestroyer::default();
        queue.clear(&mut destroyer, token(0)).unwrap();
        assert_eq!(Arc::strong_count(&window), 1);
    }

    #[test]
    fn out_of_range_token_is_rejected() {
        let mut queue = DestructionQueue::new();
        let mut destroyer = RecordingDestroyer::default();
        assert!(queue.clear(&mut destroyer, token(99)).is_err());
    }
}
