//! Swapchain management.
//!
//! A [`Swapchain`] owns the presentable images of one surface together with
//! everything that depends on them: image views, the MSAA color and depth
//! targets, the forward render pass and one framebuffer per image. It also
//! owns the per-slot synchronization objects and drives the
//! acquire → record → present cycle.
//!
//! Every frame slot owns:
//! - an image-available semaphore, signaled by the acquire and waited by the
//!   submission,
//! - an acquire fence, signaled by the acquire and waited by `present`,
//! - an in-flight fence, signaled by the frame's submission and waited before
//!   the slot is reused.
//!
//! After presenting, the swapchain advances to the next slot, waits for that
//! slot's in-flight fence and clears the destruction bucket the fence
//! protects.

use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use tetrad_core::constants::{FRAMES_IN_FLIGHT, WAIT_FOREVER_NS};
use tracing::{debug, info, warn};

use crate::context::GpuContext;
use crate::destruction::{is_null, CycleToken, DestructionQueue, Destroyer};
use crate::error::{GpuError, Result};
use crate::frame::{FrameCycle, SlotImage};
use crate::framebuffer::Framebuffer;
use crate::image::{create_image_view, AttachmentImage};
use crate::memory::GpuAllocator;
use crate::render_pass::{ForwardPassLayout, RenderPass};
use crate::surface::{SurfaceContext, SurfaceSupport};
use crate::sync::{Fence, Semaphore, SemaphoreIds};

/// Options picked by the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapchainOptions {
    /// Force FIFO presentation.
    pub vsync: bool,
}

/// Number of images to request: one more than the surface minimum, clamped
/// to the maximum when the surface has one.
pub fn eval_min_image_count(min_image_count: u32, max_image_count: u32) -> u32 {
    let count = min_image_count + 1;
    if max_image_count > 0 {
        count.min(max_image_count)
    } else {
        count
    }
}

/// Select the surface format.
///
/// Prefers `B8G8R8A8_SRGB` with `SRGB_NONLINEAR`, otherwise the first entry.
/// `None` only when the list is empty.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = available.iter().find(|format| {
        format.format == vk::Format::B8G8R8A8_SRGB
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });

    match preferred {
        Some(format) => Some(*format),
        None => {
            let fallback = available.first().copied()?;
            warn!(
                format = ?fallback.format,
                color_space = ?fallback.color_space,
                "B8G8R8A8_SRGB/SRGB_NONLINEAR unavailable, falling back to first surface format"
            );
            Some(fallback)
        }
    }
}

/// Select the present mode.
///
/// MAILBOX when available and vsync is off, FIFO otherwise (always supported).
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Identity when supported, the current transform otherwise.
pub fn select_pre_transform(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::SurfaceTransformFlagsKHR {
    if capabilities
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        capabilities.current_transform
    }
}

/// Opaque when supported, otherwise the first mode the surface offers.
pub fn select_composite_alpha(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&mode| capabilities.supported_composite_alpha.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Whether another image may be acquired while `held` are already held.
///
/// Holding more than `image_count - min_image_count` images lets an
/// unbounded acquire block forever.
pub fn can_acquire_ahead(held: usize, image_count: u32, min_image_count: u32) -> bool {
    held as u32 <= image_count.saturating_sub(min_image_count)
}

/// Everything chosen for one swapchain generation.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    /// Images requested at creation.
    pub image_count: u32,
    /// Surface minimum, bounds how many images may be held at once.
    pub min_image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub msaa_samples: vk::SampleCountFlags,
    pub depth_format: vk::Format,
}

impl SwapchainConfig {
    /// Choose a configuration for `support`.
    ///
    /// `previous` is the surface format of the generation being replaced; it
    /// is kept when the surface still offers it.
    pub fn choose(
        support: &SurfaceSupport,
        desired: vk::Extent2D,
        options: SwapchainOptions,
        msaa_samples: vk::SampleCountFlags,
        depth_format: vk::Format,
        previous: Option<vk::SurfaceFormatKHR>,
    ) -> Result<Self> {
        let kept = previous.filter(|prev| {
            support
                .formats
                .iter()
                .any(|f| f.format == prev.format && f.color_space == prev.color_space)
        });
        let surface_format = match kept {
            Some(format) => format,
            None => select_surface_format(&support.formats).ok_or_else(|| {
                GpuError::SwapchainCreation("Surface reports no formats".to_string())
            })?,
        };

        let caps = &support.capabilities;
        let extent = calculate_extent(caps, desired);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::SwapchainCreation(format!(
                "Zero-sized extent {}x{}",
                extent.width, extent.height
            )));
        }

        Ok(Self {
            surface_format,
            present_mode: select_present_mode(&support.present_modes, options.vsync),
            extent,
            image_count: eval_min_image_count(caps.min_image_count, caps.max_image_count),
            min_image_count: caps.min_image_count,
            pre_transform: select_pre_transform(caps),
            composite_alpha: select_composite_alpha(caps),
            msaa_samples,
            depth_format,
        })
    }

    /// Attachment layout of the forward pass for this configuration.
    pub fn pass_layout(&self) -> ForwardPassLayout {
        ForwardPassLayout::new(
            self.surface_format.format,
            self.depth_format,
            self.msaa_samples,
        )
    }
}

/// Result of a present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// The surface changed; nothing more can be presented until recreation.
    OutOfDate,
}

impl PresentStatus {
    /// Whether the swapchain should be recreated.
    pub fn needs_recreate(self) -> bool {
        self != Self::Optimal
    }
}

/// Cached present parameters of one swapchain image.
#[derive(Debug, Clone, Copy)]
pub struct PresentTarget {
    pub swapchain: vk::SwapchainKHR,
    pub wait_semaphore: vk::Semaphore,
}

/// Handles needed to record and submit one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameTarget {
    /// Frame slot being recorded.
    pub slot: usize,
    pub image_index: u32,
    pub framebuffer: vk::Framebuffer,
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
    /// Wait on this before writing color.
    pub image_available: vk::Semaphore,
    /// Signal this for the present to wait on.
    pub render_finished: vk::Semaphore,
    /// Signal this from the frame's submission.
    pub in_flight: vk::Fence,
}

/// Swapchain handle plus everything built on its images.
///
/// Image count, view count and framebuffer count are equal once populated.
struct Generation {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    /// One multisampled target per image, empty without MSAA.
    color: Vec<AttachmentImage>,
    depth: Vec<AttachmentImage>,
    render_pass: Option<RenderPass>,
    framebuffers: Vec<Framebuffer>,
}

impl Generation {
    fn new(handle: vk::SwapchainKHR) -> Self {
        Self {
            handle,
            images: Vec::new(),
            views: Vec::new(),
            color: Vec::new(),
            depth: Vec::new(),
            render_pass: None,
            framebuffers: Vec::new(),
        }
    }

    /// Create views, targets, the pass and framebuffers for the images.
    unsafe fn populate(
        &mut self,
        device: &ash::Device,
        allocator: &Mutex<GpuAllocator>,
        loader: &ash::khr::swapchain::Device,
        config: &SwapchainConfig,
    ) -> Result<()> {
        self.images = unsafe { loader.get_swapchain_images(self.handle)? };

        let layout = config.pass_layout();
        let render_pass = unsafe { RenderPass::new(device, layout)? };
        let pass_handle = render_pass.handle();
        self.render_pass = Some(render_pass);

        let format = config.surface_format.format;
        for &image in &self.images {
            let view =
                unsafe { create_image_view(device, image, format, vk::ImageAspectFlags::COLOR)? };
            self.views.push(view);

            let color_view = if layout.is_multisampled() {
                let color = unsafe {
                    AttachmentImage::color(
                        device,
                        allocator,
                        config.extent,
                        format,
                        config.msaa_samples,
                    )?
                };
                let color_view = color.view;
                self.color.push(color);
                Some(color_view)
            } else {
                None
            };

            let depth = unsafe {
                AttachmentImage::depth(
                    device,
                    allocator,
                    config.extent,
                    config.depth_format,
                    config.msaa_samples,
                )?
            };
            let depth_view = depth.view;
            self.depth.push(depth);

            let attachments = layout.framebuffer_attachments(view, color_view, depth_view)?;
            let framebuffer =
                unsafe { Framebuffer::new(device, pass_handle, &attachments, config.extent)? };
            self.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Take the swapchain handle, leaving null behind.
    fn take_handle(&mut self) -> vk::SwapchainKHR {
        std::mem::take(&mut self.handle)
    }

    /// Relay everything except the swapchain handle.
    fn relay_dependents(&mut self, queue: &mut DestructionQueue) {
        for framebuffer in &mut self.framebuffers {
            framebuffer.relay(queue);
        }
        self.framebuffers.clear();
        if let Some(mut render_pass) = self.render_pass.take() {
            render_pass.relay(queue);
        }
        for mut attachment in self.color.drain(..).chain(self.depth.drain(..)) {
            attachment.relay(queue);
        }
        for view in self.views.drain(..) {
            queue.push(view);
        }
        // Owned by the swapchain handle.
        self.images.clear();
    }

    /// Whether nothing is left to release.
    fn is_released(&self) -> bool {
        is_null(self.handle)
            && self.images.is_empty()
            && self.views.is_empty()
            && self.color.is_empty()
            && self.depth.is_empty()
            && self.render_pass.is_none()
            && self.framebuffers.is_empty()
    }

    /// Relay everything, dependents first.
    fn relay(&mut self, queue: &mut DestructionQueue) {
        self.relay_dependents(queue);
        let handle = self.take_handle();
        if !is_null(handle) {
            queue.push(handle);
        }
    }

    /// Destroy everything now, dependents first.
    unsafe fn destroy_now(
        &mut self,
        device: &ash::Device,
        allocator: &Mutex<GpuAllocator>,
        loader: &ash::khr::swapchain::Device,
    ) -> Result<()> {
        let mut first_error = None;
        unsafe {
            for mut framebuffer in self.framebuffers.drain(..) {
                framebuffer.destroy(device, None);
            }
            if let Some(mut render_pass) = self.render_pass.take() {
                render_pass.destroy(device, None);
            }
            for mut attachment in self.color.drain(..).chain(self.depth.drain(..)) {
                if let Err(e) = attachment.destroy(device, allocator, None) {
                    warn!("Failed to free swapchain attachment: {e}");
                    first_error.get_or_insert(e);
                }
            }
            for view in self.views.drain(..) {
                device.destroy_image_view(view, None);
            }
            self.images.clear();

            let handle = self.take_handle();
            if !is_null(handle) {
                loader.destroy_swapchain(handle, None);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Synchronization objects of one frame slot.
struct FrameSlot {
    image_available: Semaphore,
    acquire_fence: Fence,
    in_flight: Fence,
}

impl FrameSlot {
    unsafe fn new(device: &Arc<ash::Device>, ids: &mut SemaphoreIds) -> Result<Self> {
        let mut image_available = unsafe { Semaphore::binary(device.clone(), ids)? };
        let mut acquire_fence = match unsafe { Fence::create(device.clone(), false) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { image_available.destroy(None) };
                return Err(e);
            }
        };
        // Signaled so the first wait on an unused slot returns at once.
        let in_flight = match unsafe { Fence::create(device.clone(), true) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    image_available.destroy(None);
                    acquire_fence.destroy(None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            image_available,
            acquire_fence,
            in_flight,
        })
    }

    unsafe fn destroy(&mut self, queue: Option<&mut DestructionQueue>) {
        let mut queue = queue;
        unsafe {
            self.image_available.destroy(queue.as_deref_mut());
            self.acquire_fence.destroy(queue.as_deref_mut());
            self.in_flight.destroy(queue);
        }
    }
}

/// Swapchain wrapper.
pub struct Swapchain {
    device: Arc<ash::Device>,
    loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    options: SwapchainOptions,
    config: SwapchainConfig,
    generation: Generation,
    /// Render-finished semaphore per image.
    present_semaphores: Vec<Semaphore>,
    present_targets: Vec<PresentTarget>,
    slots: Vec<FrameSlot>,
    cycle: FrameCycle,
    /// Set between an acquire and its present.
    recording: bool,
    needs_recreate: bool,
}

impl Swapchain {
    /// Create a swapchain for `surface`.
    ///
    /// `old_swapchain` is handed to the driver for a seamless handoff; the
    /// caller still destroys it afterwards.
    ///
    /// # Safety
    /// The GPU and surface contexts must be valid.
    pub unsafe fn create(
        gpu: &GpuContext,
        surface: &SurfaceContext,
        extent: vk::Extent2D,
        options: SwapchainOptions,
        ids: &mut SemaphoreIds,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let support = unsafe { surface.support(gpu)? };
        let config = SwapchainConfig::choose(
            &support,
            extent,
            options,
            gpu.msaa_samples(),
            gpu.depth_format(),
            None,
        )?;
        let loader = surface.swapchain_loader().clone();
        let generation = unsafe {
            create_generation(gpu, &loader, surface.handle(), &config, old_swapchain.unwrap_or_default())?
        };

        let mut swapchain = Self {
            device: gpu.shared_device(),
            loader,
            surface: surface.handle(),
            options,
            config,
            generation,
            present_semaphores: Vec::new(),
            present_targets: Vec::new(),
            slots: Vec::new(),
            cycle: FrameCycle::new(),
            recording: false,
            needs_recreate: false,
        };

        if let Err(e) = unsafe { swapchain.create_sync_objects(ids) } {
            // Nothing has been submitted yet.
            unsafe { swapchain.destroy(gpu, None)? };
            return Err(e);
        }

        swapchain.log_created("Swapchain created");
        Ok(swapchain)
    }

    fn log_created(&self, message: &str) {
        info!(
            format = ?self.config.surface_format.format,
            present_mode = ?self.config.present_mode,
            width = self.config.extent.width,
            height = self.config.extent.height,
            images = self.generation.image_count(),
            samples = self.config.msaa_samples.as_raw(),
            "{message}"
        );
    }

    unsafe fn create_sync_objects(&mut self, ids: &mut SemaphoreIds) -> Result<()> {
        for _ in 0..FRAMES_IN_FLIGHT {
            let slot = unsafe { FrameSlot::new(&self.device, ids)? };
            self.slots.push(slot);
        }
        for _ in 0..self.generation.image_count() {
            let semaphore = unsafe { Semaphore::binary(self.device.clone(), ids)? };
            self.present_semaphores.push(semaphore);
        }
        self.rebuild_present_targets();
        Ok(())
    }

    fn rebuild_present_targets(&mut self) {
        let swapchain = self.generation.handle;
        self.present_targets = self
            .present_semaphores
            .iter()
            .map(|semaphore| PresentTarget {
                swapchain,
                wait_semaphore: semaphore.handle(),
            })
            .collect();
    }

    /// Raw swapchain handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.generation.handle
    }

    /// Configuration of the current generation.
    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    /// Presentable image format.
    pub fn format(&self) -> vk::Format {
        self.config.surface_format.format
    }

    /// Depth attachment format.
    pub fn depth_format(&self) -> vk::Format {
        self.config.depth_format
    }

    /// Image size.
    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    /// Number of swapchain images.
    pub fn image_count(&self) -> usize {
        self.generation.image_count()
    }

    /// Number of framebuffers, one per image.
    pub fn framebuffer_count(&self) -> usize {
        self.generation.framebuffers.len()
    }

    /// Forward render pass.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.generation
            .render_pass
            .as_ref()
            .map_or_else(vk::RenderPass::null, RenderPass::handle)
    }

    /// Attachment layout of the forward pass.
    pub fn pass_layout(&self) -> ForwardPassLayout {
        self.config.pass_layout()
    }

    /// Slot of the frame being recorded.
    pub fn current_slot(&self) -> usize {
        self.cycle.current()
    }

    /// Frames presented so far.
    pub fn frame(&self) -> u64 {
        self.cycle.frame()
    }

    /// Whether an acquire or present reported a mismatch with the surface.
    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }

    /// Present parameters cached for `image_index`.
    pub fn present_target(&self, image_index: u32) -> Option<PresentTarget> {
        self.present_targets.get(image_index as usize).copied()
    }

    unsafe fn acquire_raw(&self, slot: usize, timeout_ns: u64) -> VkResult<(u32, bool)> {
        let sync = &self.slots[slot];
        unsafe {
            self.loader.acquire_next_image(
                self.generation.handle,
                timeout_ns,
                sync.image_available.handle(),
                sync.acquire_fence.handle(),
            )
        }
    }

    /// Record an acquire into `slot`; returns whether the slot kept the image.
    ///
    /// A suboptimal image is dropped: the acquire fence is settled so the
    /// slot holds no pending acquire, and the swapchain is flagged for
    /// recreation. The slot's semaphore stays signaled until the recreation
    /// replaces it.
    unsafe fn record_acquired(&mut self, slot: usize, index: u32, suboptimal: bool) -> Result<bool> {
        match self.cycle.record_acquired(slot, index, suboptimal)? {
            SlotImage::Acquired { .. } => Ok(true),
            SlotImage::None => {
                debug!(slot, index, "Acquired suboptimal swapchain image, dropping it");
                self.needs_recreate = true;
                let fence = &self.slots[slot].acquire_fence;
                unsafe {
                    fence.wait(WAIT_FOREVER_NS)?.signaled()?;
                    fence.reset()?;
                }
                Ok(false)
            }
        }
    }

    /// Make sure the current slot holds an image and return the frame's handles.
    ///
    /// Waits for the slot's previous submission first. Returns `None` when
    /// the swapchain has to be recreated before the slot can acquire: the
    /// acquire was suboptimal, or an earlier result flagged recreation.
    /// `ERROR_OUT_OF_DATE_KHR` is returned as [`GpuError::Vulkan`]; the caller
    /// recreates the swapchain.
    ///
    /// # Safety
    /// The swapchain must be valid.
    pub unsafe fn acquire_next_image(&mut self) -> Result<Option<FrameTarget>> {
        if self.recording {
            return Err(GpuError::InvalidState(
                "Frame acquired twice without a present".to_string(),
            ));
        }
        if self.slots.is_empty() {
            if self.needs_recreate {
                return Ok(None);
            }
            return Err(GpuError::InvalidState("Swapchain was destroyed".to_string()));
        }

        let slot = self.cycle.current();
        unsafe { self.slots[slot].in_flight.wait(WAIT_FOREVER_NS)? }.signaled()?;

        if self.cycle.needs_acquire(slot) {
            // The slot's semaphore may still carry a dropped acquire.
            if self.needs_recreate {
                return Ok(None);
            }
            let (index, suboptimal) = unsafe { self.acquire_raw(slot, WAIT_FOREVER_NS)? };
            if !unsafe { self.record_acquired(slot, index, suboptimal)? } {
                return Ok(None);
            }
        }

        if !self.needs_recreate {
            unsafe { self.acquire_ahead()? };
        }

        unsafe { self.slots[slot].in_flight.reset()? };
        self.recording = true;
        self.frame_target(slot).map(Some)
    }

    /// Start acquiring the next slot's image when that cannot block.
    unsafe fn acquire_ahead(&mut self) -> Result<()> {
        let next = self.cycle.next();
        if next == self.cycle.current() || !self.cycle.needs_acquire(next) {
            return Ok(());
        }
        let held = self.cycle.held_slots().count();
        if !can_acquire_ahead(
            held,
            self.generation.image_count() as u32,
            self.config.min_image_count,
        ) {
            return Ok(());
        }
        // The previous submission of that slot may still wait on its semaphore.
        if !unsafe { self.slots[next].in_flight.is_signaled()? } {
            return Ok(());
        }

        match unsafe { self.acquire_raw(next, 0) } {
            Ok((index, suboptimal)) => {
                unsafe { self.record_acquired(next, index, suboptimal)? };
                Ok(())
            }
            Err(vk::Result::NOT_READY | vk::Result::TIMEOUT) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.needs_recreate = true;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn frame_target(&self, slot: usize) -> Result<FrameTarget> {
        let index = match self.cycle.image(slot) {
            SlotImage::Acquired { index } => index,
            SlotImage::None => {
                return Err(GpuError::InvalidState(format!(
                    "Frame slot {slot} holds no image"
                )))
            }
        };
        let framebuffer = self
            .generation
            .framebuffers
            .get(index as usize)
            .ok_or_else(|| GpuError::InvalidState(format!("No framebuffer for image {index}")))?;
        let render_finished = self
            .present_semaphores
            .get(index as usize)
            .ok_or_else(|| GpuError::InvalidState(format!("No semaphore for image {index}")))?;
        let sync = &self.slots[slot];

        Ok(FrameTarget {
            slot,
            image_index: index,
            framebuffer: framebuffer.handle(),
            render_pass: self.render_pass(),
            extent: self.config.extent,
            image_available: sync.image_available.handle(),
            render_finished: render_finished.handle(),
            in_flight: sync.in_flight.handle(),
        })
    }

    /// Present the current slot's image and advance to the next slot.
    ///
    /// Afterwards the new slot's in-flight fence has been observed signaled
    /// and the destruction bucket it protects is cleared through `destroyer`.
    ///
    /// # Safety
    /// The frame's submission must signal the target's render-finished
    /// semaphore and in-flight fence.
    pub unsafe fn present<D: Destroyer + ?Sized>(
        &mut self,
        queue: vk::Queue,
        deletion: &mut DestructionQueue,
        destroyer: &mut D,
    ) -> Result<PresentStatus> {
        if !self.recording {
            return Err(GpuError::InvalidState(
                "Present without an acquired frame".to_string(),
            ));
        }
        let index = self.cycle.begin_present()?;
        let target = self
            .present_target(index)
            .ok_or_else(|| GpuError::InvalidState(format!("No present target for image {index}")))?;

        let wait_semaphores = [target.wait_semaphore];
        let swapchains = [target.swapchain];
        let image_indices = [index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        self.recording = false;
        let status = match result {
            Ok(false) => PresentStatus::Optimal,
            Ok(true) => PresentStatus::Suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => PresentStatus::OutOfDate,
            Err(e) => return Err(e.into()),
        };
        if status.needs_recreate() {
            self.needs_recreate = true;
        }

        let slot = &self.slots[self.cycle.current()];
        unsafe { slot.acquire_fence.wait(WAIT_FOREVER_NS)? }.signaled()?;
        unsafe { slot.acquire_fence.reset()? };

        self.cycle.finish_present();
        deletion.next(self.cycle.frame());

        let next = &self.slots[self.cycle.current()];
        unsafe { next.in_flight.wait(WAIT_FOREVER_NS)? }.signaled()?;
        // Every frame that wrote into the current bucket finished no later
        // than the submission that signaled this fence.
        let bucket = deletion.current_index();
        deletion.clear(destroyer, CycleToken::observed(bucket))?;

        Ok(status)
    }

    /// Recreate for a new extent on the same surface.
    ///
    /// # Safety
    /// The GPU and surface contexts must be valid.
    pub unsafe fn resize(
        &mut self,
        gpu: &GpuContext,
        surface: &SurfaceContext,
        extent: vk::Extent2D,
        ids: &mut SemaphoreIds,
        deletion: &mut DestructionQueue,
    ) -> Result<()> {
        if surface.handle() != self.surface {
            return Err(GpuError::InvalidState(
                "Resize must use the swapchain's own surface".to_string(),
            ));
        }
        unsafe { self.recreate(gpu, surface, extent, ids, deletion) }
    }

    /// Recreate on a (possibly) different surface.
    ///
    /// # Safety
    /// The GPU and surface contexts must be valid. The previous surface must
    /// outlive the relayed swapchain handle.
    pub unsafe fn relocate(
        &mut self,
        gpu: &GpuContext,
        surface: &SurfaceContext,
        extent: vk::Extent2D,
        ids: &mut SemaphoreIds,
        deletion: &mut DestructionQueue,
    ) -> Result<()> {
        unsafe { self.recreate(gpu, surface, extent, ids, deletion) }
    }

    /// Rebuild the generation and the sync objects.
    ///
    /// On failure the swapchain is left empty with `needs_recreate` set, so
    /// a later call can retry from scratch.
    unsafe fn recreate(
        &mut self,
        gpu: &GpuContext,
        surface: &SurfaceContext,
        extent: vk::Extent2D,
        ids: &mut SemaphoreIds,
        deletion: &mut DestructionQueue,
    ) -> Result<()> {
        self.needs_recreate = true;
        gpu.wait_idle()?;
        let held: Vec<usize> = self.cycle.held_slots().collect();
        for slot in held {
            unsafe { self.slots[slot].acquire_fence.wait(WAIT_FOREVER_NS)? }.signaled()?;
        }

        let support = unsafe { surface.support(gpu)? };
        let config = SwapchainConfig::choose(
            &support,
            extent,
            self.options,
            self.config.msaa_samples,
            self.config.depth_format,
            Some(self.config.surface_format),
        )?;

        self.generation.relay_dependents(deletion);
        for semaphore in &mut self.present_semaphores {
            semaphore.relay(deletion);
        }
        self.present_semaphores.clear();
        self.present_targets.clear();
        for mut slot in self.slots.drain(..) {
            unsafe { slot.destroy(Some(&mut *deletion)) };
        }
        self.cycle.reset();
        self.recording = false;

        let same_surface = surface.handle() == self.surface;
        let old = self.generation.take_handle();
        let created = unsafe {
            create_generation(
                gpu,
                &self.loader,
                surface.handle(),
                &config,
                if same_surface { old } else { vk::SwapchainKHR::null() },
            )
        };
        // Retired either way; destroyed after the new handle exists.
        if !is_null(old) {
            deletion.push(old);
        }
        self.generation = created?;

        if let Err(e) = unsafe { self.create_sync_objects(ids) } {
            for mut slot in self.slots.drain(..) {
                unsafe { slot.destroy(Some(&mut *deletion)) };
            }
            for mut semaphore in self.present_semaphores.drain(..) {
                semaphore.relay(deletion);
            }
            self.present_targets.clear();
            self.generation.relay(deletion);
            return Err(e);
        }

        self.config = config;
        self.surface = surface.handle();
        self.needs_recreate = false;
        self.log_created("Swapchain recreated");
        Ok(())
    }

    /// Destroy the swapchain now, or relay it through `queue`.
    ///
    /// Calling this again afterwards does nothing.
    ///
    /// # Safety
    /// Without a queue the device must be idle.
    pub unsafe fn destroy(
        &mut self,
        gpu: &GpuContext,
        queue: Option<&mut DestructionQueue>,
    ) -> Result<()> {
        let mut queue = queue;
        for mut slot in self.slots.drain(..) {
            unsafe { slot.destroy(queue.as_deref_mut()) };
        }
        for mut semaphore in self.present_semaphores.drain(..) {
            unsafe { semaphore.destroy(queue.as_deref_mut()) };
        }
        self.present_targets.clear();
        self.cycle.reset();
        self.recording = false;

        match queue {
            Some(queue) => {
                self.generation.relay(queue);
                Ok(())
            }
            None => unsafe {
                self.generation
                    .destroy_now(&self.device, gpu.allocator(), &self.loader)
            },
        }
    }

    /// Whether the swapchain has been destroyed or relayed.
    pub fn is_destroyed(&self) -> bool {
        self.generation.is_released() && self.slots.is_empty() && self.present_semaphores.is_empty()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if !is_null(self.generation.handle) {
            warn!("Swapchain dropped without being destroyed; potential leak");
        }
    }
}

unsafe fn create_generation(
    gpu: &GpuContext,
    loader: &ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    config: &SwapchainConfig,
    old_swapchain: vk::SwapchainKHR,
) -> Result<Generation> {
    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(config.image_count)
        .image_format(config.surface_format.format)
        .image_color_space(config.surface_format.color_space)
        .image_extent(config.extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(config.pre_transform)
        .composite_alpha(config.composite_alpha)
        .present_mode(config.present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let handle = unsafe { loader.create_swapchain(&create_info, None) }
        .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

    let mut generation = Generation::new(handle);
    if let Err(e) = unsafe { generation.populate(gpu.device(), gpu.allocator(), loader, config) } {
        unsafe { generation.destroy_now(gpu.device(), gpu.allocator(), loader)? };
        return Err(e);
    }
    Ok(generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destruction::DestructibleKind;
    use crate::memory::GpuImage;
    use ash::vk::Handle;

    fn support(formats: Vec<vk::SurfaceFormatKHR>, width: u32, height: u32) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: vk::Extent2D { width, height },
                supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                ..Default::default()
            },
            formats,
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn image_count_is_one_above_minimum_within_bounds() {
        assert_eq!(eval_min_image_count(2, 3), 3);
        assert_eq!(eval_min_image_count(2, 2), 2);
        assert_eq!(eval_min_image_count(3, 0), 4);
        assert_eq!(eval_min_image_count(1, 8), 2);
    }

    #[test]
    fn present_mode_prefers_mailbox_then_fifo() {
        let all = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::IMMEDIATE], false),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn surface_format_prefers_srgb_bgra() {
        let preferred = format(vk::Format::B8G8R8A8_SRGB);
        let other = format(vk::Format::R8G8B8A8_UNORM);

        let chosen = select_surface_format(&[other, preferred]).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);

        // Right format in the wrong color space does not count.
        let wrong_space = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        let chosen = select_surface_format(&[other, wrong_space]).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);

        assert!(select_surface_format(&[]).is_none());
    }

    #[test]
    fn extent_follows_surface_unless_undefined() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let desired = vk::Extent2D {
            width: 2000,
            height: 300,
        };
        assert_eq!(calculate_extent(&caps, desired).width, 640);

        caps.current_extent.width = u32::MAX;
        let extent = calculate_extent(&caps, desired);
        assert_eq!((extent.width, extent.height), (1024, 300));
    }

    #[test]
    fn transform_and_alpha_fall_back_to_what_the_surface_offers() {
        let caps = vk::SurfaceCapabilitiesKHR {
            supported_transforms: vk::SurfaceTransformFlagsKHR::ROTATE_90,
            current_transform: vk::SurfaceTransformFlagsKHR::ROTATE_90,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::INHERIT,
            ..Default::default()
        };
        assert_eq!(
            select_pre_transform(&caps),
            vk::SurfaceTransformFlagsKHR::ROTATE_90
        );
        assert_eq!(
            select_composite_alpha(&caps),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }

    #[test]
    fn acquire_ahead_respects_image_budget() {
        // Three images with a minimum of two: one may be held before asking.
        assert!(can_acquire_ahead(1, 3, 2));
        assert!(!can_acquire_ahead(2, 3, 2));
        assert!(!can_acquire_ahead(1, 2, 2));
    }

    #[test]
    fn resize_keeps_formats() {
        let formats = vec![
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_SRGB),
        ];
        let samples = vk::SampleCountFlags::TYPE_4;

        let initial = SwapchainConfig::choose(
            &support(formats.clone(), 800, 600),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
            SwapchainOptions::default(),
            samples,
            vk::Format::D32_SFLOAT,
            None,
        )
        .unwrap();

        let resized = SwapchainConfig::choose(
            &support(formats, 400, 300),
            vk::Extent2D {
                width: 400,
                height: 300,
            },
            SwapchainOptions::default(),
            initial.msaa_samples,
            initial.depth_format,
            Some(initial.surface_format),
        )
        .unwrap();

        assert_eq!(
            (resized.extent.width, resized.extent.height),
            (400, 300)
        );
        assert_eq!(resized.surface_format.format, initial.surface_format.format);
        assert_eq!(resized.depth_format, initial.depth_format);
        assert_eq!(resized.image_count, 3);
        assert_eq!(resized.present_mode, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn previous_format_is_kept_even_when_not_preferred() {
        let unorm = format(vk::Format::R8G8B8A8_UNORM);
        let formats = vec![unorm, format(vk::Format::B8G8R8A8_SRGB)];
        let config = SwapchainConfig::choose(
            &support(formats, 400, 300),
            vk::Extent2D {
                width: 400,
                height: 300,
            },
            SwapchainOptions { vsync: true },
            vk::SampleCountFlags::TYPE_1,
            vk::Format::D32_SFLOAT,
            Some(unorm),
        )
        .unwrap();

        assert_eq!(config.surface_format.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(config.present_mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn minimized_surface_is_rejected() {
        let result = SwapchainConfig::choose(
            &support(vec![format(vk::Format::B8G8R8A8_SRGB)], 0, 0),
            vk::Extent2D::default(),
            SwapchainOptions::default(),
            vk::SampleCountFlags::TYPE_1,
            vk::Format::D32_SFLOAT,
            None,
        );
        assert!(matches!(result, Err(GpuError::SwapchainCreation(_))));
    }

    #[test]
    fn empty_format_list_is_an_error() {
        let result = SwapchainConfig::choose(
            &support(Vec::new(), 800, 600),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
            SwapchainOptions::default(),
            vk::SampleCountFlags::TYPE_1,
            vk::Format::D32_SFLOAT,
            None,
        );
        assert!(matches!(result, Err(GpuError::SwapchainCreation(_))));
    }

    fn attachment(raw: u64) -> AttachmentImage {
        AttachmentImage {
            image: GpuImage {
                image: vk::Image::from_raw(raw),
                allocation: None,
                format: vk::Format::D32_SFLOAT,
                extent: vk::Extent3D {
                    width: 800,
                    height: 600,
                    depth: 1,
                },
            },
            view: vk::ImageView::from_raw(raw + 1),
        }
    }

    /// A populated generation made of fake handles.
    fn fake_generation(image_count: u64) -> Generation {
        let layout = ForwardPassLayout::new(
            vk::Format::B8G8R8A8_SRGB,
            vk::Format::D32_SFLOAT,
            vk::SampleCountFlags::TYPE_4,
        );
        let mut generation = Generation::new(vk::SwapchainKHR::from_raw(1));
        generation.render_pass = Some(RenderPass {
            handle: vk::RenderPass::from_raw(2),
            layout,
        });
        for i in 0..image_count {
            let base = 100 * (i + 1);
            generation.images.push(vk::Image::from_raw(base));
            generation.views.push(vk::ImageView::from_raw(base + 1));
            generation.color.push(attachment(base + 10));
            generation.depth.push(attachment(base + 20));
            generation.framebuffers.push(Framebuffer {
                handle: vk::Framebuffer::from_raw(base + 30),
                extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
            });
        }
        generation
    }

    #[test]
    fn relaying_a_generation_twice_queues_each_handle_once() {
        let mut generation = fake_generation(3);
        assert_eq!(generation.framebuffers.len(), generation.image_count());

        let mut queue = DestructionQueue::new();
        assert!(!generation.is_released());
        generation.relay(&mut queue);
        let queued = queue.pending_count();
        assert!(generation.is_released());

        generation.relay(&mut queue);
        generation.relay_dependents(&mut queue);
        assert_eq!(queue.pending_count(), queued);
        assert!(is_null(generation.handle));
        assert_eq!(generation.image_count(), 0);

        let kinds = queue.pending_kinds(0);
        let count = |kind| kinds.iter().filter(|&&k| k == kind).count();
        assert_eq!(count(DestructibleKind::Framebuffer), 3);
        assert_eq!(count(DestructibleKind::RenderPass), 1);
        // Swapchain views plus a view per color and depth target.
        assert_eq!(count(DestructibleKind::ImageView), 9);
        assert_eq!(count(DestructibleKind::Image), 6);
        assert_eq!(count(DestructibleKind::Swapchain), 1);

        // Dependents go first, the swapchain handle last.
        assert_eq!(kinds.first(), Some(&DestructibleKind::Framebuffer));
        assert_eq!(kinds.last(), Some(&DestructibleKind::Swapchain));

        let mut destroyer = crate::destruction::tests::RecordingDestroyer::default();
        unsafe { queue.clear_all(&mut destroyer) }.unwrap();
    }

    #[test]
    fn relaying_dependents_keeps_the_handle_for_handoff() {
        let mut generation = fake_generation(2);
        let mut queue = DestructionQueue::new();

        generation.relay_dependents(&mut queue);
        assert!(!queue
            .pending_kinds(0)
            .contains(&DestructibleKind::Swapchain));
        assert!(!generation.is_released());
        assert_eq!(generation.take_handle(), vk::SwapchainKHR::from_raw(1));
        assert!(generation.is_released());

        let mut destroyer = crate::destruction::tests::RecordingDestroyer::default();
        unsafe { queue.clear_all(&mut destroyer) }.unwrap();
    }

    #[test]
    fn present_status_flags_recreation() {
        assert!(!PresentStatus::Optimal.needs_recreate());
        assert!(PresentStatus::Suboptimal.needs_recreate());
        assert!(PresentStatus::OutOfDate.needs_recreate());
    }
}
