//! Window, surface and swapchain as one lifecycle unit.

use ash::vk;
use tetrad_core::constants::{FRAMES_IN_FLIGHT, WAIT_FOREVER_NS};
use tetrad_gpu::command::{begin_command_buffer, end_command_buffer, CommandPool, SubmitBatch};
use tetrad_gpu::{
    Destructible, DestructionQueue, FrameTarget, GpuContext, GpuContextBuilder, PresentStatus,
    Semaphore, SemaphoreIds, SurfaceContext, Swapchain, SwapchainOptions,
};
use tetrad_platform::{is_zero_area, OsWindow, WindowConfig};
use tracing::{debug, info, warn};
use winit::event_loop::ActiveEventLoop;

/// Settings the core is created with.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub app_name: String,
    pub window: WindowConfig,
    pub vsync: bool,
    pub validation: bool,
}

/// Everything needed to put frames on screen.
///
/// Drives one acquire → record → submit → present cycle per frame through
/// [`GraphicsCore::begin_frame`] and [`GraphicsCore::end_frame`].
pub struct GraphicsCore {
    window: OsWindow,
    gpu: GpuContext,
    surface: SurfaceContext,
    swapchain: Swapchain,
    deletion: DestructionQueue,
    semaphore_ids: SemaphoreIds,
    command_pool: CommandPool,
    /// One primary command buffer per frame slot.
    command_buffers: Vec<vk::CommandBuffer>,
    /// Counts submitted frames on the GPU timeline.
    frame_timeline: Semaphore,
    submitted: u64,
    clear_color: [f32; 4],
    minimized: bool,
    resize_pending: bool,
}

impl GraphicsCore {
    /// Open the window and bring up everything down to the swapchain.
    pub fn new(event_loop: &ActiveEventLoop, config: &CoreConfig) -> anyhow::Result<Self> {
        let window = OsWindow::create(event_loop, &config.window)?;

        let gpu = GpuContextBuilder::new()
            .app_name(&config.app_name)
            .validation(config.validation)
            .display(window.raw_display_handle()?)
            .build()?;

        let mut semaphore_ids = SemaphoreIds::new();
        // SAFETY: the window outlives the surface; it is relayed after it.
        let mut surface = unsafe { SurfaceContext::from_window(&gpu, &window)? };

        let (width, height) = window.size();
        let options = SwapchainOptions {
            vsync: config.vsync,
        };
        let mut swapchain = match unsafe {
            Swapchain::create(
                &gpu,
                &surface,
                vk::Extent2D {
                    width: width.max(1),
                    height: height.max(1),
                },
                options,
                &mut semaphore_ids,
                None,
            )
        } {
            Ok(swapchain) => swapchain,
            Err(e) => {
                unsafe { surface.destroy(None) };
                return Err(e.into());
            }
        };

        let frame_objects = unsafe { create_frame_objects(&gpu, &mut semaphore_ids) };
        let (command_pool, command_buffers, frame_timeline) = match frame_objects {
            Ok(objects) => objects,
            Err(e) => {
                // Nothing has been submitted yet.
                unsafe {
                    if let Err(e) = swapchain.destroy(&gpu, None) {
                        warn!("Failed to destroy swapchain: {e}");
                    }
                    surface.destroy(None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            minimized: is_zero_area(width, height),
            window,
            gpu,
            surface,
            swapchain,
            deletion: DestructionQueue::new(),
            semaphore_ids,
            command_pool,
            command_buffers,
            frame_timeline,
            submitted: 0,
            clear_color: [0.05, 0.05, 0.08, 1.0],
            resize_pending: false,
        })
    }

    pub fn window(&self) -> &OsWindow {
        &self.window
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Current render area.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Whether rendering is paused for a zero-sized window.
    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    /// Color the forward pass clears to.
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Frames submitted so far.
    pub fn submitted_frames(&self) -> u64 {
        self.submitted
    }

    /// Frames the GPU has finished.
    pub fn completed_frames(&self) -> anyhow::Result<u64> {
        Ok(unsafe { self.frame_timeline.counter_value()? })
    }

    /// Block until the GPU has finished every submitted frame.
    pub fn wait_for_frames(&self) -> anyhow::Result<()> {
        unsafe {
            self.frame_timeline
                .wait_value(self.submitted, WAIT_FOREVER_NS)?
                .signaled()?;
        }
        Ok(())
    }

    /// React to a new window size.
    ///
    /// Returns whether the swapchain was rebuilt; a zero-sized window only
    /// pauses rendering.
    pub fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<bool> {
        self.minimized = is_zero_area(width, height);
        if self.minimized {
            debug!("Window minimized, pausing rendering");
            return Ok(false);
        }
        self.recreate_swapchain()?;
        Ok(true)
    }

    fn recreate_swapchain(&mut self) -> anyhow::Result<()> {
        let (width, height) = self.window.size();
        if is_zero_area(width, height) {
            self.minimized = true;
            return Ok(());
        }

        let Self {
            gpu,
            surface,
            swapchain,
            semaphore_ids,
            deletion,
            resize_pending,
            ..
        } = self;
        // A failed rebuild leaves the request raised so the next frame retries.
        rebuild_with_retry(resize_pending, || unsafe {
            swapchain.resize(
                gpu,
                surface,
                vk::Extent2D { width, height },
                semaphore_ids,
                deletion,
            )
        })?;
        Ok(())
    }

    /// Move rendering into a freshly opened window.
    ///
    /// The old window and its surface are retired through the destruction
    /// queue, after the swapchain that still references them.
    pub fn replace_window(
        &mut self,
        event_loop: &ActiveEventLoop,
        config: &WindowConfig,
    ) -> anyhow::Result<()> {
        let window = OsWindow::create(event_loop, config)?;
        let mut surface = unsafe { SurfaceContext::from_window(&self.gpu, &window)? };

        let (width, height) = window.size();
        // Until relocation succeeds the old surface gets rebuilt on the next frame.
        self.resize_pending = true;
        let relocated = unsafe {
            self.swapchain.relocate(
                &self.gpu,
                &surface,
                vk::Extent2D {
                    width: width.max(1),
                    height: height.max(1),
                },
                &mut self.semaphore_ids,
                &mut self.deletion,
            )
        };
        if let Err(e) = relocated {
            // Retired handles of the failed attempt may still reference them.
            surface.relay(&mut self.deletion);
            self.deletion.push(Destructible::Window(Box::new(window)));
            return Err(e.into());
        }

        let mut old_surface = std::mem::replace(&mut self.surface, surface);
        old_surface.relay(&mut self.deletion);
        let old_window = std::mem::replace(&mut self.window, window);
        self.deletion.push(Destructible::Window(Box::new(old_window)));

        self.minimized = is_zero_area(width, height);
        self.resize_pending = false;
        info!(title = %config.title, "Moved rendering to a new window");
        Ok(())
    }

    /// Acquire an image and begin the forward pass.
    ///
    /// Returns `None` when no frame can be drawn right now: the window is
    /// minimized, or the swapchain went out of date or handed out a
    /// suboptimal image and is rebuilt on the next call.
    pub fn begin_frame(&mut self) -> anyhow::Result<Option<FrameTarget>> {
        if self.minimized {
            return Ok(None);
        }
        if self.resize_pending || self.swapchain.needs_recreate() {
            self.recreate_swapchain()?;
            if self.minimized {
                return Ok(None);
            }
        }

        let target = match unsafe { self.swapchain.acquire_next_image() } {
            Ok(Some(target)) => target,
            Ok(None) => {
                debug!("Swapchain needs recreation before acquiring");
                self.resize_pending = true;
                return Ok(None);
            }
            Err(e) if e.is_out_of_date() => {
                debug!("Swapchain out of date on acquire");
                self.resize_pending = true;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let device = self.gpu.device();
        let cmd = self.command_buffers[target.slot];
        let clear_values = self.swapchain.pass_layout().clear_values(self.clear_color);
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(target.render_pass)
            .framebuffer(target.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: target.extent,
            })
            .clear_values(&clear_values);

        // SAFETY: the slot's in-flight fence was waited, so its command
        // buffer is no longer pending.
        unsafe {
            self.command_pool.reset_command_buffer(cmd)?;
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        }

        Ok(Some(target))
    }

    /// Command buffer recording `target`.
    pub fn command_buffer(&self, target: &FrameTarget) -> vk::CommandBuffer {
        self.command_buffers[target.slot]
    }

    /// End the forward pass, submit and present.
    pub fn end_frame(&mut self, target: &FrameTarget) -> anyhow::Result<PresentStatus> {
        let device = self.gpu.device();
        let cmd = self.command_buffers[target.slot];

        unsafe {
            device.cmd_end_render_pass(cmd);
            end_command_buffer(device, cmd)?;
        }

        let timeline_value = self.submitted + 1;
        let batch = SubmitBatch::new()
            .command_buffer(cmd)
            .wait(
                target.image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )
            .signal(target.render_finished)
            .signal_timeline(self.frame_timeline.handle(), timeline_value);
        unsafe { batch.submit(device, self.gpu.graphics_queue(), target.in_flight)? };
        self.submitted = timeline_value;

        let mut destroyer = self.surface.destroyer(&self.gpu);
        let status = unsafe {
            self.swapchain
                .present(self.gpu.graphics_queue(), &mut self.deletion, &mut destroyer)?
        };
        if status.needs_recreate() {
            debug!(?status, "Swapchain needs recreation after present");
            self.resize_pending = true;
        }
        Ok(status)
    }

    /// Wait idle and release everything, window last.
    pub fn destroy(self) -> anyhow::Result<()> {
        let Self {
            window,
            gpu,
            mut surface,
            mut swapchain,
            mut deletion,
            mut command_pool,
            mut command_buffers,
            mut frame_timeline,
            ..
        } = self;

        if let Err(e) = gpu.wait_idle() {
            warn!("Failed to wait idle before shutdown: {e}");
        }

        // Freed together with the pool.
        command_buffers.clear();
        command_pool.relay(&mut deletion);
        frame_timeline.relay(&mut deletion);
        let swapchain_result = unsafe { swapchain.destroy(&gpu, Some(&mut deletion)) };
        debug_assert!(swapchain.is_destroyed());
        surface.relay(&mut deletion);
        deletion.push(Destructible::Window(Box::new(window)));

        // SAFETY: the device is idle.
        let cleared = unsafe { deletion.clear_all(&mut surface.destroyer(&gpu)) };
        swapchain_result?;
        let cleared = cleared?;
        debug!(cleared, "Released presentation resources");

        drop(gpu);
        Ok(())
    }
}

/// Command pool, one command buffer per slot and the frame timeline.
unsafe fn create_frame_objects(
    gpu: &GpuContext,
    ids: &mut SemaphoreIds,
) -> anyhow::Result<(CommandPool, Vec<vk::CommandBuffer>, Semaphore)> {
    let mut command_pool = unsafe {
        CommandPool::new(
            gpu.shared_device(),
            gpu.graphics_queue_family(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?
    };

    let created = unsafe {
        command_pool
            .allocate_command_buffers(vk::CommandBufferLevel::PRIMARY, FRAMES_IN_FLIGHT as u32)
            .and_then(|buffers| {
                Semaphore::timeline(gpu.shared_device(), ids, 0).map(|timeline| (buffers, timeline))
            })
    };

    match created {
        Ok((buffers, timeline)) => Ok((command_pool, buffers, timeline)),
        Err(e) => {
            unsafe { command_pool.destroy(None) };
            Err(e.into())
        }
    }
}

/// Run `rebuild` with `pending` raised, lowering it only once it succeeds.
fn rebuild_with_retry<T, E>(
    pending: &mut bool,
    rebuild: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    *pending = true;
    let value = rebuild()?;
    *pending = false;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_rebuild_stays_pending() {
        let mut pending = false;
        let result: Result<(), &str> = rebuild_with_retry(&mut pending, || Err("out of memory"));
        assert_eq!(result, Err("out of memory"));
        assert!(pending);
    }

    #[test]
    fn successful_rebuild_clears_pending() {
        let mut pending = true;
        let mut attempts = 0;
        let result: Result<u32, &str> = rebuild_with_retry(&mut pending, || {
            attempts += 1;
            Ok(attempts)
        });
        assert_eq!(result, Ok(1));
        assert!(!pending);
    }
}
