//! Command buffer management.

use std::sync::Arc;

use ash::vk;

use crate::destruction::{is_null, DestructionQueue};
use crate::error::{GpuError, Result};

/// Command pool for allocating command buffers.
pub struct CommandPool {
    device: Arc<ash::Device>,
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        Ok(Self {
            device,
            pool,
            queue_family,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single command buffer.
    ///
    /// # Safety
    /// The pool must not have been destroyed.
    pub unsafe fn allocate_command_buffer(
        &self,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let buffers = unsafe { self.allocate_command_buffers(level, 1)? };
        buffers
            .first()
            .copied()
            .ok_or_else(|| GpuError::Other("Driver returned no command buffer".to_string()))
    }

    /// Allocate multiple command buffers.
    ///
    /// # Safety
    /// The pool must not have been destroyed.
    pub unsafe fn allocate_command_buffers(
        &self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(count);

        Ok(unsafe { self.device.allocate_command_buffers(&alloc_info)? })
    }

    /// Free a command buffer once the frame that last used it completes.
    pub fn free_command_buffer(
        &self,
        queue: &mut DestructionQueue,
        buffer: vk::CommandBuffer,
    ) -> Result<()> {
        queue.push_dependent(buffer, self.pool)
    }

    /// Reset a single command buffer for re-recording.
    ///
    /// # Safety
    /// The pool needs `RESET_COMMAND_BUFFER` and the buffer must not be pending.
    pub unsafe fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    /// Reset the command pool.
    ///
    /// # Safety
    /// No command buffer from this pool may be in use.
    pub unsafe fn reset(&self, flags: vk::CommandPoolResetFlags) -> Result<()> {
        unsafe { self.device.reset_command_pool(self.pool, flags)? };
        Ok(())
    }

    /// Hand the pool to the destruction queue.
    pub fn relay(&mut self, queue: &mut DestructionQueue) {
        if !is_null(self.pool) {
            queue.push(std::mem::take(&mut self.pool));
        }
    }

    /// Destroy the pool now, or defer it through `queue`.
    ///
    /// Command buffers still allocated from it are freed with it.
    ///
    /// # Safety
    /// Without a queue the pool must not be in use.
    pub unsafe fn destroy(&mut self, queue: Option<&mut DestructionQueue>) {
        match queue {
            Some(queue) => self.relay(queue),
            None => {
                let pool = std::mem::take(&mut self.pool);
                if !is_null(pool) {
                    unsafe { self.device.destroy_command_pool(pool, None) };
                }
            }
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        if !is_null(self.pool) {
            tracing::warn!("Command pool dropped without being destroyed; potential leak");
        }
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    unsafe { device.begin_command_buffer(cmd, &begin_info)? };
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}

/// One queue submission mixing binary and timeline semaphores.
///
/// Wait and signal values are kept parallel to their semaphore lists; the
/// value of a binary semaphore is ignored by the driver and stored as 0.
#[derive(Debug, Default, Clone)]
pub struct SubmitBatch {
    command_buffers: Vec<vk::CommandBuffer>,
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    wait_values: Vec<u64>,
    signal_semaphores: Vec<vk::Semaphore>,
    signal_values: Vec<u64>,
    uses_timeline: bool,
}

impl SubmitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command buffer.
    pub fn command_buffer(mut self, cmd: vk::CommandBuffer) -> Self {
        self.command_buffers.push(cmd);
        self
    }

    /// Wait on a binary semaphore before `stage`.
    pub fn wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(stage);
        self.wait_values.push(0);
        self
    }

    /// Wait until a timeline semaphore reaches `value` before `stage`.
    pub fn wait_timeline(
        mut self,
        semaphore: vk::Semaphore,
        stage: vk::PipelineStageFlags,
        value: u64,
    ) -> Self {
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(stage);
        self.wait_values.push(value);
        self.uses_timeline = true;
        self
    }

    /// Signal a binary semaphore on completion.
    pub fn signal(mut self, semaphore: vk::Semaphore) -> Self {
        self.signal_semaphores.push(semaphore);
        self.signal_values.push(0);
        self
    }

    /// Set a timeline semaphore to `value` on completion.
    pub fn signal_timeline(mut self, semaphore: vk::Semaphore, value: u64) -> Self {
        self.signal_semaphores.push(semaphore);
        self.signal_values.push(value);
        self.uses_timeline = true;
        self
    }

    /// Whether a timeline value has to be chained into the submit.
    pub fn uses_timeline(&self) -> bool {
        self.uses_timeline
    }

    pub fn wait_count(&self) -> usize {
        self.wait_semaphores.len()
    }

    pub fn signal_count(&self) -> usize {
        self.signal_semaphores.len()
    }

    /// Submit to `queue`, signaling `fence` when done.
    ///
    /// # Safety
    /// All handles must be valid and the command buffers fully recorded.
    pub unsafe fn submit(
        &self,
        device: &ash::Device,
        queue: vk::Queue,
        fence: vk::Fence,
    ) -> Result<()> {
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&self.wait_values)
            .signal_semaphore_values(&self.signal_values);

        let mut submit_info = vk::SubmitInfo::default()
            .command_buffers(&self.command_buffers)
            .wait_semaphores(&self.wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .signal_semaphores(&self.signal_semaphores);
        if self.uses_timeline {
            submit_info = submit_info.push_next(&mut timeline_info);
        }

        unsafe { device.queue_submit(queue, &[submit_info], fence)? };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn values_stay_parallel_to_semaphores() {
        let batch = SubmitBatch::new()
            .command_buffer(vk::CommandBuffer::from_raw(1))
            .wait(
                vk::Semaphore::from_raw(2),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )
            .signal(vk::Semaphore::from_raw(3))
            .signal_timeline(vk::Semaphore::from_raw(4), 17);

        assert!(batch.uses_timeline());
        assert_eq!(batch.wait_count(), 1);
        assert_eq!(batch.signal_count(), 2);
        assert_eq!(batch.wait_values, vec![0]);
        assert_eq!(batch.wait_stages.len(), batch.wait_semaphores.len());
        assert_eq!(batch.signal_values, vec![0, 17]);
    }

    #[test]
    fn binary_only_batches_skip_timeline_info() {
        let batch = SubmitBatch::new()
            .wait(vk::Semaphore::from_raw(1), vk::PipelineStageFlags::TOP_OF_PIPE)
            .signal(vk::Semaphore::from_raw(2));
        assert!(!batch.uses_timeline());
    }
}
