//! Synchronization primitives.
//!
//! [`Fence`] and [`Semaphore`] either own their handle (created here and
//! destroyed through [`Fence::destroy`]/[`Semaphore::destroy`]) or wrap an
//! external one that they never destroy.

use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use tracing::warn;

use crate::destruction::{is_null, DestructionQueue};
use crate::error::{GpuError, Result};

/// Whether a wrapper destroys its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created by the wrapper, destroyed by it.
    Owned,
    /// Created elsewhere; the wrapper only forgets it.
    External,
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

impl WaitStatus {
    /// Treat a timeout as an error, for waits that are expected to finish.
    pub fn signaled(self) -> Result<()> {
        match self {
            Self::Signaled => Ok(()),
            Self::TimedOut => Err(GpuError::Vulkan(vk::Result::TIMEOUT)),
        }
    }
}

/// Map a wait result: success and timeout are outcomes, anything else fails.
pub(crate) fn wait_status(result: VkResult<()>) -> Result<WaitStatus> {
    match result {
        Ok(()) => Ok(WaitStatus::Signaled),
        Err(vk::Result::TIMEOUT) => Ok(WaitStatus::TimedOut),
        Err(e) => Err(GpuError::Vulkan(e)),
    }
}

/// Fence wrapper.
pub struct Fence {
    device: Arc<ash::Device>,
    handle: vk::Fence,
    ownership: Ownership,
}

impl Fence {
    /// Create a fence.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create(device: Arc<ash::Device>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let handle = unsafe { device.create_fence(&create_info, None)? };
        Ok(Self {
            device,
            handle,
            ownership: Ownership::Owned,
        })
    }

    /// Wrap a fence created elsewhere.
    pub fn wrap(device: Arc<ash::Device>, handle: vk::Fence) -> Self {
        Self {
            device,
            handle,
            ownership: Ownership::External,
        }
    }

    /// Raw handle.
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Ownership mode.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Wait for the fence to be signaled.
    ///
    /// # Safety
    /// The fence must be valid.
    pub unsafe fn wait(&self, timeout_ns: u64) -> Result<WaitStatus> {
        wait_status(unsafe { self.device.wait_for_fences(&[self.handle], true, timeout_ns) })
    }

    /// Reset the fence to unsignaled state.
    ///
    /// # Safety
    /// The fence must be valid and not pending in a submission.
    pub unsafe fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_fences(&[self.handle])? };
        Ok(())
    }

    /// Query the fence without blocking.
    ///
    /// # Safety
    /// The fence must be valid.
    pub unsafe fn is_signaled(&self) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(self.handle)? })
    }

    /// Hand the fence to the destruction queue.
    pub fn relay(&mut self, queue: &mut DestructionQueue) {
        let handle = std::mem::take(&mut self.handle);
        if self.ownership == Ownership::Owned && !is_null(handle) {
            queue.push(handle);
        }
    }

    /// Destroy the fence now, or defer it through `queue`.
    ///
    /// # Safety
    /// Without a queue the fence must not be in use.
    pub unsafe fn destroy(&mut self, queue: Option<&mut DestructionQueue>) {
        if let Some(queue) = queue {
            self.relay(queue);
            return;
        }
        let handle = std::mem::take(&mut self.handle);
        if self.ownership == Ownership::Owned && !is_null(handle) {
            unsafe { self.device.destroy_fence(handle, None) };
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owned && !is_null(self.handle) {
            warn!("Fence dropped without being destroyed; potential leak");
        }
    }
}

/// Hands out semaphore ids.
#[derive(Debug, Default)]
pub struct SemaphoreIds {
    next: u64,
}

impl SemaphoreIds {
    /// Counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next id.
    pub fn allocate(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Kind of a semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreKind {
    Binary,
    Timeline,
}

/// Semaphore wrapper.
pub struct Semaphore {
    device: Arc<ash::Device>,
    handle: vk::Semaphore,
    id: u64,
    kind: SemaphoreKind,
    ownership: Ownership,
}

impl Semaphore {
    /// Create a binary semaphore.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn binary(device: Arc<ash::Device>, ids: &mut SemaphoreIds) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let handle = unsafe { device.create_semaphore(&create_info, None)? };
        Ok(Self {
            device,
            handle,
            id: ids.allocate(),
            kind: SemaphoreKind::Binary,
            ownership: Ownership::Owned,
        })
    }

    /// Create a timeline semaphore starting at `initial_value`.
    ///
    /// # Safety
    /// The device must be valid and have the timeline semaphore feature enabled.
    pub unsafe fn timeline(
        device: Arc<ash::Device>,
        ids: &mut SemaphoreIds,
        initial_value: u64,
    ) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let handle = unsafe { device.create_semaphore(&create_info, None)? };
        Ok(Self {
            device,
            handle,
            id: ids.allocate(),
            kind: SemaphoreKind::Timeline,
            ownership: Ownership::Owned,
        })
    }

    /// Wrap a semaphore created elsewhere.
    pub fn wrap(
        device: Arc<ash::Device>,
        ids: &mut SemaphoreIds,
        handle: vk::Semaphore,
        kind: SemaphoreKind,
    ) -> Self {
        Self {
            device,
            handle,
            id: ids.allocate(),
            kind,
            ownership: Ownership::External,
        }
    }

    /// Raw handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    /// Id assigned at creation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Binary or timeline.
    pub fn kind(&self) -> SemaphoreKind {
        self.kind
    }

    fn require_timeline(&self) -> Result<()> {
        if self.kind == SemaphoreKind::Timeline {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "Semaphore {} is not a timeline semaphore",
                self.id
            )))
        }
    }

    /// Current counter value of a timeline semaphore.
    ///
    /// # Safety
    /// The semaphore must be valid.
    pub unsafe fn counter_value(&self) -> Result<u64> {
        self.require_timeline()?;
        Ok(unsafe { self.device.get_semaphore_counter_value(self.handle)? })
    }

    /// Wait until a timeline semaphore reaches `value`.
    ///
    /// # Safety
    /// The semaphore must be valid.
    pub unsafe fn wait_value(&self, value: u64, timeout_ns: u64) -> Result<WaitStatus> {
        self.require_timeline()?;
        let semaphores = [self.handle];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        wait_status(unsafe { self.device.wait_semaphores(&info, timeout_ns) })
    }

    /// Hand the semaphore to the destruction queue.
    pub fn relay(&mut self, queue: &mut DestructionQueue) {
        let handle = std::mem::take(&mut self.handle);
        if self.ownership == Ownership::Owned && !is_null(handle) {
            queue.push(handle);
        }
    }

    /// Destroy the semaphore now, or defer it through `queue`.
    ///
    /// # Safety
    /// Without a queue the semaphore must not be in use.
    pub unsafe fn destroy(&mut self, queue: Option<&mut DestructionQueue>) {
        if let Some(queue) = queue {
            self.relay(queue);
            return;
        }
        let handle = std::mem::take(&mut self.handle);
        if self.ownership == Ownership::Owned && !is_null(handle) {
            unsafe { self.device.destroy_semaphore(handle, None) };
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owned && !is_null(self.handle) {
            warn!(id = self.id, "Semaphore dropped without being destroyed; potential leak");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_results_map_to_status() {
        assert_eq!(wait_status(Ok(())).unwrap(), WaitStatus::Signaled);
        assert_eq!(
            wait_status(Err(vk::Result::TIMEOUT)).unwrap(),
            WaitStatus::TimedOut
        );
        assert!(matches!(
            wait_status(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn timeout_is_an_error_when_signal_is_required() {
        assert!(WaitStatus::Signaled.signaled().is_ok());
        assert!(matches!(
            WaitStatus::TimedOut.signaled(),
            Err(GpuError::Vulkan(vk::Result::TIMEOUT))
        ));
    }

    #[test]
    fn semaphore_ids_are_sequential() {
        let mut ids = SemaphoreIds::new();
        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);
    }
}
