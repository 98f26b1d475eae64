//! Frame-slot bookkeeping for the swapchain.
//!
//! [`FrameCycle`] tracks which swapchain image each frame slot holds and
//! which slot is current. It issues no Vulkan calls; the swapchain drives it
//! after each acquire and present.

use tetrad_core::constants::FRAMES_IN_FLIGHT;
use tetrad_core::next_slot;

use crate::error::{GpuError, Result};

/// Swapchain image held by a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotImage {
    /// Nothing acquired; the slot needs an acquire before it can present.
    #[default]
    None,
    /// An image was acquired and not yet presented.
    Acquired { index: u32 },
}

impl SlotImage {
    /// Acquired image index, if any.
    pub fn index(self) -> Option<u32> {
        match self {
            Self::None => None,
            Self::Acquired { index } => Some(index),
        }
    }
}

/// Ring of frame slots.
#[derive(Debug, Clone)]
pub struct FrameCycle {
    slots: [SlotImage; FRAMES_IN_FLIGHT],
    current: usize,
    frame: u64,
}

impl Default for FrameCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCycle {
    /// All slots empty, slot 0 current.
    pub fn new() -> Self {
        Self {
            slots: [SlotImage::None; FRAMES_IN_FLIGHT],
            current: 0,
            frame: 0,
        }
    }

    /// Slot of the frame being recorded.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Slot that becomes current after the next present.
    pub fn next(&self) -> usize {
        next_slot(self.current)
    }

    /// Number of frames presented so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Image held by `slot`.
    pub fn image(&self, slot: usize) -> SlotImage {
        self.slots.get(slot).copied().unwrap_or_default()
    }

    /// Whether `slot` holds no image.
    pub fn needs_acquire(&self, slot: usize) -> bool {
        self.image(slot) == SlotImage::None
    }

    /// Record an acquire into `slot` and return what the slot now holds.
    ///
    /// A suboptimal image is not kept: the slot stays empty so the next frame
    /// acquires again, from a recreated swapchain.
    pub fn record_acquired(
        &mut self,
        slot: usize,
        index: u32,
        suboptimal: bool,
    ) -> Result<SlotImage> {
        let image = self
            .slots
            .get(slot)
            .ok_or_else(|| GpuError::InvalidState(format!("Frame slot {slot} out of range")))?;
        if let SlotImage::Acquired { index: held, .. } = image {
            return Err(GpuError::InvalidState(format!(
                "Frame slot {slot} already holds image {held}"
            )));
        }
        if let Some(other) = self
            .slots
            .iter()
            .position(|image| image.index() == Some(index))
        {
            return Err(GpuError::InvalidState(format!(
                "Image {index} is already held by frame slot {other}"
            )));
        }

        if suboptimal {
            return Ok(SlotImage::None);
        }
        self.slots[slot] = SlotImage::Acquired { index };
        Ok(self.slots[slot])
    }

    /// Image the current slot is about to present.
    pub fn begin_present(&self) -> Result<u32> {
        match self.slots[self.current] {
            SlotImage::Acquired { index } => Ok(index),
            SlotImage::None => Err(GpuError::InvalidState(format!(
                "Present without an acquired image in frame slot {}",
                self.current
            ))),
        }
    }

    /// Release the presented image and advance to the next slot.
    ///
    /// Returns the new current slot.
    pub fn finish_present(&mut self) -> usize {
        self.slots[self.current] = SlotImage::None;
        self.current = next_slot(self.current);
        self.frame += 1;
        self.current
    }

    /// Forget every acquired image, e.g. after the swapchain was recreated.
    ///
    /// The current slot and frame counter are kept so slots keep alternating
    /// with the destruction buckets.
    pub fn reset(&mut self) {
        self.slots = [SlotImage::None; FRAMES_IN_FLIGHT];
    }

    /// Slots currently holding an image.
    pub fn held_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, image)| image.index().is_some())
            .map(|(slot, _)| slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_requires_an_acquired_image() {
        let cycle = FrameCycle::new();
        assert!(matches!(
            cycle.begin_present(),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn slot_cannot_hold_two_images() {
        let mut cycle = FrameCycle::new();
        cycle.record_acquired(0, 1, false).unwrap();
        assert!(cycle.record_acquired(0, 2, false).is_err());
        assert!(cycle.record_acquired(1, 1, false).is_err());
        assert!(cycle.record_acquired(FRAMES_IN_FLIGHT, 2, false).is_err());
    }

    #[test]
    fn present_releases_slot_and_advances() {
        let mut cycle = FrameCycle::new();
        cycle.record_acquired(0, 2, false).unwrap();
        assert_eq!(cycle.begin_present().unwrap(), 2);

        assert_eq!(cycle.finish_present(), 1);
        assert_eq!(cycle.frame(), 1);
        assert!(cycle.needs_acquire(0));
    }

    #[test]
    fn suboptimal_acquire_leaves_slot_empty() {
        let mut cycle = FrameCycle::new();
        assert_eq!(cycle.record_acquired(0, 1, true).unwrap(), SlotImage::None);
        assert_eq!(cycle.image(0), SlotImage::None);
        assert!(cycle.needs_acquire(0));
        assert!(cycle.begin_present().is_err());

        // The same image can be taken again once acquired optimally.
        assert_eq!(
            cycle.record_acquired(0, 1, false).unwrap(),
            SlotImage::Acquired { index: 1 }
        );
        assert_eq!(cycle.begin_present().unwrap(), 1);
    }

    #[test]
    fn no_image_is_presented_twice_without_acquire() {
        const IMAGE_COUNT: u32 = 3;
        let mut cycle = FrameCycle::new();
        let mut next_image = 0u32;
        // Acquires recorded per slot since its last present.
        let mut acquires = [0u32; FRAMES_IN_FLIGHT];

        for _ in 0..(4 * FRAMES_IN_FLIGHT + 1) {
            let slot = cycle.current();
            if cycle.needs_acquire(slot) {
                cycle.record_acquired(slot, next_image, false).unwrap();
                next_image = (next_image + 1) % IMAGE_COUNT;
                acquires[slot] += 1;
            }

            // Acquire ahead into the next slot when it is free.
            let ahead = cycle.next();
            if cycle.needs_acquire(ahead) {
                cycle.record_acquired(ahead, next_image, false).unwrap();
                next_image = (next_image + 1) % IMAGE_COUNT;
                acquires[ahead] += 1;
            }

            let index = cycle.begin_present().unwrap();
            assert_eq!(cycle.image(slot).index(), Some(index));
            assert_eq!(acquires[slot], 1, "slot {slot} presented without one acquire");
            acquires[slot] = 0;
            cycle.finish_present();
        }
    }

    #[test]
    fn reset_clears_slots_but_keeps_frame_count() {
        let mut cycle = FrameCycle::new();
        cycle.record_acquired(0, 0, false).unwrap();
        cycle.finish_present();
        cycle.record_acquired(1, 1, false).unwrap();
        assert_eq!(cycle.held_slots().collect::<Vec<_>>(), vec![1]);

        cycle.reset();
        assert_eq!(cycle.current(), 1);
        assert_eq!(cycle.frame(), 1);
        assert_eq!(cycle.held_slots().count(), 0);
        assert_eq!(tetrad_core::cycle_sub_index(cycle.frame()), 1);
    }
}
