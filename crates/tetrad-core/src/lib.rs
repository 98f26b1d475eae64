//! Core constants for the Tetrad engine.
//!
//! Everything here is shared between the Vulkan layer and the application
//! framework, so it lives in a crate with no dependencies of its own.

/// Engine-wide constants
pub mod constants {
    /// Number of frames the CPU may record ahead of the GPU.
    pub const FRAMES_IN_FLIGHT: usize = 2;
    /// Upper bound for the MSAA sample count of the forward pass.
    pub const MAX_MSAA_SAMPLES: u32 = 4;
    /// Timeout used for blocking fence waits (effectively unbounded).
    pub const WAIT_FOREVER_NS: u64 = u64::MAX;
}

/// Bucket index of the destruction queue that frame `frame` writes into.
#[inline]
pub const fn cycle_sub_index(frame: u64) -> usize {
    (frame % constants::FRAMES_IN_FLIGHT as u64) as usize
}

/// Frame slot that follows `slot`.
#[inline]
pub const fn next_slot(slot: usize) -> usize {
    (slot + 1) % constants::FRAMES_IN_FLIGHT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_index_wraps_at_frames_in_flight() {
        assert_eq!(cycle_sub_index(0), 0);
        assert_eq!(cycle_sub_index(1), 1);
        assert_eq!(cycle_sub_index(2), 0);
        assert_eq!(cycle_sub_index(7), 1);
    }

    #[test]
    fn next_slot_cycles() {
        let mut slot = 0;
        for _ in 0..constants::FRAMES_IN_FLIGHT {
            slot = next_slot(slot);
        }
        assert_eq!(slot, 0);
    }
}
