//! Job stack memory
//!
//! One anonymous mapping per worker, split into equal slots. Each slot is a
//! guard page followed by the stack; stacks grow down toward the guard, so
//! an overflow faults instead of scribbling over the neighbour.
//!
//! ```text
//! base ─▶ [guard][ stack 0 ........ ][guard][ stack 1 ........ ] ...
//!                                  ▲ top(0)                    ▲ top(1)
//! ```

use dpworker_core::MemoryError;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
    } else {
        compile_error!("Unsupported platform");
    }
}

/// Reserved stacks for one worker's job slots
pub struct StackRegion {
    base: *mut u8,
    total_size: usize,
    slot_size: usize,
    guard_size: usize,
    slots: usize,
}

// Safety: the region is plain memory owned by this value; it moves with
// the worker that owns it.
unsafe impl Send for StackRegion {}

impl StackRegion {
    /// Map `slots` stacks of at least `stack_size` bytes each
    pub fn new(slots: usize, stack_size: usize) -> Result<Self, MemoryError> {
        Self::map(slots, stack_size)
    }

    /// Highest address of a slot's stack (exclusive)
    #[inline]
    pub fn stack_top(&self, slot: u32) -> *mut u8 {
        debug_assert!((slot as usize) < self.slots);
        // Safety: (slot + 1) * slot_size <= total_size
        unsafe { self.base.add((slot as usize + 1) * self.slot_size) }
    }

    /// Usable bytes per stack (excluding the guard page)
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.slot_size - self.guard_size
    }

    #[inline]
    pub fn slots(&self) -> usize {
        self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stacks_writable_end_to_end() {
        let region = StackRegion::new(3, 64 * 1024).unwrap();
        assert!(region.stack_size() >= 64 * 1024);

        for slot in 0..3 {
            let top = region.stack_top(slot);
            unsafe {
                let bottom = top.sub(region.stack_size());
                bottom.write_volatile(0xAA);
                top.sub(1).write_volatile(0x55);
                assert_eq!(bottom.read_volatile(), 0xAA);
            }
        }
    }

    #[test]
    fn test_slots_disjoint() {
        let region = StackRegion::new(2, 64 * 1024).unwrap();
        let gap = region.stack_top(1) as usize - region.stack_top(0) as usize;
        assert!(gap > region.stack_size());
    }

    #[test]
    fn test_rejects_overflowing_request() {
        assert!(StackRegion::new(usize::MAX / 2, 1 << 20).is_err());
    }
}
