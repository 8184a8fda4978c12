//! Unix stack mapping using mmap

use super::StackRegion;
use dpworker_core::MemoryError;

fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

impl StackRegion {
    pub(super) fn map(slots: usize, stack_size: usize) -> Result<Self, MemoryError> {
        let page = page_size();
        let stack_size = stack_size
            .checked_next_multiple_of(page)
            .ok_or(MemoryError::TooManySlots)?;
        let slot_size = stack_size.checked_add(page).ok_or(MemoryError::TooManySlots)?;
        let total_size = slots.checked_mul(slot_size).ok_or(MemoryError::TooManySlots)?;
        if total_size == 0 {
            return Err(MemoryError::TooManySlots);
        }

        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        #[cfg(target_os = "linux")]
        {
            flags |= libc::MAP_STACK;
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        let base = base as *mut u8;

        // Construct first so a failed mprotect still unmaps on drop
        let region = StackRegion {
            base,
            total_size,
            slot_size,
            guard_size: page,
            slots,
        };

        for slot in 0..slots {
            let guard = unsafe { base.add(slot * slot_size) };
            let ret = unsafe { libc::mprotect(guard as *mut libc::c_void, page, libc::PROT_NONE) };
            if ret != 0 {
                return Err(MemoryError::ProtectionFailed);
            }
        }

        Ok(region)
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        if !self.base.is_null() {
            let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total_size) };
            if ret != 0 {
                log::warn!("munmap of {} byte stack region failed", self.total_size);
            }
        }
    }
}
