//! Unix stack implementation using mmap

use std::ptr::NonNull;
use std::sync::OnceLock;

use cofiber_core::MemoryError;
use nix::errno::Errno;

use super::round_to_page;
use crate::config::defaults::MIN_STACK_SIZE;

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if raw > 0 { raw as usize } else { 4096 }
    })
}

/// A guarded, mmap-backed fiber stack
///
/// Layout (low to high): one guard page, then `usable_size()` bytes of
/// read/write memory. The stack grows down from `top()`.
pub struct Stack {
    base: NonNull<u8>,
    mapped: usize,
    guard: usize,
}

// The mapping is owned exclusively and only touched by whichever thread
// currently runs the fiber.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    pub fn new(size: usize) -> Result<Stack, MemoryError> {
        if size < MIN_STACK_SIZE {
            return Err(MemoryError::TooSmall(size));
        }
        let page = page_size();
        let guard = page;
        let mapped = round_to_page(size, page) + guard;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed { size: mapped, errno: Errno::last() });
        }

        // Guard page stays inaccessible for the life of the stack
        if unsafe { libc::mprotect(base, guard, libc::PROT_NONE) } != 0 {
            let errno = Errno::last();
            unsafe { libc::munmap(base, mapped) };
            return Err(MemoryError::GuardFailed(errno));
        }

        let base = NonNull::new(base as *mut u8)
            .ok_or(MemoryError::MapFailed { size: mapped, errno: Errno::ENOMEM })?;
        Ok(Stack { base, mapped, guard })
    }

    /// One past the highest usable byte
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.mapped) }
    }

    #[inline]
    pub fn usable_size(&self) -> usize {
        self.mapped - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped) };
        if rc != 0 {
            tracing::warn!(errno = %Errno::last(), size = self.mapped, "munmap of fiber stack failed");
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("top", &self.top())
            .field("usable", &self.usable_size())
            .finish()
    }
}
