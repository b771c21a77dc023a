use crate::{utils, Error};
use std::{mem, ptr};

/// Smallest alternate stack we are willing to run the dispatcher on
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// A dedicated region the OS switches to when delivering a monitored signal,
/// since the signal might have been caused by a stack overflow.
///
/// The region is preceded by a guard page, so overflowing the alternate stack
/// faults instead of silently corrupting adjacent memory.
pub struct AltStack {
    /// Start of the whole mapping, including the guard page
    mapping: *mut libc::c_void,
    mapping_len: usize,
    stack: libc::stack_t,
    /// The alternate stack that was configured before ours, restored on
    /// deactivation
    previous: parking_lot::Mutex<Option<libc::stack_t>>,
}

// The raw pointers are only handed to the kernel, the memory is owned by us
unsafe impl Send for AltStack {}
unsafe impl Sync for AltStack {}

impl AltStack {
    /// Maps a region of `max(SIGSTKSZ, min_size, MIN_STACK_SIZE)` bytes,
    /// rounded up to whole pages
    pub fn allocate(min_size: usize) -> Result<Self, Error> {
        let page_size = utils::page_size();
        let size = utils::round_up(
            libc::SIGSTKSZ.max(min_size).max(MIN_STACK_SIZE),
            page_size,
        );
        let mapping_len = page_size + size;

        unsafe {
            let mapping = libc::mmap(
                ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(Error::OutOfMemory);
            }

            if libc::mprotect(mapping, page_size, libc::PROT_NONE) != 0 {
                let err = Error::last_os("mprotect");
                libc::munmap(mapping, mapping_len);
                return Err(err);
            }

            Ok(Self {
                mapping,
                mapping_len,
                stack: libc::stack_t {
                    ss_sp: mapping.cast::<u8>().add(page_size).cast(),
                    ss_flags: 0,
                    ss_size: size,
                },
                previous: parking_lot::Mutex::new(None),
            })
        }
    }

    /// Usable size of the stack, excluding the guard page
    #[inline]
    pub fn len(&self) -> usize {
        self.stack.ss_size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stack.ss_size == 0
    }

    /// Lowest usable address of the stack
    #[inline]
    pub fn base(&self) -> usize {
        self.stack.ss_sp as usize
    }

    /// Tells the OS to run signal handlers of the calling thread on this
    /// region. Activating again is a no-op.
    pub fn activate(&self) -> Result<(), Error> {
        let mut previous = self.previous.lock();

        unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current) == -1 {
                return Err(Error::last_os("sigaltstack"));
            }

            if current.ss_sp == self.stack.ss_sp && current.ss_flags & libc::SS_DISABLE == 0 {
                return Ok(());
            }

            if libc::sigaltstack(&self.stack, ptr::null_mut()) == -1 {
                return Err(Error::last_os("sigaltstack"));
            }

            *previous = Some(current);
        }

        Ok(())
    }

    /// Restores the alternate stack that was active before [`Self::activate`],
    /// but only if ours is still the active one on the calling thread
    pub fn deactivate(&self) -> Result<(), Error> {
        let mut previous = self.previous.lock();

        let Some(old) = previous.take() else {
            return Ok(());
        };

        unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current) == -1 {
                return Err(Error::last_os("sigaltstack"));
            }

            if current.ss_sp != self.stack.ss_sp {
                return Ok(());
            }

            let restore = if old.ss_flags & libc::SS_DISABLE == 0 {
                old
            } else {
                let mut disable: libc::stack_t = mem::zeroed();
                disable.ss_flags = libc::SS_DISABLE;
                disable
            };

            if libc::sigaltstack(&restore, ptr::null_mut()) == -1 {
                return Err(Error::last_os("sigaltstack"));
            }
        }

        Ok(())
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        // Never leave the kernel pointing at unmapped memory
        let _ = self.deactivate();

        unsafe {
            let r = libc::munmap(self.mapping, self.mapping_len);
            debug_assert_eq!(r, 0, "munmap of the alternate stack failed");
        }
    }
}
