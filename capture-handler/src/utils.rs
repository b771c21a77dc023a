mod fixed_str;

pub use fixed_str::{FixedCStr, FixedStr};

/// Page size of the system, queried once
#[inline]
pub fn page_size() -> usize {
    static mut PAGE_SIZE: usize = 0;
    static INIT_PAGE_SIZE: parking_lot::Once = parking_lot::Once::new();

    // Written exactly once under the `Once`, read-only afterwards
    unsafe {
        INIT_PAGE_SIZE.call_once(|| {
            PAGE_SIZE = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        });
        PAGE_SIZE
    }
}

/// Rounds `size` up to a multiple of `align`, which must be a power of two
#[inline]
pub(crate) fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Repeats a raw libc call for as long as it fails with `EINTR`
#[inline]
pub(crate) fn retry_eintr<F>(mut call: F) -> libc::ssize_t
where
    F: FnMut() -> libc::ssize_t,
{
    loop {
        let res = call();

        if res == -1 && errno::errno().0 == libc::EINTR {
            continue;
        }

        break res;
    }
}
