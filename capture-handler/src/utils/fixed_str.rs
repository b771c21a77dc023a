use std::{ffi::CStr, fmt};

/// A string buffer with a capacity fixed at compile time, so it can be
/// formatted into from a signal handler without touching the heap.
///
/// Writes that don't fit are truncated at the last whole character and the
/// buffer remembers that it overflowed.
#[cfg_attr(test, derive(PartialEq))]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
    ind: usize,
    truncated: bool,
}

impl<const N: usize> FixedStr<N> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            bytes: [0u8; N],
            ind: 0,
            truncated: false,
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.ind = 0;
        self.truncated = false;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ind
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ind == 0
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        N - self.ind
    }

    /// True if any write since the last [`Self::clear`] did not fit
    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.ind]
    }

    /// Appends as much of `s` as fits, never splitting a character
    pub fn push_str_lossy(&mut self, s: &str) {
        let mut end = s.len().min(self.remaining());
        while !s.is_char_boundary(end) {
            end -= 1;
        }

        self.bytes[self.ind..self.ind + end].copy_from_slice(&s.as_bytes()[..end]);
        self.ind += end;

        if end < s.len() {
            self.truncated = true;
        }
    }

    /// Shortens the contents to at most `len` bytes, never splitting a
    /// character
    pub fn truncate(&mut self, len: usize) {
        if len >= self.ind {
            return;
        }

        let mut end = len;
        while !self.as_ref().is_char_boundary(end) {
            end -= 1;
        }

        self.ind = end;
        self.truncated = true;
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.as_ref())
    }
}

impl<const N: usize> AsRef<str> for FixedStr<N> {
    #[inline]
    fn as_ref(&self) -> &str {
        // Only whole `&str`s, cut at char boundaries, are ever copied in
        unsafe { std::str::from_utf8_unchecked(&self.bytes[..self.ind]) }
    }
}

impl<const N: usize> fmt::Write for FixedStr<N> {
    fn write_str(&mut self, s: &str) -> Result<(), fmt::Error> {
        self.push_str_lossy(s);

        if self.truncated {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

/// A nul terminated [`FixedStr`], used for paths handed to `open(2)` from
/// the signal handler.
pub struct FixedCStr<const N: usize> {
    inner: FixedStr<N>,
}

impl<const N: usize> FixedCStr<N> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            inner: FixedStr::new(),
        }
    }

    /// Copies `bytes`, failing if they contain a nul or don't fit along with
    /// the terminator
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= N || bytes.contains(&0) {
            return None;
        }

        let mut inner = FixedStr::new();
        inner.bytes[..bytes.len()].copy_from_slice(bytes);
        inner.ind = bytes.len();

        Some(Self { inner })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const libc::c_char {
        self.inner.bytes.as_ptr().cast()
    }
}

impl<const N: usize> AsRef<CStr> for FixedCStr<N> {
    #[inline]
    fn as_ref(&self) -> &CStr {
        // Construction guarantees there is no interior nul and at least one
        // zeroed byte after the contents
        unsafe { CStr::from_bytes_with_nul_unchecked(&self.inner.bytes[..self.inner.ind + 1]) }
    }
}

impl<const N: usize> fmt::Debug for FixedCStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cstr: &CStr = self.as_ref();
        fmt::Debug::fmt(cstr, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn simple() {
        let mut fstr = FixedStr::<32>::new();
        write!(&mut fstr, "  #{} {:#018x}", 3, 0x401000usize).unwrap();
        assert_eq!(fstr.as_ref(), "  #3 0x0000000000401000");
        assert!(!fstr.is_truncated());

        let fcstr = FixedCStr::<32>::from_bytes(b"/tmp/crashes/a.crash").unwrap();
        assert_eq!(
            fcstr.as_ref(),
            CStr::from_bytes_with_nul(b"/tmp/crashes/a.crash\0").unwrap()
        );
    }

    #[test]
    fn too_long() {
        let mut fstr = FixedStr::<15>::new();
        assert!(write!(&mut fstr, "signal: {} ({})", "SIGSEGV", 11).is_err());
        assert_eq!(fstr.as_ref(), "signal: SIGSEGV");
        assert!(fstr.is_truncated());

        fstr.clear();
        assert!(fstr.is_empty());
        assert!(!fstr.is_truncated());

        assert!(FixedCStr::<8>::from_bytes(b"12345678").is_none());
        assert!(FixedCStr::<8>::from_bytes(b"12\03").is_none());
    }

    #[test]
    fn never_splits_chars() {
        let mut fstr = FixedStr::<4>::new();
        fstr.push_str_lossy("ab→");
        assert_eq!(fstr.as_ref(), "ab");
        assert!(fstr.is_truncated());

        let mut fstr = FixedStr::<8>::new();
        fstr.push_str_lossy("a→b");
        fstr.truncate(3);
        assert_eq!(fstr.as_ref(), "a");
        assert!(fstr.is_truncated());
    }
}
