//! Pull based frame-pointer stack walking.
//!
//! The cursor never allocates and never dereferences a stack address
//! directly, all reads go through a [`MemoryReader`] so that a corrupted
//! frame chain ends the walk instead of faulting inside the handler.

use crate::context::{FaultContext, RegisterSet, StackBounds};
use std::{
    mem,
    sync::atomic::{AtomicU8, Ordering},
};

/// Maximum number of frames to walk when the caller doesn't specify one
pub const MAX_FRAMES: usize = 128;

const WORD: usize = mem::size_of::<usize>();

/// Reads machine words from a stack
pub trait MemoryReader {
    /// Reads the word at `addr`, `None` if it isn't readable
    fn read_word(&self, addr: usize) -> Option<usize>;

    /// The range this reader serves words from
    fn bounds(&self) -> StackBounds;
}

const VM_READ_UNKNOWN: u8 = 0;
const VM_READ_AVAILABLE: u8 = 1;
const VM_READ_UNAVAILABLE: u8 = 2;

/// Whether `process_vm_readv` works in this process, some sandboxes deny it
static VM_READ: AtomicU8 = AtomicU8::new(VM_READ_UNKNOWN);

/// Reads the live memory of the current process.
///
/// Reads go through `process_vm_readv(2)` on our own pid, so an unmapped
/// address makes the syscall fail with `EFAULT` rather than raising a signal.
/// If the syscall is denied, words inside the bounds are read directly once
/// `mincore(2)` confirms their page is mapped. A mapped page without read
/// access still faults, inside the dispatcher that fault hits the default
/// disposition and terminates the process.
pub struct ProcessMemory {
    bounds: StackBounds,
    pid: libc::pid_t,
}

impl ProcessMemory {
    #[inline]
    pub fn new(bounds: StackBounds) -> Self {
        Self {
            bounds,
            pid: unsafe { libc::getpid() },
        }
    }

    /// True if reading an unmapped address inside the bounds is reported as
    /// unreadable instead of faulting
    pub fn is_fault_safe(&self) -> bool {
        if VM_READ.load(Ordering::Relaxed) == VM_READ_UNKNOWN {
            // Reading our own pid is always a valid probe target
            let probe = &self.pid as *const libc::pid_t as usize & !(WORD - 1);
            let _ = self.vm_read(probe);
        }

        VM_READ.load(Ordering::Relaxed) == VM_READ_AVAILABLE
    }

    fn vm_read(&self, addr: usize) -> Result<usize, errno::Errno> {
        let mut word = 0usize;

        let local = libc::iovec {
            iov_base: (&mut word as *mut usize).cast(),
            iov_len: WORD,
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: WORD,
        };

        let read = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };

        if read == WORD as isize {
            VM_READ.store(VM_READ_AVAILABLE, Ordering::Relaxed);
            return Ok(word);
        }

        let err = errno::errno();
        if read == -1 && (err.0 == libc::ENOSYS || err.0 == libc::EPERM) {
            VM_READ.store(VM_READ_UNAVAILABLE, Ordering::Relaxed);
        }

        Err(err)
    }
}

impl MemoryReader for ProcessMemory {
    fn read_word(&self, addr: usize) -> Option<usize> {
        if !self.bounds.contains(addr, WORD) || addr % WORD != 0 {
            return None;
        }

        if VM_READ.load(Ordering::Relaxed) == VM_READ_UNAVAILABLE {
            return read_mapped(addr);
        }

        match self.vm_read(addr) {
            Ok(word) => Some(word),
            Err(_) if VM_READ.load(Ordering::Relaxed) == VM_READ_UNAVAILABLE => read_mapped(addr),
            Err(_) => None,
        }
    }

    #[inline]
    fn bounds(&self) -> StackBounds {
        self.bounds
    }
}

/// Reads `addr` directly if its page is mapped
fn read_mapped(addr: usize) -> Option<usize> {
    let page = addr & !(crate::utils::page_size() - 1);
    let mut residency = 0u8;

    // ENOMEM means the page isn't mapped
    if unsafe { libc::mincore(page as *mut libc::c_void, 1, &mut residency) } != 0 {
        return None;
    }

    Some(unsafe { std::ptr::read_volatile(addr as *const usize) })
}

/// A copy of stack memory that originally lived at `base`
pub struct BufferMemory<'buf> {
    base: usize,
    words: &'buf [usize],
}

impl<'buf> BufferMemory<'buf> {
    /// `words[0]` is the word that was located at `base`
    #[inline]
    pub fn new(base: usize, words: &'buf [usize]) -> Self {
        Self { base, words }
    }

    /// Address the word at `index` originally lived at
    #[inline]
    pub fn address_of(&self, index: usize) -> usize {
        self.base + index * WORD
    }
}

impl<'buf> MemoryReader for BufferMemory<'buf> {
    fn read_word(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        if offset % WORD != 0 {
            return None;
        }

        self.words.get(offset / WORD).copied()
    }

    #[inline]
    fn bounds(&self) -> StackBounds {
        StackBounds::new(self.base, self.base + self.words.len() * WORD)
    }
}

/// A register that can be read from the current frame
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterKind {
    InstructionPointer,
    StackPointer,
    FramePointer,
    LinkRegister,
}

/// The requested register isn't known for the current frame
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("register {0:?} is not available for this frame")]
pub struct NotAvailable(pub RegisterKind);

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WalkError {
    /// The trapped registers can't be the start of a stack walk
    #[error("the machine context cannot seed a stack walk")]
    InvalidContext,
}

/// Result of advancing the cursor
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// The cursor now points at the caller's frame
    Ready,
    /// The chain ended at its root or at the frame limit
    Exhausted,
    /// The chain could not be followed safely, the walk is over
    Corrupted,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CursorState {
    Uninitialized,
    Ready,
    Exhausted,
    Corrupted,
}

/// Walks the frame-pointer chain of a stack one frame at a time.
///
/// Every frame record is two words, `[fp]` holds the caller's frame pointer
/// and `[fp + word]` the return address, which is the layout used on both
/// x86_64 and aarch64. The walk is single pass, once [`Step::Exhausted`] or
/// [`Step::Corrupted`] is returned every further call returns the same.
pub struct FrameCursor<'mem, M: MemoryReader> {
    memory: &'mem M,
    regs: RegisterSet,
    state: CursorState,
    /// Index of the current frame, 0 being the trapped one
    depth: usize,
    max_frames: usize,
    /// Set when the walk stopped at `max_frames` with callers left
    limited: bool,
}

impl<'mem, M: MemoryReader> FrameCursor<'mem, M> {
    pub fn new(memory: &'mem M, max_frames: usize) -> Self {
        Self {
            memory,
            regs: RegisterSet::default(),
            state: CursorState::Uninitialized,
            depth: 0,
            max_frames: max_frames.max(1),
            limited: false,
        }
    }

    /// Seeds the cursor from the registers of a fault
    #[inline]
    pub fn init(&mut self, context: &FaultContext) -> Result<(), WalkError> {
        match context.registers {
            Some(regs) => self.init_registers(regs),
            None => {
                self.state = CursorState::Corrupted;
                Err(WalkError::InvalidContext)
            }
        }
    }

    /// Seeds the cursor from an explicit register set
    pub fn init_registers(&mut self, regs: RegisterSet) -> Result<(), WalkError> {
        if regs.ip == 0 || regs.sp == 0 {
            self.state = CursorState::Corrupted;
            return Err(WalkError::InvalidContext);
        }

        self.regs = regs;
        self.depth = 0;
        self.limited = false;
        self.state = CursorState::Ready;
        Ok(())
    }

    #[inline]
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Index of the frame the cursor points at
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Advances to the caller of the current frame
    pub fn next(&mut self) -> Step {
        match self.state {
            CursorState::Ready => {}
            CursorState::Uninitialized | CursorState::Corrupted => return Step::Corrupted,
            CursorState::Exhausted => return Step::Exhausted,
        }

        let step = self.step();

        self.state = match step {
            Step::Ready => CursorState::Ready,
            Step::Exhausted => CursorState::Exhausted,
            Step::Corrupted => CursorState::Corrupted,
        };

        step
    }

    /// True if the walk ended because the frame limit was hit while the
    /// chain still had a valid caller, as opposed to reaching its root
    #[inline]
    pub fn reached_limit(&self) -> bool {
        self.limited
    }

    fn step(&mut self) -> Step {
        let fp = self.regs.fp;

        // The outermost frame has no caller
        if fp == 0 {
            return Step::Exhausted;
        }

        if fp % WORD != 0 || !self.memory.bounds().contains(fp, 2 * WORD) {
            return Step::Corrupted;
        }

        // A frame record below the stack pointer would belong to a frame
        // that has already returned
        if fp < self.regs.sp {
            return Step::Corrupted;
        }

        let (Some(saved_fp), Some(return_address)) = (
            self.memory.read_word(fp),
            self.memory.read_word(fp + WORD),
        ) else {
            return Step::Corrupted;
        };

        if return_address == 0 {
            return Step::Exhausted;
        }

        // The stack grows down, so every caller's record must be strictly
        // above the current one, otherwise we'd walk in circles
        if saved_fp != 0 && saved_fp <= fp {
            return Step::Corrupted;
        }

        if self.depth + 1 >= self.max_frames {
            self.limited = true;
            return Step::Exhausted;
        }

        self.regs = RegisterSet {
            ip: return_address,
            sp: fp + 2 * WORD,
            fp: saved_fp,
            lr: None,
        };
        self.depth += 1;

        Step::Ready
    }

    /// Reads a register of the current frame
    pub fn register(&self, kind: RegisterKind) -> Result<usize, NotAvailable> {
        if self.state == CursorState::Uninitialized {
            return Err(NotAvailable(kind));
        }

        match kind {
            RegisterKind::InstructionPointer => Ok(self.regs.ip),
            RegisterKind::StackPointer => Ok(self.regs.sp),
            RegisterKind::FramePointer => Ok(self.regs.fp),
            RegisterKind::LinkRegister => self.regs.lr.ok_or(NotAvailable(kind)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    const BASE: usize = 0x7fff_0000;

    /// Lays out `depth` frames, each record two words apart, the outermost
    /// record linking to 0. Returns the stack words and the trapped registers.
    fn synthetic_stack(depth: usize) -> (Vec<usize>, RegisterSet) {
        let mut words = vec![0usize; 2 + depth * 2];

        // Record `i` (for frames 1..depth) is at word index 2 * i
        for frame in 1..depth {
            let record = 2 * frame;
            let caller = if frame + 1 < depth {
                BASE + 2 * (frame + 1) * WORD
            } else {
                0
            };
            words[record] = caller;
            words[record + 1] = 0x40_0000 + frame * 0x100;
        }

        let regs = RegisterSet {
            ip: 0x40_0000,
            sp: BASE,
            fp: if depth > 1 { BASE + 2 * WORD } else { 0 },
            lr: None,
        };

        (words, regs)
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(17)]
    fn walks_exact_depth(#[case] depth: usize) {
        let (words, regs) = synthetic_stack(depth);
        let memory = BufferMemory::new(BASE, &words);

        let mut cursor = FrameCursor::new(&memory, MAX_FRAMES);
        cursor.init_registers(regs).unwrap();

        let mut ips = vec![cursor.register(RegisterKind::InstructionPointer).unwrap()];
        let mut ready = 0;

        loop {
            match cursor.next() {
                Step::Ready => {
                    ready += 1;
                    ips.push(cursor.register(RegisterKind::InstructionPointer).unwrap());
                }
                Step::Exhausted => break,
                Step::Corrupted => panic!("synthetic stack reported as corrupted"),
            }
        }

        assert_eq!(ready, depth - 1);
        assert_eq!(ips.len(), depth);
        assert_eq!(ips[0], 0x40_0000);
        for (frame, ip) in ips.iter().enumerate().skip(1) {
            assert_eq!(*ip, 0x40_0000 + frame * 0x100);
        }

        // sticky
        assert_eq!(cursor.next(), Step::Exhausted);
        assert_eq!(cursor.state(), CursorState::Exhausted);
    }

    #[test]
    fn frame_limit() {
        let (words, regs) = synthetic_stack(10);
        let memory = BufferMemory::new(BASE, &words);

        let mut cursor = FrameCursor::new(&memory, 4);
        cursor.init_registers(regs).unwrap();

        let mut ready = 0;
        while cursor.next() == Step::Ready {
            ready += 1;
        }

        assert_eq!(ready, 3);
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert!(cursor.reached_limit());
    }

    #[test]
    fn root_at_the_frame_limit() {
        let (words, regs) = synthetic_stack(4);
        let memory = BufferMemory::new(BASE, &words);

        let mut cursor = FrameCursor::new(&memory, 4);
        cursor.init_registers(regs).unwrap();

        let mut ready = 0;
        while cursor.next() == Step::Ready {
            ready += 1;
        }

        assert_eq!(ready, 3);
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert!(!cursor.reached_limit());
    }

    #[test]
    fn cycle_is_corrupted() {
        let (mut words, regs) = synthetic_stack(4);
        // Make the outermost record point back at the first one
        words[6] = BASE + 2 * WORD;
        let memory = BufferMemory::new(BASE, &words);

        let mut cursor = FrameCursor::new(&memory, usize::MAX);
        cursor.init_registers(regs).unwrap();

        let mut steps = 0;
        let last = loop {
            let step = cursor.next();
            steps += 1;
            if step != Step::Ready {
                break step;
            }
            assert!(steps < 10, "cursor is looping");
        };

        assert_eq!(last, Step::Corrupted);
        assert_eq!(steps, 3);
        assert_eq!(cursor.next(), Step::Corrupted);
    }

    #[rstest]
    #[case::out_of_bounds(0x1000_0000)]
    #[case::misaligned(BASE + 2 * WORD + 1)]
    fn invalid_link_is_corrupted(#[case] link: usize) {
        let (mut words, regs) = synthetic_stack(4);
        words[2] = link;
        let memory = BufferMemory::new(BASE, &words);

        let mut cursor = FrameCursor::new(&memory, MAX_FRAMES);
        cursor.init_registers(regs).unwrap();

        let mut steps = 0;
        while cursor.next() == Step::Ready {
            steps += 1;
            assert!(steps < 10, "cursor is looping");
        }

        assert_eq!(cursor.state(), CursorState::Corrupted);
    }

    #[test]
    fn invalid_context() {
        let memory = BufferMemory::new(BASE, &[]);
        let mut cursor = FrameCursor::new(&memory, MAX_FRAMES);

        assert_eq!(
            cursor.register(RegisterKind::InstructionPointer),
            Err(NotAvailable(RegisterKind::InstructionPointer))
        );

        assert_eq!(
            cursor.init_registers(RegisterSet::default()),
            Err(WalkError::InvalidContext)
        );
        assert_eq!(cursor.next(), Step::Corrupted);
    }

    #[test]
    fn link_register() {
        let (words, mut regs) = synthetic_stack(2);
        regs.lr = Some(0x1234);
        let memory = BufferMemory::new(BASE, &words);

        let mut cursor = FrameCursor::new(&memory, MAX_FRAMES);
        cursor.init_registers(regs).unwrap();
        assert_eq!(cursor.register(RegisterKind::LinkRegister), Ok(0x1234));

        assert_eq!(cursor.next(), Step::Ready);
        assert_eq!(
            cursor.register(RegisterKind::LinkRegister),
            Err(NotAvailable(RegisterKind::LinkRegister))
        );
        assert_eq!(cursor.register(RegisterKind::StackPointer), Ok(BASE + 4 * WORD));
    }

    #[test]
    fn reads_own_stack() {
        let bounds = StackBounds::current_thread().unwrap();
        let memory = ProcessMemory::new(bounds);

        let local: usize = 0xfeed_f00d;
        let addr = &local as *const usize as usize;
        assert_eq!(memory.read_word(std::hint::black_box(addr)), Some(0xfeed_f00d));

        // Outside of the bounds nothing is read, no matter what is mapped there
        assert_eq!(memory.read_word(bounds.high), None);
        assert_eq!(memory.read_word(addr + 1), None);
    }

    #[test]
    fn unmapped_memory_does_not_fault() {
        let memory = ProcessMemory::new(StackBounds::new(WORD, usize::MAX));
        if !memory.is_fault_safe() {
            return;
        }

        assert_eq!(memory.read_word(WORD), None);
    }
}
