use nix::sys::signal::Signal;

/// How far above the trapped stack pointer the walker may read when the
/// exact bounds of the faulting thread's stack are unknown
pub const MAX_STACK_SPAN: usize = 64 * 1024 * 1024;

/// The registers of a single frame that the walker works with
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterSet {
    /// Instruction pointer (RIP on x86_64, PC on aarch64)
    pub ip: usize,
    /// Stack pointer (RSP on x86_64, SP on aarch64)
    pub sp: usize,
    /// Frame pointer (RBP on x86_64, X29 on aarch64)
    pub fp: usize,
    /// Link register (X30), only meaningful on aarch64
    pub lr: Option<usize>,
}

impl RegisterSet {
    /// Extracts the registers from a trapped or `getcontext`ed context
    pub fn from_ucontext(uc: &libc::ucontext_t) -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                let gregs = &uc.uc_mcontext.gregs;

                Self {
                    ip: gregs[libc::REG_RIP as usize] as usize,
                    sp: gregs[libc::REG_RSP as usize] as usize,
                    fp: gregs[libc::REG_RBP as usize] as usize,
                    lr: None,
                }
            } else if #[cfg(target_arch = "aarch64")] {
                let mc = &uc.uc_mcontext;

                Self {
                    ip: mc.pc as usize,
                    sp: mc.sp as usize,
                    fp: mc.regs[29] as usize,
                    lr: Some(mc.regs[30] as usize),
                }
            } else {
                compile_error!("unsupported target architecture");
            }
        }
    }
}

/// The address range a walker is allowed to read stack memory from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest readable address, inclusive
    pub low: usize,
    /// One past the highest readable address
    pub high: usize,
}

impl StackBounds {
    #[inline]
    pub fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    /// Bounds for a trapped thread whose real stack extent is unknown. The
    /// stack grows down, so everything live is at or above `sp`.
    #[inline]
    pub fn from_stack_pointer(sp: usize) -> Self {
        Self {
            low: sp,
            high: sp.saturating_add(MAX_STACK_SPAN),
        }
    }

    /// Exact bounds of the calling thread's stack.
    ///
    /// Not async-signal-safe, only call this outside of a signal handler.
    pub fn current_thread() -> Option<Self> {
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                return None;
            }

            let mut addr = std::ptr::null_mut();
            let mut size = 0;
            let res = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
            libc::pthread_attr_destroy(&mut attr);

            (res == 0).then(|| Self {
                low: addr as usize,
                high: addr as usize + size,
            })
        }
    }

    /// True if `len` bytes starting at `addr` are inside the bounds
    #[inline]
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.low
            && addr
                .checked_add(len)
                .map_or(false, |end| end <= self.high)
    }
}

/// Everything known about a fault, valid for the duration of one dispatch
#[derive(Copy, Clone, Debug)]
pub struct FaultContext {
    pub signal: Signal,
    /// `si_code` of the signal
    pub code: i32,
    /// The faulting address, `si_addr`
    pub address: usize,
    /// The registers at the time of the fault, `None` if the kernel didn't
    /// hand us a usable context
    pub registers: Option<RegisterSet>,
    /// Where stack memory may be read from
    pub stack: StackBounds,
}

impl FaultContext {
    /// Builds the context from the arguments of a `SA_SIGINFO` handler
    ///
    /// # Safety
    ///
    /// `info` and `uc` must either be null or point to the structures the
    /// kernel passed to the signal handler.
    pub unsafe fn from_trap(
        signal: Signal,
        info: *const libc::siginfo_t,
        uc: *const libc::c_void,
    ) -> Self {
        // `si_addr` is only filled in for faults the kernel raised, for
        // signals sent by a process (si_code <= 0) the same memory holds the
        // sender's pid and uid
        let (code, address) = match info.as_ref() {
            Some(info) if info.si_code > 0 => (info.si_code, info.si_addr() as usize),
            Some(info) => (info.si_code, 0),
            None => (0, 0),
        };

        let registers = uc
            .cast::<libc::ucontext_t>()
            .as_ref()
            .map(RegisterSet::from_ucontext);

        let stack = StackBounds::from_stack_pointer(registers.map_or(0, |regs| regs.sp));

        Self {
            signal,
            code,
            address,
            registers,
            stack,
        }
    }

    /// Builds a context for a synthetic fault from already captured
    /// registers, eg. those of a parked thread
    pub fn synthetic(
        signal: Signal,
        code: i32,
        address: usize,
        registers: RegisterSet,
        stack: StackBounds,
    ) -> Self {
        Self {
            signal,
            code,
            address,
            registers: Some(registers),
            stack,
        }
    }
}
