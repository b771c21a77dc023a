//! Thin ownership wrapper around the process-wide signal disposition table.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::{
    mem, ptr,
    sync::atomic::{AtomicBool, Ordering},
};

/// The fatal signals the dispatcher is installed for, in registration order
pub const MONITORED_SIGNALS: [Signal; 5] = [
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGSEGV,
];

/// Signature of a `SA_SIGINFO` handler
pub type SignalHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// What the OS will currently do when a signal is delivered
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// `SIG_DFL`
    Default,
    /// `SIG_IGN`
    Ignore,
    /// The crash dispatcher of this crate
    Dispatcher {
        on_alt_stack: bool,
        siginfo: bool,
    },
    /// Some handler installed by another component
    Foreign,
}

/// The operations the registrar needs on the OS signal table
pub trait DispositionTable {
    /// Installs `handler` for `signal`, running on the alternate stack with
    /// extended fault information and an empty handler mask
    fn install(&mut self, signal: Signal, handler: SignalHandler) -> Result<(), errno::Errno>;
    /// Restores the default action for `signal`
    fn reset(&mut self, signal: Signal) -> Result<(), errno::Errno>;
    /// Queries the current action for `signal`
    fn query(&self, signal: Signal) -> Result<Disposition, errno::Errno>;
}

static CLAIMED: AtomicBool = AtomicBool::new(false);

/// The real signal table of the process. Only one of these can exist at a
/// time, which keeps a single owner for every monitored signal.
#[derive(Debug)]
pub struct OsDispositions {
    _private: (),
}

impl OsDispositions {
    /// Takes ownership of the process signal table, or `None` if it is
    /// already owned
    pub fn claim() -> Option<Self> {
        CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { _private: () })
    }
}

impl Drop for OsDispositions {
    fn drop(&mut self) {
        CLAIMED.store(false, Ordering::Release);
    }
}

impl DispositionTable for OsDispositions {
    fn install(&mut self, signal: Signal, handler: SignalHandler) -> Result<(), errno::Errno> {
        // `SigHandler::SigAction` implies SA_SIGINFO
        let action = SigAction::new(
            SigHandler::SigAction(handler),
            SaFlags::SA_ONSTACK,
            SigSet::empty(),
        );

        unsafe { signal::sigaction(signal, &action) }
            .map(|_previous| ())
            .map_err(|e| errno::Errno(e as i32))
    }

    fn reset(&mut self, signal: Signal) -> Result<(), errno::Errno> {
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());

        unsafe { signal::sigaction(signal, &action) }
            .map(|_previous| ())
            .map_err(|e| errno::Errno(e as i32))
    }

    fn query(&self, signal: Signal) -> Result<Disposition, errno::Errno> {
        query_disposition(signal)
    }
}

/// Reads the current action for `signal` without modifying it
pub fn query_disposition(signal: Signal) -> Result<Disposition, errno::Errno> {
    unsafe {
        let mut current: libc::sigaction = mem::zeroed();
        if libc::sigaction(signal as libc::c_int, ptr::null(), &mut current) == -1 {
            return Err(errno::errno());
        }

        let dispatcher = crate::dispatcher::handle_signal as SignalHandler as libc::sighandler_t;

        Ok(match current.sa_sigaction {
            libc::SIG_DFL => Disposition::Default,
            libc::SIG_IGN => Disposition::Ignore,
            handler if handler == dispatcher => Disposition::Dispatcher {
                on_alt_stack: current.sa_flags & libc::SA_ONSTACK != 0,
                siginfo: current.sa_flags & libc::SA_SIGINFO != 0,
            },
            _ => Disposition::Foreign,
        })
    }
}

/// Restores the default action for `signal`. Async-signal-safe, this is what
/// the dispatcher uses to disarm itself.
pub(crate) fn install_default_handler(sig: libc::c_int) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones, and a request to set SIG_DFL through them can be ignored, which
    // would loop forever on a re-raised signal. Go to the syscall directly.
    unsafe {
        if cfg!(target_os = "android") {
            let mut sa: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut sa.sa_mask);
            sa.sa_sigaction = libc::SIG_DFL;
            sa.sa_flags = libc::SA_RESTART;
            libc::syscall(
                libc::SYS_rt_sigaction,
                sig,
                &sa,
                ptr::null::<libc::sigaction>(),
                mem::size_of::<libc::sigset_t>(),
            );
        } else {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}
