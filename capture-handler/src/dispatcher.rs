//! The function the OS invokes for a monitored signal.
//!
//! The order of operations is fixed: disarm every monitored signal, capture,
//! then re-raise. If the capture faults, the fault hits the default
//! disposition and the process terminates instead of re-entering here.

use crate::{
    capture::{capture, CaptureSummary},
    context::FaultContext,
    report::ReportTarget,
    signals::{install_default_handler, MONITORED_SIGNALS},
    symbols::Symbolizer,
    walker::ProcessMemory,
};
use nix::sys::signal::Signal;
use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

/// Everything the dispatcher needs, owned by whoever registered it and
/// reachable from the handler through a process-wide pointer
pub struct DispatchState {
    pub target: ReportTarget,
    pub symbolizer: Symbolizer,
    pub max_frames: usize,
}

impl DispatchState {
    /// Runs the capture step for `fault`, reading live process memory
    pub fn capture(&self, fault: &FaultContext) -> Option<CaptureSummary> {
        let mut writer = self.target.open()?;
        let memory = ProcessMemory::new(fault.stack);

        Some(capture(
            fault,
            &memory,
            &self.symbolizer,
            self.max_frames,
            &mut writer,
        ))
    }
}

static STATE: AtomicPtr<DispatchState> = AtomicPtr::new(ptr::null_mut());

/// Makes `state` the one used by the dispatcher, replacing any previous one
pub fn publish(state: &'static DispatchState) {
    STATE.store(state as *const DispatchState as *mut _, Ordering::Release);
}

/// Withdraws the published state, the dispatcher then only disarms and
/// re-raises
pub fn withdraw() {
    STATE.store(ptr::null_mut(), Ordering::Release);
}

#[inline]
fn published() -> Option<&'static DispatchState> {
    // Only `&'static` references are ever stored
    unsafe { STATE.load(Ordering::Acquire).as_ref() }
}

/// Resets every monitored signal to its default action
pub fn disarm() {
    for signal in MONITORED_SIGNALS {
        install_default_handler(signal as libc::c_int);
    }
}

/// The handler installed for every monitored signal
pub extern "C" fn handle_signal(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    disarm();

    if let (Some(state), Ok(signal)) = (published(), Signal::try_from(signum)) {
        // The kernel hands us valid pointers for SA_SIGINFO handlers
        let fault = unsafe { FaultContext::from_trap(signal, info, uc) };
        let _ = state.capture(&fault);
    }

    reraise(signum);
}

/// Sends `signum` to the current thread again. It stays pending until the
/// handler returns and is then delivered with the default disposition.
fn reraise(signum: libc::c_int) {
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid);
        if libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signum) < 0 {
            // If we can't signal ourselves (eg. a sandbox disallows it) we
            // can still terminate, just without the right exit status
            libc::_exit(1);
        }
    }
}
