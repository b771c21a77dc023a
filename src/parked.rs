//! A thread that captures its own registers and then waits, so its stack
//! stays intact while it is walked as if it had faulted.

use crate::Error;
use capture_handler::{RegisterSet, StackBounds};
use crossbeam::channel;
use std::thread;

/// The captured state of a parked thread
#[derive(Copy, Clone, Debug)]
pub(crate) struct Snapshot {
    pub(crate) registers: RegisterSet,
    pub(crate) stack: StackBounds,
}

pub(crate) struct ParkedThread {
    snapshot: Snapshot,
    release: Option<channel::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ParkedThread {
    /// Spawns the thread and waits until it has captured its context
    pub(crate) fn spawn() -> Result<Self, Error> {
        let (snapshot_tx, snapshot_rx) = channel::bounded(1);
        let (release_tx, release_rx) = channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("crash-capture-parked".to_owned())
            .spawn(move || park(snapshot_tx, release_rx))?;

        let mut parked = Self {
            snapshot: Snapshot {
                registers: RegisterSet::default(),
                stack: StackBounds::new(0, 0),
            },
            release: Some(release_tx),
            handle: Some(handle),
        };

        // Dropping `parked` on failure releases and joins the thread
        parked.snapshot = snapshot_rx
            .recv()
            .ok()
            .flatten()
            .ok_or(Error::ParkedThread)?;

        Ok(parked)
    }

    #[inline]
    pub(crate) fn snapshot(&self) -> Snapshot {
        self.snapshot
    }
}

impl Drop for ParkedThread {
    fn drop(&mut self) {
        // Disconnecting wakes the thread up
        self.release.take();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The context is captured in this frame, which stays live until the thread
/// is released, so everything the registers point at stays valid
#[inline(never)]
fn park(snapshot_tx: channel::Sender<Option<Snapshot>>, release: channel::Receiver<()>) {
    let mut uc = std::mem::MaybeUninit::<libc::ucontext_t>::zeroed();

    let snapshot = if get_context(uc.as_mut_ptr()) {
        let registers = RegisterSet::from_ucontext(unsafe { uc.assume_init_ref() });
        StackBounds::current_thread().map(|stack| Snapshot { registers, stack })
    } else {
        None
    };

    if snapshot_tx.send(snapshot).is_ok() {
        let _ = release.recv();
    }

    // Keeps the context alive, and this frame with it, until release
    std::hint::black_box(&uc);
}

#[cfg(target_env = "gnu")]
#[inline(always)]
fn get_context(uc: *mut libc::ucontext_t) -> bool {
    unsafe { libc::getcontext(uc) == 0 }
}

#[cfg(not(target_env = "gnu"))]
#[inline(always)]
fn get_context(_uc: *mut libc::ucontext_t) -> bool {
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[cfg(target_env = "gnu")]
    fn parks_and_releases() {
        let parked = ParkedThread::spawn().unwrap();
        let snapshot = parked.snapshot();

        assert_ne!(snapshot.registers.ip, 0);
        assert!(snapshot.stack.contains(snapshot.registers.sp, 1));

        // The spawning thread's stack is somewhere else entirely
        let local = 0u64;
        assert!(!snapshot
            .stack
            .contains(&local as *const u64 as usize, 8));

        drop(parked);
    }
}
