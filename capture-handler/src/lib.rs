//! The parts of crash capture that run inside a fatal signal handler, or
//! prepare everything such a handler needs.
//!
//! Nothing reachable from [`dispatcher::handle_signal`] allocates, locks or
//! uses `std` I/O. Everything that does (loading symbols, creating the
//! alternate stack, installing handlers) happens up front during
//! registration.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("capture-handler only supports Linux and Android");

mod error;
pub use error::Error;

pub mod alt_stack;
pub mod capture;
pub mod context;
pub mod dispatcher;
pub mod registrar;
pub mod report;
pub mod signals;
pub mod symbols;
pub mod utils;
pub mod walker;

pub use alt_stack::AltStack;
pub use capture::{capture, CaptureSummary};
pub use context::{FaultContext, RegisterSet, StackBounds};
pub use dispatcher::DispatchState;
pub use nix::sys::signal::Signal;
pub use report::{ReportTarget, ReportWriter, WalkOutcome};
pub use signals::{Disposition, DispositionTable, OsDispositions, MONITORED_SIGNALS};
pub use symbols::{
    DladdrResolver, ResolvedFrame, Resolution, SymbolResolver, SymbolTable, Symbolizer,
};
pub use walker::{BufferMemory, FrameCursor, MemoryReader, ProcessMemory, RegisterKind, Step};
