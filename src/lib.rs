//! Writes a plain text report with a symbolicated call stack when the
//! process receives a fatal signal.
//!
//! ```no_run
//! use crash_capture::{Config, CrashReporter, ReportDestination};
//!
//! let reporter = CrashReporter::with_config(
//!     Config::default().report(ReportDestination::Directory("crashes".into())),
//! )
//! .unwrap();
//! reporter.register_and_return_error().unwrap();
//! ```

mod config;
mod error;
mod parked;
mod reporter;

pub use capture_handler::{
    CaptureSummary, Disposition, Signal, SymbolTable, WalkOutcome, MONITORED_SIGNALS,
};
pub use config::{Config, ReportDestination, Symbolication};
pub use error::Error;
pub use reporter::CrashReporter;
