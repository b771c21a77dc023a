use crate::{parked::ParkedThread, Config, Error};
use capture_handler::{
    dispatcher, registrar, AltStack, CaptureSummary, DispatchState, Disposition,
    DispositionTable, FaultContext, OsDispositions, Signal, MONITORED_SIGNALS,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

static SHARED: OnceCell<CrashReporter> = OnceCell::new();

/// Captures a report for every fatal signal the process receives.
///
/// There is at most one per process, it owns the process' dispositions for
/// the monitored signals for as long as it lives, which is forever.
pub struct CrashReporter {
    alt_stack: AltStack,
    dispositions: Mutex<OsDispositions>,
    dispatch: DispatchState,
    report_path: Option<PathBuf>,
}

impl CrashReporter {
    /// The process wide reporter, created with the default [`Config`] the
    /// first time this is called
    pub fn shared() -> Result<&'static Self, Error> {
        SHARED.get_or_try_init(|| Self::new(Config::default()))
    }

    /// Creates the process wide reporter with `config`. This should be done
    /// once early during startup, before anything calls [`Self::shared`].
    pub fn with_config(config: Config) -> Result<&'static Self, Error> {
        let mut created = false;
        let reporter = SHARED.get_or_try_init(|| {
            created = true;
            Self::new(config)
        })?;

        if created {
            Ok(reporter)
        } else {
            Err(Error::AlreadyInitialized)
        }
    }

    fn new(config: Config) -> Result<Self, Error> {
        let dispositions =
            OsDispositions::claim().ok_or(capture_handler::Error::DispositionsClaimed)?;
        let alt_stack = AltStack::allocate(config.alt_stack_size)?;
        let (target, report_path) = config.report.target()?;

        let dispatch = DispatchState {
            target,
            symbolizer: config.symbolication.into_symbolizer(),
            max_frames: config.max_frames,
        };

        Ok(Self {
            alt_stack,
            dispositions: Mutex::new(dispositions),
            dispatch,
            report_path,
        })
    }

    /// Installs the crash dispatcher for every monitored signal, replacing
    /// whatever handlers were installed before.
    ///
    /// The alternate stack is activated for the calling thread only. Calling
    /// this again is harmless and leaves the same state behind. If installing
    /// a handler fails, the signals before it in [`MONITORED_SIGNALS`] stay
    /// installed.
    pub fn register_and_return_error(&'static self) -> Result<(), Error> {
        let mut dispositions = self.dispositions.lock();

        self.alt_stack.activate()?;
        dispatcher::publish(&self.dispatch);

        registrar::register_all(
            &mut *dispositions,
            &MONITORED_SIGNALS,
            dispatcher::handle_signal,
        )?;

        log::debug!(
            "crash dispatcher installed for {} signals, reports go to {:?}",
            MONITORED_SIGNALS.len(),
            self.dispatch.target
        );

        Ok(())
    }

    /// Restores the default action of every monitored signal and the calling
    /// thread's previous alternate stack
    pub fn unregister(&self) -> Result<(), Error> {
        let mut dispositions = self.dispositions.lock();

        let reset = registrar::reset_all(&mut *dispositions, &MONITORED_SIGNALS);
        dispatcher::withdraw();
        let restored = self.alt_stack.deactivate();

        reset?;
        restored?;
        Ok(())
    }

    /// The current disposition of `signal`
    pub fn disposition(&self, signal: Signal) -> Result<Disposition, Error> {
        self.dispositions.lock().query(signal).map_err(|source| {
            capture_handler::Error::Os {
                operation: "sigaction",
                source,
            }
            .into()
        })
    }

    /// Runs the capture step as if `signal` had been raised, writing a full
    /// report to the configured destination.
    ///
    /// The walked stack belongs to a helper thread parked for the duration
    /// of the capture. Nothing is disarmed or re-raised, the process keeps
    /// running normally afterwards.
    pub fn test_dispatch(
        &self,
        signal: Signal,
        code: i32,
        address: usize,
    ) -> Result<CaptureSummary, Error> {
        let parked = ParkedThread::spawn()?;
        let snapshot = parked.snapshot();

        let fault =
            FaultContext::synthetic(signal, code, address, snapshot.registers, snapshot.stack);

        let summary = self
            .dispatch
            .capture(&fault)
            .ok_or_else(std::io::Error::last_os_error)?;

        drop(parked);
        Ok(summary)
    }

    /// The file reports are written to, when reporting to a directory
    pub fn report_path(&self) -> Option<&Path> {
        self.report_path.as_deref()
    }
}
