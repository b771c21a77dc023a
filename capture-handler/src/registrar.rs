use crate::{
    signals::{DispositionTable, SignalHandler},
    Error,
};
use nix::sys::signal::Signal;

/// Installs `handler` for a single signal
pub fn install_handler<T: DispositionTable>(
    table: &mut T,
    signal: Signal,
    handler: SignalHandler,
) -> Result<(), Error> {
    table.install(signal, handler).map_err(|source| {
        log::error!(
            "unable to install crash handler for {}: {}",
            signal.as_str(),
            source
        );
        Error::Install { signal, source }
    })
}

/// Installs `handler` for every signal in order.
///
/// Stops at the first failure and returns it. Signals before the failing one
/// stay installed, so a partial registration still protects against the
/// signals that did succeed. Installing overwrites whatever was there before,
/// previous handlers are neither kept nor chained to.
pub fn register_all<T: DispositionTable>(
    table: &mut T,
    signals: &[Signal],
    handler: SignalHandler,
) -> Result<(), Error> {
    for signal in signals {
        install_handler(table, *signal, handler)?;
    }

    Ok(())
}

/// Restores the default action for every signal, attempting all of them and
/// returning the first failure
pub fn reset_all<T: DispositionTable>(table: &mut T, signals: &[Signal]) -> Result<(), Error> {
    let mut first_err = None;

    for signal in signals {
        if let Err(source) = table.reset(*signal) {
            log::warn!(
                "unable to reset the disposition of {}: {}",
                signal.as_str(),
                source
            );
            first_err.get_or_insert(Error::Os {
                operation: "sigaction",
                source,
            });
        }
    }

    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::signals::{Disposition, MONITORED_SIGNALS};
    use std::collections::BTreeMap;

    extern "C" fn noop(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {}

    /// In-memory signal table that fails the n-th install
    #[derive(Default)]
    struct FakeTable {
        installed: BTreeMap<i32, usize>,
        installs: usize,
        fail_on: Option<usize>,
    }

    impl DispositionTable for FakeTable {
        fn install(&mut self, signal: Signal, handler: SignalHandler) -> Result<(), errno::Errno> {
            self.installs += 1;
            if self.fail_on == Some(self.installs) {
                return Err(errno::Errno(libc::EINVAL));
            }

            self.installed.insert(signal as i32, handler as usize);
            Ok(())
        }

        fn reset(&mut self, signal: Signal) -> Result<(), errno::Errno> {
            self.installed.remove(&(signal as i32));
            Ok(())
        }

        fn query(&self, signal: Signal) -> Result<Disposition, errno::Errno> {
            Ok(if self.installed.contains_key(&(signal as i32)) {
                Disposition::Foreign
            } else {
                Disposition::Default
            })
        }
    }

    #[test]
    fn partial_registration() {
        let mut table = FakeTable {
            fail_on: Some(3),
            ..Default::default()
        };

        let err = register_all(&mut table, &MONITORED_SIGNALS, noop).unwrap_err();
        assert_eq!(err.os_code(), Some(libc::EINVAL));
        match err {
            Error::Install { signal, .. } => assert_eq!(signal, MONITORED_SIGNALS[2]),
            other => panic!("unexpected error {}", other),
        }

        for (i, signal) in MONITORED_SIGNALS.iter().enumerate() {
            let expected = if i < 2 {
                Disposition::Foreign
            } else {
                Disposition::Default
            };
            assert_eq!(table.query(*signal).unwrap(), expected, "{}", signal.as_str());
        }

        // Only the failing install was attempted past the installed ones
        assert_eq!(table.installs, 3);
    }

    #[test]
    fn registration_overwrites() {
        let mut table = FakeTable::default();

        register_all(&mut table, &MONITORED_SIGNALS, noop).unwrap();
        register_all(&mut table, &MONITORED_SIGNALS, noop).unwrap();

        assert_eq!(table.installed.len(), MONITORED_SIGNALS.len());

        reset_all(&mut table, &MONITORED_SIGNALS).unwrap();
        assert!(table.installed.is_empty());
    }
}
