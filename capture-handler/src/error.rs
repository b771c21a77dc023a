use nix::sys::signal::Signal;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The alternate signal stack could not be mapped
    #[error("unable to allocate the alternate signal stack")]
    OutOfMemory,
    /// A system call needed for registration failed
    #[error("{operation} failed: {source}")]
    Os {
        operation: &'static str,
        #[source]
        source: errno::Errno,
    },
    /// Installing the dispatcher for a specific signal failed
    #[error("unable to install the crash handler for {}: {source}", signal.as_str())]
    Install {
        signal: Signal,
        #[source]
        source: errno::Errno,
    },
    /// Another owner already holds the process signal table
    #[error("the process signal dispositions are already owned by another handler")]
    DispositionsClaimed,
    #[error("failed to parse ELF image: {0}")]
    Elf(#[from] goblin::error::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The operating system error code, if this error originated from a
    /// failed system call
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } | Self::Install { source, .. } => Some(source.0),
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn last_os(operation: &'static str) -> Self {
        Self::Os {
            operation,
            source: errno::errno(),
        }
    }
}
