#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("handler error: {0}")]
    Handler(#[from] capture_handler::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Report paths are written from the signal handler and must fit into a
    /// fixed buffer without interior nuls
    #[error("{} can't be used as a report path", .0.display())]
    ReportPath(std::path::PathBuf),
    /// Only one reporter can exist in the process
    #[error("a crash reporter has already been created")]
    AlreadyInitialized,
    /// The thread used for test dispatches couldn't capture its own context
    #[error("unable to capture the context of the parked thread")]
    ParkedThread,
}

impl Error {
    /// The operating system error code, if any system call is at the root of
    /// this error
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Handler(e) => e.os_code(),
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
