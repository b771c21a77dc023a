use crate::Error;
use capture_handler::{
    alt_stack, walker, DladdrResolver, ReportTarget, SymbolTable, Symbolizer,
};
use std::{
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

/// Where crash reports go
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ReportDestination {
    #[default]
    Stderr,
    /// A descriptor that stays open for the life of the process
    Fd(RawFd),
    /// A directory, each process writes to its own `<uuid>.crash` file in it
    Directory(PathBuf),
}

impl ReportDestination {
    /// Resolves the destination to a target usable from the signal handler,
    /// along with the report file's path if there is one
    pub(crate) fn target(&self) -> Result<(ReportTarget, Option<PathBuf>), Error> {
        match self {
            Self::Stderr => Ok((ReportTarget::Fd(libc::STDERR_FILENO), None)),
            Self::Fd(fd) => Ok((ReportTarget::Fd(*fd), None)),
            Self::Directory(dir) => {
                std::fs::create_dir_all(dir)?;

                let path = report_path(dir);
                let target =
                    ReportTarget::file(&path).ok_or_else(|| Error::ReportPath(path.clone()))?;

                Ok((target, Some(path)))
            }
        }
    }
}

fn report_path(dir: &Path) -> PathBuf {
    let mut name = uuid::Uuid::new_v4().simple().to_string();
    name.push_str(".crash");
    dir.join(name)
}

/// How instruction pointers are turned into symbol names
#[derive(Clone, Debug, Default)]
pub enum Symbolication {
    /// Preload the symbols of the running executable
    #[default]
    Executable,
    /// Ask the dynamic loader at crash time
    Dladdr,
    /// Only report addresses
    Disabled,
    /// Use an already built table
    Table(SymbolTable),
}

impl Symbolication {
    pub(crate) fn into_symbolizer(self) -> Symbolizer {
        match self {
            Self::Executable => match SymbolTable::from_current_exe() {
                Ok(table) => Symbolizer::Table(table),
                Err(e) => {
                    log::warn!("unable to load symbols of the current executable: {}", e);
                    Symbolizer::Disabled
                }
            },
            Self::Dladdr => Symbolizer::Dladdr(DladdrResolver),
            Self::Disabled => Symbolizer::Disabled,
            Self::Table(table) => Symbolizer::Table(table),
        }
    }
}

/// Options for a [`CrashReporter`](crate::CrashReporter)
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) alt_stack_size: usize,
    pub(crate) max_frames: usize,
    pub(crate) report: ReportDestination,
    pub(crate) symbolication: Symbolication,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alt_stack_size: alt_stack::MIN_STACK_SIZE,
            max_frames: walker::MAX_FRAMES,
            report: ReportDestination::default(),
            symbolication: Symbolication::default(),
        }
    }
}

impl Config {
    /// Lower bound for the size of the alternate signal stack, sizes below
    /// the platform minimum are raised to it
    pub fn alt_stack_size(mut self, size: usize) -> Self {
        self.alt_stack_size = size;
        self
    }

    /// The most frames written for a single crash, at least 1
    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames.max(1);
        self
    }

    pub fn report(mut self, report: ReportDestination) -> Self {
        self.report = report;
        self
    }

    pub fn symbolication(mut self, symbolication: Symbolication) -> Self {
        self.symbolication = symbolication;
        self
    }
}
