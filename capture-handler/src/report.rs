//! Plain text crash report emitted from the signal handler.
//!
//! Every line is formatted into a fixed buffer on the stack and written with
//! a single `write(2)`, nothing here allocates or takes a lock.

use crate::{
    symbols::ResolvedFrame,
    utils::{self, FixedCStr, FixedStr},
};
use nix::sys::signal::Signal;
use std::{fmt::Write, os::unix::io::RawFd};

/// Longest path a report file can have
pub const MAX_PATH: usize = 512;
/// Longest line of a report, longer lines are truncated
pub const MAX_LINE: usize = 512;

pub const REPORT_HEADER: &str = "*** crash report ***";
pub const REPORT_FOOTER: &str = "*** end of report ***";

/// Where the report is written to
#[derive(Debug)]
pub enum ReportTarget {
    /// An already open descriptor, eg. stderr
    Fd(RawFd),
    /// A file that is created when the report is written
    File(FixedCStr<MAX_PATH>),
}

impl ReportTarget {
    /// Creates a target for the file at `path`, `None` if the path doesn't
    /// fit or contains a nul
    pub fn file(path: &std::path::Path) -> Option<Self> {
        use std::os::unix::ffi::OsStrExt;

        FixedCStr::from_bytes(path.as_os_str().as_bytes()).map(Self::File)
    }

    /// Opens the target, the returned writer closes files it opened itself
    pub fn open(&self) -> Option<ReportWriter> {
        match self {
            Self::Fd(fd) => Some(ReportWriter::new(*fd, false)),
            Self::File(path) => {
                let fd = unsafe {
                    libc::open(
                        path.as_ptr(),
                        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
                        0o600 as libc::c_uint,
                    )
                };

                (fd != -1).then(|| ReportWriter::new(fd, true))
            }
        }
    }
}

/// How the stack walk ended
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WalkOutcome {
    /// The frame chain ended at its root
    Complete,
    /// The configured frame limit was hit
    FrameLimit,
    /// The chain was cut short by a frame that failed validation
    Corrupted,
    /// The machine context couldn't be used to start a walk
    InvalidContext,
}

impl WalkOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::FrameLimit => "frame limit reached",
            Self::Corrupted => "truncated: corrupted stack",
            Self::InvalidContext => "invalid context",
        }
    }
}

/// Writes the lines of a single report to a file descriptor
pub struct ReportWriter {
    fd: RawFd,
    owned: bool,
    line: FixedStr<MAX_LINE>,
    /// Set once any write fails, the rest of the report is still attempted
    failed: bool,
}

impl ReportWriter {
    #[inline]
    pub fn new(fd: RawFd, owned: bool) -> Self {
        Self {
            fd,
            owned,
            line: FixedStr::new(),
            failed: false,
        }
    }

    /// True if every line so far was written out completely
    #[inline]
    pub fn is_ok(&self) -> bool {
        !self.failed
    }

    pub fn header(&mut self, signal: Signal, code: i32, address: usize) {
        self.raw_line(REPORT_HEADER);

        let _ = write!(self.line, "signal: {} ({})", signal.as_str(), signal as i32);
        self.flush_line();
        let _ = write!(self.line, "code: {}", code);
        self.flush_line();
        let _ = write!(self.line, "address: {:#x}", address);
        self.flush_line();

        self.raw_line("frames:");
    }

    pub fn frame(&mut self, frame: &ResolvedFrame<'_>) {
        let _ = write!(self.line, "  #{} {:#018x}", frame.index, frame.ip);

        match frame.symbol {
            Some(sym) => {
                let _ = write!(self.line, " {} + {:#x}", sym.name, sym.offset);
            }
            None => self.line.push_str_lossy(" <unknown>"),
        }

        if let Some(image) = frame.image {
            let _ = write!(self.line, " ({})", image);
        }

        self.flush_line();
    }

    pub fn footer(&mut self, outcome: WalkOutcome) {
        let _ = write!(self.line, "walk: {}", outcome.as_str());
        self.flush_line();
        self.raw_line(REPORT_FOOTER);
    }

    fn raw_line(&mut self, line: &str) {
        self.line.push_str_lossy(line);
        self.flush_line();
    }

    fn flush_line(&mut self) {
        if self.line.remaining() == 0 {
            // Make room for the newline in an overlong line
            self.line.truncate(MAX_LINE - 1);
        }
        self.line.push_str_lossy("\n");

        let mut bytes = self.line.as_bytes();
        while !bytes.is_empty() {
            let written = utils::retry_eintr(|| unsafe {
                libc::write(self.fd, bytes.as_ptr().cast(), bytes.len())
            });

            if written <= 0 {
                self.failed = true;
                break;
            }

            bytes = &bytes[written as usize..];
        }

        self.line.clear();
    }
}

impl Drop for ReportWriter {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::symbols::{Resolution, SymbolRef};
    use std::{io::Read, os::unix::io::AsRawFd};

    fn read_back(file: &mut std::fs::File) -> String {
        use std::io::Seek;

        let mut contents = String::new();
        file.seek(std::io::SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut contents).unwrap();
        contents
    }

    #[test]
    fn layout() {
        let mut file = tempfile::tempfile().unwrap();

        {
            let mut writer = ReportTarget::Fd(file.as_raw_fd()).open().unwrap();
            writer.header(Signal::SIGBUS, 2, 0x1000);
            writer.frame(&ResolvedFrame {
                index: 0,
                ip: 0x401010,
                symbol: Some(SymbolRef {
                    name: "main",
                    address: 0x401000,
                    offset: 0x10,
                }),
                image: Some("/bin/app"),
            });
            writer.frame(&ResolvedFrame::new(1, 0xabc, Resolution::Unknown));
            writer.footer(WalkOutcome::Corrupted);
            assert!(writer.is_ok());
        }

        let expected = "\
*** crash report ***
signal: SIGBUS (7)
code: 2
address: 0x1000
frames:
  #0 0x0000000000401010 main + 0x10 (/bin/app)
  #1 0x0000000000000abc <unknown>
walk: truncated: corrupted stack
*** end of report ***
";

        assert_eq!(read_back(&mut file), expected);
    }

    #[test]
    fn long_lines_are_truncated() {
        let mut file = tempfile::tempfile().unwrap();
        let name = "x".repeat(MAX_LINE * 2);

        {
            let mut writer = ReportWriter::new(file.as_raw_fd(), false);
            writer.frame(&ResolvedFrame {
                index: 0,
                ip: 1,
                symbol: Some(SymbolRef {
                    name: &name,
                    address: 0,
                    offset: 1,
                }),
                image: None,
            });
        }

        let contents = read_back(&mut file);
        assert_eq!(contents.len(), MAX_LINE);
        assert!(contents.ends_with("x\n"));
    }

    #[test]
    fn file_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.crash");

        let target = ReportTarget::file(&path).unwrap();
        {
            let mut writer = target.open().unwrap();
            writer.footer(WalkOutcome::Complete);
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("walk: complete\n{}\n", REPORT_FOOTER));
    }

    #[test]
    fn closed_fd_is_reported() {
        let mut writer = ReportWriter::new(-1, false);
        writer.footer(WalkOutcome::Complete);
        assert!(!writer.is_ok());
    }
}
