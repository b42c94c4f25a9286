//! Login accounting hooks
//!
//! A session can be announced to utmp/wtmp style bookkeeping while it runs.
//! Accounting failures are reported to the caller, which only logs them.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::grant::HELPER_FD;

/// Default location of the utempter helper
pub const DEFAULT_UTEMPTER: &str = "/usr/sbin/utempter";

/// Receives session start and end notifications
pub trait Accounting {
    /// Called after launch with the master and the subordinate device
    fn register(&mut self, master: BorrowedFd<'_>, device: &Path) -> io::Result<()>;

    /// Called once on teardown for a registered session
    fn deregister(&mut self, master: BorrowedFd<'_>, device: &Path) -> io::Result<()>;
}

/// Does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccounting;

impl Accounting for NoAccounting {
    fn register(&mut self, _: BorrowedFd<'_>, _: &Path) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _: BorrowedFd<'_>, _: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Records sessions through the setgid `utempter` program.
///
/// `utempter` finds the terminal from the master, which it expects on
/// stdin, stdout and descriptor 3.
#[derive(Debug, Clone)]
pub struct UtempterAccounting {
    program: PathBuf,
}

impl Default for UtempterAccounting {
    fn default() -> Self {
        Self::new(DEFAULT_UTEMPTER)
    }
}

impl UtempterAccounting {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn run(&self, master: BorrowedFd<'_>, args: &[&std::ffi::OsStr]) -> io::Result<()> {
        let raw = master.as_raw_fd();
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::from(master.try_clone_to_owned()?))
            .stdout(Stdio::from(master.try_clone_to_owned()?))
            .stderr(Stdio::null());
        unsafe {
            command.pre_exec(move || {
                let rc = if raw == HELPER_FD {
                    libc::fcntl(raw, libc::F_SETFD, 0)
                } else {
                    libc::dup2(raw, HELPER_FD)
                };
                if rc < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let status = command.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} failed: {}", self.program.display(), status),
            ))
        }
    }
}

impl Accounting for UtempterAccounting {
    fn register(&mut self, master: BorrowedFd<'_>, device: &Path) -> io::Result<()> {
        self.run(master, &["-a".as_ref(), device.as_os_str(), "".as_ref()])
    }

    fn deregister(&mut self, master: BorrowedFd<'_>, device: &Path) -> io::Result<()> {
        self.run(master, &["-d".as_ref(), device.as_os_str()])
    }
}
