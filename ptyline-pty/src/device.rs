//! PTY device allocation
//!
//! Not all pty implementations are created equal, so a master/subordinate
//! pair is found by trying several strategies in order:
//!
//! 1. `openpty(3)`, which opens both sides in one call
//! 2. the Unix98 multiplexer `/dev/ptmx` (`posix_openpt`, `ptsname`, `unlockpt`)
//! 3. legacy BSD device names `/dev/ptyXY` paired with `/dev/ttyXY`
//!
//! Reference: https://www.man7.org/linux/man-pages/man7/pty.7.html

use std::ffi::{CStr, OsStr};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, posix_openpt, unlockpt};
use nix::unistd::{access, geteuid, AccessFlags};

use crate::error::DeviceError;
use crate::grant;

/// First character of legacy BSD pty names
const LEGACY_MAJOR: &[u8] = b"pqrstuvwxyzabcdefghijklmno";
/// Second character of legacy BSD pty names
const LEGACY_MINOR: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A way of obtaining a master/subordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// `openpty(3)`
    Combined,
    /// `/dev/ptmx`
    Unix98,
    /// `/dev/ptyXY` enumeration
    Legacy,
}

impl Strategy {
    /// All strategies in preference order
    pub const ALL: [Strategy; 3] = [Strategy::Combined, Strategy::Unix98, Strategy::Legacy];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Combined => "openpty",
            Strategy::Unix98 => "ptmx",
            Strategy::Legacy => "bsd",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openpty" | "combined" => Ok(Strategy::Combined),
            "ptmx" | "unix98" => Ok(Strategy::Unix98),
            "bsd" | "legacy" => Ok(Strategy::Legacy),
            other => Err(format!("unknown pty strategy '{}'", other)),
        }
    }
}

/// An allocated master/subordinate pair.
///
/// Owns the master descriptor for the whole session. The subordinate
/// descriptor is only present when the strategy opened it; it is handed
/// to the child and dropped by the parent at launch.
pub struct PtyHandle {
    master: File,
    subordinate: Option<OwnedFd>,
    subordinate_path: PathBuf,
    master_path: PathBuf,
    needs_grant: bool,
    strategy: Strategy,
}

impl PtyHandle {
    /// Path of the subordinate device (`/dev/pts/N`, `/dev/ttyXY`)
    pub fn subordinate_path(&self) -> &Path {
        &self.subordinate_path
    }

    /// Path of the master device
    pub fn master_path(&self) -> &Path {
        &self.master_path
    }

    /// Whether the subordinate still has to be granted through the helper
    pub fn needs_grant(&self) -> bool {
        self.needs_grant
    }

    /// Strategy that produced this pair
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// The subordinate descriptor, if it is still open in this process
    pub fn subordinate(&self) -> Option<BorrowedFd<'_>> {
        self.subordinate.as_ref().map(|fd| fd.as_fd())
    }

    /// Close this process's copy of the subordinate
    pub fn close_subordinate(&mut self) {
        self.subordinate = None;
    }
}

impl fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyHandle")
            .field("master_fd", &self.master.as_raw_fd())
            .field("subordinate_path", &self.subordinate_path)
            .field("master_path", &self.master_path)
            .field("needs_grant", &self.needs_grant)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl AsFd for PtyHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

impl AsRawFd for PtyHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

impl Read for PtyHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.master.read(buf)
    }
}

impl Write for PtyHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.master.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.master.flush()
    }
}

/// Finds and opens a pty pair
#[derive(Debug, Clone)]
pub struct DeviceAllocator {
    strategies: Vec<Strategy>,
}

impl Default for DeviceAllocator {
    fn default() -> Self {
        Self {
            strategies: Strategy::ALL.to_vec(),
        }
    }
}

impl DeviceAllocator {
    /// Allocator restricted to the given strategies, tried in order
    pub fn with_strategies(strategies: Vec<Strategy>) -> Self {
        Self { strategies }
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// Open a pty pair with the first strategy that works.
    ///
    /// The returned master is in non-blocking mode.
    pub fn allocate(&self) -> Result<PtyHandle, DeviceError> {
        for &strategy in &self.strategies {
            let attempt = match strategy {
                Strategy::Combined => open_combined(),
                Strategy::Unix98 => open_unix98(),
                Strategy::Legacy => open_legacy(),
            };
            match attempt {
                Ok(handle) => {
                    set_nonblocking(handle.master.as_fd()).map_err(DeviceError::NonBlocking)?;
                    log::debug!(
                        "Allocated pty {:?} via {} (needs grant: {})",
                        handle.subordinate_path,
                        strategy,
                        handle.needs_grant
                    );
                    return Ok(handle);
                }
                Err(e) => log::debug!("pty strategy {} failed: {}", strategy, e),
            }
        }

        log::error!("No pseudo-terminal device could be opened");
        Err(DeviceError::NoPtyAvailable)
    }
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> nix::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn open_combined() -> io::Result<PtyHandle> {
    let pair = openpty(None, None).map_err(io::Error::from)?;

    let subordinate_path =
        ttyname_of(pair.slave.as_fd()).or_else(|_| ptsname_of(pair.master.as_fd()))?;
    let master_path = ttyname_of(pair.master.as_fd()).unwrap_or_default();

    // The pair is usable either way; failing to restrict it only means the
    // helper has to do it.
    let needs_grant = match grant::restrict_to_tty_group(&subordinate_path) {
        Ok(()) => false,
        Err(e) => {
            log::warn!("Cannot secure {:?} directly: {}", subordinate_path, e);
            true
        }
    };

    Ok(PtyHandle {
        master: File::from(pair.master),
        subordinate: Some(pair.slave),
        subordinate_path,
        master_path,
        needs_grant,
        strategy: Strategy::Combined,
    })
}

fn open_unix98() -> io::Result<PtyHandle> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(io::Error::from)?;
    let subordinate_path = ptsname_of(master.as_fd())?;
    unlockpt(&master).map_err(io::Error::from)?;

    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    Ok(PtyHandle {
        master: File::from(master),
        subordinate: None,
        subordinate_path,
        master_path: PathBuf::from("/dev/ptmx"),
        needs_grant: true,
        strategy: Strategy::Unix98,
    })
}

fn open_legacy() -> io::Result<PtyHandle> {
    let is_root = geteuid().is_root();

    for &major in LEGACY_MAJOR {
        for &minor in LEGACY_MINOR {
            let suffix = format!("{}{}", major as char, minor as char);
            let master_path = PathBuf::from(format!("/dev/pty{}", suffix));
            let subordinate_path = PathBuf::from(format!("/dev/tty{}", suffix));

            let master = match OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NOCTTY)
                .open(&master_path)
            {
                Ok(file) => file,
                Err(_) => continue,
            };

            if is_root || access(&subordinate_path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok() {
                return Ok(PtyHandle {
                    master,
                    subordinate: None,
                    subordinate_path,
                    master_path,
                    needs_grant: true,
                    strategy: Strategy::Legacy,
                });
            }
            // master dropped here, the pair is in use by someone else
        }
    }

    Err(io::Error::new(io::ErrorKind::NotFound, "no free legacy pty device"))
}

/// Subordinate path of a master descriptor
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn ptsname_of(fd: BorrowedFd<'_>) -> io::Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    let rc = unsafe { libc::ptsname_r(fd.as_raw_fd(), buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(path_from_cstr(unsafe { CStr::from_ptr(buf.as_ptr()) }))
}

/// Subordinate path of a master descriptor
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn ptsname_of(fd: BorrowedFd<'_>) -> io::Result<PathBuf> {
    // Not reentrant, but everything here runs on one thread.
    let name = unsafe { libc::ptsname(fd.as_raw_fd()) };
    if name.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(path_from_cstr(unsafe { CStr::from_ptr(name) }))
}

/// Device path of an open terminal descriptor
pub fn ttyname_of(fd: BorrowedFd<'_>) -> io::Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    let rc = unsafe { libc::ttyname_r(fd.as_raw_fd(), buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(path_from_cstr(unsafe { CStr::from_ptr(buf.as_ptr()) }))
}

fn path_from_cstr(name: &CStr) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(name.to_bytes()))
}
