//! Subordinate device permissions
//!
//! The subordinate side of a pty has to be owned by the user and writable
//! only by the `tty` group, otherwise other local users can read or inject
//! keystrokes. Where the device cannot be adjusted directly (a leftover
//! legacy device still owned by its previous user, for example) a small
//! privileged helper is run instead:
//!
//! ```text
//! <helper> --grant|--revoke      master pty on descriptor 3, exit 0 on success
//! ```
//!
//! Failing to secure a device is never fatal; the caller logs it and the
//! session runs unsecured.

use std::ffi::CString;
use std::fs;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chown, fork, getgid, getuid, ForkResult, Gid, Group, Uid};

use crate::device::{self, PtyHandle};
use crate::error::GrantError;
use crate::launch::pointers;
use crate::reaper;

/// Descriptor on which the helper receives the master pty
pub const HELPER_FD: RawFd = 3;

/// Group that owns terminal devices
const TTY_GROUP: &str = "tty";

/// Owner read/write, group write
const GRANTED_MODE: u32 = 0o620;
/// Owner read/write only
const REVOKED_MODE: u32 = 0o600;

const GROUP_WRITE: u32 = 0o020;
const OTHER_WRITE: u32 = 0o002;

/// One helper at a time, so SIGCHLD dispositions are saved and restored in
/// order
static HELPER_LOCK: Mutex<()> = Mutex::new(());

/// Operation requested from the helper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperOp {
    Grant,
    Revoke,
}

impl HelperOp {
    /// Command-line flag for this operation
    pub fn flag(self) -> &'static str {
        match self {
            HelperOp::Grant => "--grant",
            HelperOp::Revoke => "--revoke",
        }
    }

    /// Parse the helper's argument list (without argv[0])
    pub fn from_args<I, S>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = args.into_iter();
        let op = match args.next()?.as_ref() {
            "--grant" => HelperOp::Grant,
            "--revoke" => HelperOp::Revoke,
            _ => return None,
        };
        if args.next().is_some() {
            return None;
        }
        Some(op)
    }
}

/// How a handle gets secured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism<'a> {
    /// chown/chmod from this process
    Direct,
    /// fork and exec the privileged helper
    Helper(&'a Path),
}

/// Grants and revokes access to subordinate devices
#[derive(Debug, Clone, Default)]
pub struct PermissionBroker {
    helper: Option<PathBuf>,
}

impl PermissionBroker {
    pub fn new(helper: Option<PathBuf>) -> Self {
        Self { helper }
    }

    pub fn helper(&self) -> Option<&Path> {
        self.helper.as_deref()
    }

    /// Mechanism used for `handle`.
    ///
    /// Handles that still need a grant go through the helper when one is
    /// configured; without a helper the direct route is attempted anyway.
    pub fn mechanism_for(&self, handle: &PtyHandle) -> Mechanism<'_> {
        match (&self.helper, handle.needs_grant()) {
            (Some(helper), true) => Mechanism::Helper(helper),
            _ => Mechanism::Direct,
        }
    }

    /// Make the subordinate usable by the invoking user only
    pub fn grant(&self, handle: &PtyHandle) -> Result<(), GrantError> {
        match self.mechanism_for(handle) {
            Mechanism::Direct => restrict_to_tty_group(handle.subordinate_path()),
            Mechanism::Helper(helper) => run_helper(helper, handle.as_fd(), HelperOp::Grant),
        }
    }

    /// Undo [`grant`](Self::grant)
    pub fn revoke(&self, handle: &PtyHandle) -> Result<(), GrantError> {
        match self.mechanism_for(handle) {
            Mechanism::Direct => set_writeable(handle.subordinate_path(), false),
            Mechanism::Helper(helper) => run_helper(helper, handle.as_fd(), HelperOp::Revoke),
        }
    }
}

fn tty_gid() -> Gid {
    match Group::from_name(TTY_GROUP) {
        Ok(Some(group)) => group.gid,
        _ => getgid(),
    }
}

fn chmod(path: &Path, mode: u32) -> Result<(), GrantError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        GrantError::Chmod {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn current_mode(path: &Path) -> Result<u32, GrantError> {
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o7777)
        .map_err(|source| GrantError::Chmod {
            path: path.to_path_buf(),
            source,
        })
}

/// Hand the device to the `tty` group with mode 0620
pub(crate) fn restrict_to_tty_group(path: &Path) -> Result<(), GrantError> {
    chown(path, None, Some(tty_gid())).map_err(|source| GrantError::Chown {
        path: path.to_path_buf(),
        source,
    })?;
    chmod(path, GRANTED_MODE)
}

/// Toggle group write access (for `write(1)` style messages).
///
/// Disabling also clears the other-write bit.
pub fn set_writeable(path: &Path, writeable: bool) -> Result<(), GrantError> {
    let mode = current_mode(path)?;
    let mode = if writeable {
        mode | GROUP_WRITE
    } else {
        mode & !(GROUP_WRITE | OTHER_WRITE)
    };
    chmod(path, mode)
}

/// Restores the previous SIGCHLD disposition on drop and wakes the reaper,
/// since exits of watched children during the guard raised no signal
struct ChildSignalGuard {
    previous: SigAction,
}

impl ChildSignalGuard {
    /// Switch SIGCHLD to the default disposition so the helper can be
    /// reaped synchronously without the process-wide reaper seeing it
    fn install_default() -> Result<Self, GrantError> {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let previous =
            unsafe { sigaction(Signal::SIGCHLD, &default) }.map_err(GrantError::Signal)?;
        Ok(Self { previous })
    }
}

impl Drop for ChildSignalGuard {
    fn drop(&mut self) {
        let _ = unsafe { sigaction(Signal::SIGCHLD, &self.previous) };
        reaper::notify();
    }
}

/// Run the helper for `op` on `master` and wait for it.
///
/// Blocks until the helper exits; only setup and teardown call this.
pub fn run_helper(helper: &Path, master: BorrowedFd<'_>, op: HelperOp) -> Result<(), GrantError> {
    let invalid = || GrantError::InvalidHelper(helper.to_path_buf());
    if !helper.is_file() {
        return Err(invalid());
    }
    let path = CString::new(helper.as_os_str().as_bytes()).map_err(|_| invalid())?;
    let name = helper
        .file_name()
        .map(|n| n.as_bytes().to_vec())
        .unwrap_or_else(|| helper.as_os_str().as_bytes().to_vec());
    let args = [
        CString::new(name).map_err(|_| invalid())?,
        CString::new(op.flag()).map_err(|_| invalid())?,
    ];
    let argv = pointers(&args);
    let envp = pointers(&[]);
    let fd = master.as_raw_fd();

    let _serial = HELPER_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let guard = ChildSignalGuard::install_default()?;

    let child = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => unsafe {
            if fd != HELPER_FD {
                if libc::dup2(fd, HELPER_FD) < 0 {
                    libc::_exit(1);
                }
            } else {
                libc::fcntl(HELPER_FD, libc::F_SETFD, 0);
            }
            libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
            libc::_exit(1);
        },
        Err(e) => return Err(GrantError::Fork(e)),
    };

    let status = loop {
        match waitpid(child, None) {
            Err(Errno::EINTR) => continue,
            other => break other,
        }
    };
    drop(guard);

    match status {
        Ok(WaitStatus::Exited(_, 0)) => Ok(()),
        Ok(status) => Err(GrantError::HelperFailed {
            helper: helper.to_path_buf(),
            status: format!("{:?}", status),
        }),
        Err(e) => Err(GrantError::Wait(e)),
    }
}

/// Subordinate path for a master, including legacy `/dev/ptyXY` masters
fn subordinate_of(master: BorrowedFd<'_>) -> Result<PathBuf, GrantError> {
    match device::ptsname_of(master) {
        Ok(path) => Ok(path),
        Err(e) => {
            let legacy = device::ttyname_of(master).map_err(|_| GrantError::NotAMaster(e))?;
            let name = legacy.to_string_lossy();
            match name.strip_prefix("/dev/pty") {
                Some(suffix) => Ok(PathBuf::from(format!("/dev/tty{}", suffix))),
                None => Err(GrantError::NotAMaster(std::io::Error::from_raw_os_error(
                    libc::ENOTTY,
                ))),
            }
        }
    }
}

/// Helper side of the protocol: secure or release the subordinate of `master`.
///
/// Expected to run with root privileges (setuid); the real uid is the user
/// the device is granted to.
pub fn apply_helper_op(master: BorrowedFd<'_>, op: HelperOp) -> Result<(), GrantError> {
    let path = subordinate_of(master)?;
    let (owner, group, mode) = match op {
        HelperOp::Grant => (getuid(), tty_gid(), GRANTED_MODE),
        HelperOp::Revoke => (Uid::from_raw(0), Gid::from_raw(0), REVOKED_MODE),
    };
    chown(&path, Some(owner), Some(group)).map_err(|source| GrantError::Chown {
        path: path.clone(),
        source,
    })?;
    chmod(&path, mode)
}
