//! Ptyline PTY - pseudoterminal session engine
//!
//! This crate runs a child program on the subordinate side of a kernel pty
//! and moves bytes to and from it over the master side.
//!
//! Key features:
//! - Device allocation across `openpty`, `/dev/ptmx` and legacy BSD devices
//! - Subordinate permission grant/revoke, directly or via a privileged helper
//! - Child launch as a session leader with the pty as controlling terminal
//! - Non-blocking I/O with an ordered pending-write queue
//! - Window size management (TIOCSWINSZ)
//! - Exit notification through a process-wide SIGCHLD reaper
//!
//! ```no_run
//! use std::sync::mpsc;
//! use ptyline_pty::{LaunchSpec, Session, SessionEvent};
//!
//! let (tx, rx) = mpsc::channel();
//! let mut session = Session::new(tx);
//! session.resize(40, 100)?;
//! session.run(&LaunchSpec::new("sh").args(["-c", "stty size"]))?;
//! while session.result().is_none() {
//!     session.dispatch(None)?;
//! }
//! for event in rx.try_iter() {
//!     if let SessionEvent::Output(bytes) = event {
//!         print!("{}", String::from_utf8_lossy(&bytes));
//!     }
//! }
//! # Ok::<(), ptyline_pty::Error>(())
//! ```
//!
//! Reference: https://www.man7.org/linux/man-pages/man7/pty.7.html

mod accounting;
mod channel;
mod device;
mod error;
mod grant;
mod launch;
mod lifecycle;
mod reaper;
mod session;
mod size;

pub use accounting::{Accounting, NoAccounting, UtempterAccounting, DEFAULT_UTEMPTER};
pub use channel::{DrainState, IoChannel, PendingWrite, READ_CHUNK};
pub use device::{ptsname_of, ttyname_of, DeviceAllocator, PtyHandle, Strategy};
pub use error::{DeviceError, Error, GrantError, Result, SpawnError};
pub use grant::{
    apply_helper_op, run_helper, set_writeable, HelperOp, Mechanism, PermissionBroker, HELPER_FD,
};
pub use launch::{ChildHandle, ChildLauncher, LaunchSpec, EXEC_FAILED};
pub use lifecycle::{Lifecycle, SessionResult, State};
pub use reaper::{global as reaper, ExitSubscription, Reaper};
pub use session::{Session, SessionEvent, SessionObserver};
pub use size::WindowSize;
