//! Process-wide child reaper
//!
//! SIGCHLD is a process-wide signal, so one handler is installed for the
//! whole process. It only writes a byte to a self-pipe; the event loop polls
//! the read end and calls [`Reaper::reap`], which waits on each watched pid
//! and parks the result for the session that subscribed to it.
//!
//! Only watched pids are waited for, so children spawned elsewhere (the
//! grant helper, `std::process::Command`) can still be reaped by their
//! owners.
//!
//! Any thread may end up reaping another session's child. Each subscription
//! therefore has its own readiness pipe, whose write end is closed once the
//! result is parked, so the owner wakes even if it never saw the SIGCHLD.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe, read, Pid};

use crate::error::{Error, Result};
use crate::lifecycle::SessionResult;

static REAPER: OnceLock<Reaper> = OnceLock::new();
static INSTALL: Mutex<()> = Mutex::new(());

/// Write end of the self-pipe, read by the signal handler
static WAKE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigchld(_: libc::c_int) {
    let saved = Errno::last_raw();
    notify();
    Errno::set_raw(saved);
}

/// Wake the reaper as if SIGCHLD had arrived.
///
/// Needed after SIGCHLD was held at its default disposition, when exits of
/// watched children produced no wakeup. Async-signal-safe.
pub(crate) fn notify() {
    let fd = WAKE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        // a full pipe already guarantees a wakeup
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
}

#[derive(Debug)]
enum Slot {
    /// Watched, still running; the write end of the subscriber's
    /// readiness pipe, closed when the result is parked
    Pending(Option<OwnedFd>),
    /// Subscription dropped before the child exited; reap and forget
    Orphaned,
    Exited(SessionResult),
}

/// Demultiplexes child exits by pid
#[derive(Debug)]
pub struct Reaper {
    wake_read: OwnedFd,
    // keeps the handler's descriptor open for the life of the process
    _wake_write: OwnedFd,
    slots: Mutex<HashMap<Pid, Slot>>,
}

/// The process-wide reaper, installing the SIGCHLD handler on first use
pub fn global() -> Result<&'static Reaper> {
    if let Some(reaper) = REAPER.get() {
        return Ok(reaper);
    }
    let _install = INSTALL.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(reaper) = REAPER.get() {
        return Ok(reaper);
    }

    let reaper = Reaper::install()?;
    Ok(REAPER.get_or_init(|| reaper))
}

fn configure_pipe_end(fd: &OwnedFd) -> nix::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    fcntl(raw, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn readiness_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe()?;
    configure_pipe_end(&read)?;
    configure_pipe_end(&write)?;
    Ok((read, write))
}

impl Reaper {
    fn install() -> Result<Self> {
        let (wake_read, wake_write) = pipe().map_err(Error::Reaper)?;
        configure_pipe_end(&wake_read).map_err(Error::Reaper)?;
        configure_pipe_end(&wake_write).map_err(Error::Reaper)?;
        WAKE_WRITE.store(wake_write.as_raw_fd(), Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        if let Err(e) = unsafe { sigaction(Signal::SIGCHLD, &action) } {
            WAKE_WRITE.store(-1, Ordering::Relaxed);
            return Err(Error::Reaper(e));
        }
        log::debug!("Installed SIGCHLD reaper");

        Ok(Self {
            wake_read,
            _wake_write: wake_write,
            slots: Mutex::new(HashMap::new()),
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Pid, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Descriptor that becomes readable when a child may have exited
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake_read.as_fd()
    }

    /// Subscribe to the exit of `pid`
    pub fn watch(&'static self, pid: Pid) -> ExitSubscription {
        let (ready, notifier) = match readiness_pipe() {
            Ok((read, write)) => (Some(read), Some(write)),
            Err(e) => {
                log::warn!("No readiness pipe for child {}: {}", pid, e);
                (None, None)
            }
        };
        self.slots().insert(pid, Slot::Pending(notifier));
        ExitSubscription {
            reaper: self,
            pid,
            ready,
        }
    }

    /// Drain the wake pipe and collect every watched child that has exited
    pub fn reap(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = read(self.wake_read.as_raw_fd(), &mut buf) {
            if n == 0 {
                break;
            }
        }

        let mut slots = self.slots();
        let mut forget = Vec::new();
        for (&pid, slot) in slots.iter_mut() {
            let orphaned = match slot {
                Slot::Pending(_) => false,
                Slot::Orphaned => true,
                Slot::Exited(_) => continue,
            };
            let result = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(status) => match SessionResult::from_wait_status(status) {
                    Some(result) => result,
                    None => continue,
                },
                Err(Errno::ECHILD) => {
                    log::warn!("Child {} was reaped elsewhere, exit status lost", pid);
                    SessionResult::exited(-1)
                }
                Err(e) => {
                    log::debug!("waitpid({}) failed: {}", pid, e);
                    continue;
                }
            };
            log::debug!("Child {} exited: {:?}", pid, result);
            if orphaned {
                forget.push(pid);
            } else {
                // drops the notifier, waking the subscriber
                *slot = Slot::Exited(result);
            }
        }
        for pid in forget {
            slots.remove(&pid);
        }
    }

    fn take(&self, pid: Pid) -> Option<SessionResult> {
        let mut slots = self.slots();
        match slots.get(&pid) {
            Some(Slot::Exited(result)) => {
                let result = *result;
                slots.remove(&pid);
                Some(result)
            }
            _ => None,
        }
    }

    fn release(&self, pid: Pid) {
        let mut slots = self.slots();
        match slots.get_mut(&pid) {
            Some(slot @ Slot::Pending(_)) => *slot = Slot::Orphaned,
            Some(Slot::Exited(_)) => {
                slots.remove(&pid);
            }
            _ => {}
        }
    }
}

/// One session's interest in one child's exit.
///
/// Dropping it before the result is taken leaves the child to be reaped in
/// the background.
#[derive(Debug)]
pub struct ExitSubscription {
    reaper: &'static Reaper,
    pid: Pid,
    ready: Option<OwnedFd>,
}

impl ExitSubscription {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Descriptor that hangs up once the result has been parked
    pub fn ready_fd(&self) -> Option<BorrowedFd<'_>> {
        self.ready.as_ref().map(AsFd::as_fd)
    }

    /// The child's result, once [`Reaper::reap`] has seen it exit
    pub fn try_take(&self) -> Option<SessionResult> {
        self.reaper.take(self.pid)
    }
}

impl Drop for ExitSubscription {
    fn drop(&mut self) {
        self.reaper.release(self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::{Duration, Instant};

    fn wait_for(sub: &ExitSubscription, reaper: &Reaper) -> SessionResult {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            reaper.reap();
            if let Some(result) = sub.try_take() {
                return result;
            }
            assert!(Instant::now() < deadline, "child never reaped");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_reaps_watched_child() {
        let reaper = global().unwrap();
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let sub = reaper.watch(Pid::from_raw(child.id() as i32));

        let result = wait_for(&sub, reaper);
        assert_eq!(result, SessionResult::exited(3));
        // taken once
        assert_eq!(sub.try_take(), None);
    }

    #[test]
    fn test_signaled_child() {
        let reaper = global().unwrap();
        let child = Command::new("sh").args(["-c", "kill -9 $$"]).spawn().unwrap();
        let sub = reaper.watch(Pid::from_raw(child.id() as i32));

        let result = wait_for(&sub, reaper);
        assert!(result.signaled);
        assert_eq!(result.exit_code, 137);
    }

    #[test]
    fn test_ready_fd_hangs_up_after_exit() {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        let reaper = global().unwrap();
        let child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        let sub = reaper.watch(Pid::from_raw(child.id() as i32));
        let ready = sub.ready_fd().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            // whoever reaps, the subscriber's own descriptor fires
            reaper.reap();
            let mut fds = [PollFd::new(ready, PollFlags::POLLIN)];
            if poll(&mut fds, PollTimeout::ZERO).unwrap() == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "readiness never signalled");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sub.try_take(), Some(SessionResult::exited(0)));
    }

    #[test]
    fn test_global_is_shared() {
        let a = global().unwrap() as *const Reaper;
        let b = global().unwrap() as *const Reaper;
        assert_eq!(a, b);
    }

    #[test]
    fn test_dropped_subscription_is_forgotten() {
        let reaper = global().unwrap();
        let child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        drop(reaper.watch(pid));

        let deadline = Instant::now() + Duration::from_secs(10);
        while reaper.slots().contains_key(&pid) {
            assert!(Instant::now() < deadline, "orphan never reaped");
            reaper.reap();
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
