//! PTY session
//!
//! Ties the pieces together: allocate a pty, secure it, launch the child,
//! pump bytes over the master and tear everything down once the child is
//! gone. A session is driven from one thread by calling
//! [`Session::dispatch`] (or [`Session::dispatch_with`] when the caller has
//! its own descriptor to watch) in a loop.

use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::accounting::{Accounting, NoAccounting};
use crate::channel::{DrainState, IoChannel};
use crate::device::{DeviceAllocator, PtyHandle};
use crate::error::{Error, Result, SpawnError};
use crate::grant::{self, PermissionBroker};
use crate::launch::{ChildHandle, ChildLauncher, LaunchSpec};
use crate::lifecycle::{Lifecycle, SessionResult, State};
use crate::reaper::{self, ExitSubscription};
use crate::size::WindowSize;

/// Upper bound on reads used to collect output after the child exited
const MAX_FLUSH_READS: usize = 64;

/// Receives a session's output and completion
pub trait SessionObserver {
    /// A block read from the master, in arrival order
    fn block_in(&mut self, data: &[u8]);

    /// The child exited; called exactly once, after teardown
    fn done(&mut self, result: SessionResult);
}

/// Session notifications as values, for channel-based consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Vec<u8>),
    Exited(SessionResult),
}

impl SessionObserver for mpsc::Sender<SessionEvent> {
    fn block_in(&mut self, data: &[u8]) {
        let _ = self.send(SessionEvent::Output(data.to_vec()));
    }

    fn done(&mut self, result: SessionResult) {
        let _ = self.send(SessionEvent::Exited(result));
    }
}

/// A pty with a child process on the other side
pub struct Session {
    allocator: DeviceAllocator,
    broker: PermissionBroker,
    accounting: Box<dyn Accounting>,
    observer: Box<dyn SessionObserver>,
    tee: Option<Box<dyn Write>>,
    size: WindowSize,
    channel: Option<IoChannel<PtyHandle>>,
    child: Option<ChildHandle>,
    exit: Option<ExitSubscription>,
    lifecycle: Lifecycle,
    secure: bool,
    registered: bool,
    hung_up: bool,
}

impl Session {
    pub fn new(observer: impl SessionObserver + 'static) -> Self {
        Self {
            allocator: DeviceAllocator::default(),
            broker: PermissionBroker::default(),
            accounting: Box::new(NoAccounting),
            observer: Box::new(observer),
            tee: None,
            size: WindowSize::default(),
            channel: None,
            child: None,
            exit: None,
            lifecycle: Lifecycle::new(),
            secure: false,
            registered: false,
            hung_up: false,
        }
    }

    pub fn with_allocator(mut self, allocator: DeviceAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_broker(mut self, broker: PermissionBroker) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_accounting(mut self, accounting: impl Accounting + 'static) -> Self {
        self.accounting = Box::new(accounting);
        self
    }

    /// Copy all output to `sink` (debug log)
    pub fn with_tee(mut self, sink: impl Write + 'static) -> Self {
        self.tee = Some(Box::new(sink));
        self
    }

    /// Allocate and secure the pty without launching anything yet.
    ///
    /// Failing to secure the device is logged and otherwise ignored.
    pub fn open(&mut self) -> Result<()> {
        if self.channel.is_some() {
            return Ok(());
        }
        if self.lifecycle.is_torn_down() {
            return Err(Error::NotOpen);
        }

        let handle = self.allocator.allocate()?;
        self.size
            .apply(handle.as_fd())
            .map_err(Error::WindowSize)?;

        self.secure = match self.broker.grant(&handle) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "Unable to secure {:?} (helper: {:?}), session may be eavesdropped: {}",
                    handle.subordinate_path(),
                    self.broker.helper(),
                    e
                );
                false
            }
        };

        let mut channel = IoChannel::new(handle);
        channel.set_tee(self.tee.take());
        self.channel = Some(channel);
        Ok(())
    }

    /// Launch `spec` on this session's pty, opening it first if needed
    pub fn run(&mut self, spec: &LaunchSpec) -> Result<()> {
        if self.lifecycle.state() != State::Idle {
            return Err(SpawnError::AlreadyRunning.into());
        }
        let reaper = reaper::global()?;
        self.open()?;
        let channel = self.channel.as_mut().ok_or(Error::NotOpen)?;

        let child = ChildLauncher::spawn(channel.get_mut(), spec, self.size)?;
        self.exit = Some(reaper.watch(child.pid()));
        self.child = Some(child);

        if spec.wants_accounting() {
            let handle = channel.get_ref();
            match self
                .accounting
                .register(handle.as_fd(), handle.subordinate_path())
            {
                Ok(()) => self.registered = true,
                Err(e) => log::warn!(
                    "Failed to register {:?} with login accounting: {}",
                    handle.subordinate_path(),
                    e
                ),
            }
        }

        self.lifecycle.start();
        Ok(())
    }

    /// Record a new window size and push it to the pty if one is open
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.size = WindowSize::with_pixels(
            rows,
            cols,
            self.size.pixel_width,
            self.size.pixel_height,
        );
        if let Some(channel) = &self.channel {
            self.size
                .apply(channel.get_ref().as_fd())
                .map_err(Error::WindowSize)?;
        }
        Ok(())
    }

    /// The most recently requested size
    pub fn window_size(&self) -> WindowSize {
        self.size
    }

    /// The size the kernel currently holds for the pty
    pub fn kernel_window_size(&self) -> Result<WindowSize> {
        let channel = self.channel.as_ref().ok_or(Error::NotOpen)?;
        WindowSize::query(channel.get_ref().as_fd()).map_err(Error::WindowSize)
    }

    /// Send bytes to the child.
    ///
    /// While suspended the bytes are queued and go out after `resume`.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let channel = self.channel.as_mut().ok_or(Error::NotOpen)?;
        if self.lifecycle.is_suspended() {
            channel.enqueue(bytes);
            return Ok(());
        }
        channel.send(bytes).map_err(Error::WriteFailed)
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<()> {
        self.send(&[byte])
    }

    pub fn send_str(&mut self, text: &str) -> Result<()> {
        self.send(text.as_bytes())
    }

    /// Bytes waiting for the pty to accept them
    pub fn pending_bytes(&self) -> usize {
        self.channel.as_ref().map_or(0, IoChannel::queued_bytes)
    }

    /// Stop reading and draining until [`resume`](Self::resume)
    pub fn suspend(&mut self) {
        self.lifecycle.suspend();
    }

    pub fn resume(&mut self) {
        self.lifecycle.resume();
    }

    pub fn lock(&mut self, locked: bool) {
        if locked {
            self.suspend();
        } else {
            self.resume();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.lifecycle.is_suspended()
    }

    /// Subordinate device path, while the pty is open
    pub fn device_name(&self) -> Option<&Path> {
        self.channel
            .as_ref()
            .map(|channel| channel.get_ref().subordinate_path())
    }

    /// Allow or refuse `write(1)` style messages to the terminal
    pub fn set_writeable(&self, writeable: bool) -> Result<()> {
        let path = self.device_name().ok_or(Error::NotOpen)?;
        grant::set_writeable(path, writeable)?;
        Ok(())
    }

    /// Whether the subordinate was secured on open
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// The master descriptor, for callers running their own poll loop
    pub fn master(&self) -> Option<BorrowedFd<'_>> {
        self.channel.as_ref().map(|channel| channel.get_ref().as_fd())
    }

    pub fn signal(&self, signal: Signal) -> Result<()> {
        match (&self.child, self.lifecycle.state()) {
            (Some(child), State::Running) => child.signal(signal).map_err(Error::Signal),
            _ => Err(Error::NotOpen),
        }
    }

    pub fn child_pid(&self) -> Option<Pid> {
        self.child.map(|child| child.pid())
    }

    pub fn result(&self) -> Option<SessionResult> {
        self.lifecycle.result()
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// Wait up to `timeout` (forever with `None`) for activity and handle it
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.dispatch_with(None, timeout).map(|_| ())
    }

    /// Like [`dispatch`](Self::dispatch), also waking when `extra` becomes
    /// readable. Returns whether it did.
    ///
    /// While writes are queued the wait is cut to zero so the queue keeps
    /// draining.
    pub fn dispatch_with(
        &mut self,
        extra: Option<BorrowedFd<'_>>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let reaper = reaper::global()?;
        let active = !self.lifecycle.is_suspended();
        let draining = active
            && self
                .channel
                .as_ref()
                .map_or(false, |channel| channel.state() == DrainState::Draining);
        let timeout = if draining {
            PollTimeout::ZERO
        } else {
            poll_timeout(timeout)
        };

        let (master_events, extra_ready) = {
            let mut fds = vec![PollFd::new(reaper.wake_fd(), PollFlags::POLLIN)];
            if let Some(ready) = self.exit.as_ref().and_then(ExitSubscription::ready_fd) {
                fds.push(PollFd::new(ready, PollFlags::POLLIN));
            }
            let master = match &self.channel {
                Some(channel) if active && !self.hung_up => {
                    fds.push(PollFd::new(channel.get_ref().as_fd(), PollFlags::POLLIN));
                    Some(fds.len() - 1)
                }
                _ => None,
            };
            let extra = extra.map(|fd| {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
                fds.len() - 1
            });

            match poll(&mut fds, timeout) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(Error::Poll(e)),
            }

            let events = |index: Option<usize>| {
                index
                    .and_then(|i| fds[i].revents())
                    .unwrap_or_else(PollFlags::empty)
            };
            (events(master), !events(extra).is_empty())
        };

        if active {
            if let Some(channel) = self.channel.as_mut() {
                if master_events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                    let observer = &mut self.observer;
                    let read = channel.on_readable(|block| observer.block_in(block));
                    if read.is_none() && master_events.contains(PollFlags::POLLHUP) {
                        // the child closed its side; wait for the reaper
                        self.hung_up = true;
                    }
                }
                if channel.state() == DrainState::Draining {
                    channel.drain();
                }
            }
        }

        reaper.reap();
        if let Some(result) = self.exit.as_ref().and_then(ExitSubscription::try_take) {
            self.on_child_exit(result);
        }

        Ok(extra_ready)
    }

    /// Record the exit, flush remaining output, tear down and notify
    fn on_child_exit(&mut self, result: SessionResult) {
        let Some(result) = self.lifecycle.record_exit(result) else {
            return;
        };
        self.exit = None;
        log::debug!("Session child exited: {:?}", result);

        if !self.lifecycle.is_suspended() {
            if let Some(channel) = self.channel.as_mut() {
                let observer = &mut self.observer;
                for _ in 0..MAX_FLUSH_READS {
                    match channel.on_readable(|block| observer.block_in(block)) {
                        Some(n) if n > 0 => continue,
                        _ => break,
                    }
                }
            }
        }

        self.teardown();
        self.observer.done(result);
    }

    /// Revoke permissions, drop accounting and close the master.
    ///
    /// Queued writes are discarded. Calling it again does nothing.
    pub fn teardown(&mut self) {
        if !self.lifecycle.begin_teardown() {
            return;
        }
        let Some(channel) = self.channel.take() else {
            return;
        };
        let handle = channel.into_inner();

        if let Err(e) = self.broker.revoke(&handle) {
            log::warn!(
                "Failed to revoke access to {:?}: {}",
                handle.subordinate_path(),
                e
            );
        }

        if self.registered {
            self.registered = false;
            if let Err(e) = self
                .accounting
                .deregister(handle.as_fd(), handle.subordinate_path())
            {
                log::warn!(
                    "Failed to deregister {:?} from login accounting: {}",
                    handle.subordinate_path(),
                    e
                );
            }
        }

        log::debug!("Closed pty {:?}", handle.subordinate_path());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.lifecycle.state() == State::Running {
            if let Some(child) = &self.child {
                let _ = child.signal(Signal::SIGHUP);
            }
        }
        self.teardown();
    }
}

fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(duration) => {
            let millis = duration.as_millis().min(u16::MAX as u128) as u16;
            PollTimeout::from(millis)
        }
    }
}
