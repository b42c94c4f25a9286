//! Session state and exit status

use nix::sys::wait::WaitStatus;

/// Offset added to a signal number to form a shell-style exit code
const SIGNAL_EXIT_BASE: i32 = 128;

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionResult {
    /// Exit code, or `128 + signal` when the child was killed by a signal
    pub exit_code: i32,
    pub signaled: bool,
}

impl SessionResult {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: code,
            signaled: false,
        }
    }

    pub fn killed(signal: i32) -> Self {
        Self {
            exit_code: SIGNAL_EXIT_BASE + signal,
            signaled: true,
        }
    }

    /// Terminal result for a wait status, `None` while the child lives
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::killed(signal as i32)),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        !self.signaled && self.exit_code == 0
    }
}

/// Where the session is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No child yet
    Idle,
    Running,
    Exited,
}

/// Tracks running state, suspension, the exit result and teardown
#[derive(Debug)]
pub struct Lifecycle {
    state: State,
    suspended: bool,
    result: Option<SessionResult>,
    torn_down: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            suspended: false,
            result: None,
            torn_down: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn start(&mut self) {
        self.state = State::Running;
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Record the child's result.
    ///
    /// Returns the result the first time only; later calls are ignored so
    /// the owner is notified exactly once.
    pub fn record_exit(&mut self, result: SessionResult) -> Option<SessionResult> {
        if self.result.is_some() {
            return None;
        }
        self.result = Some(result);
        self.state = State::Exited;
        Some(result)
    }

    pub fn result(&self) -> Option<SessionResult> {
        self.result
    }

    /// Returns `true` if teardown should run, `false` if it already has
    pub fn begin_teardown(&mut self) -> bool {
        !std::mem::replace(&mut self.torn_down, true)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}
