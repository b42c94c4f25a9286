//! Child process launch
//!
//! Forks the program that will own the subordinate side of a pty. The
//! child becomes a session leader with the subordinate as its controlling
//! terminal and stdio, gets a sane line discipline and drops any elevated
//! privileges before exec.
//!
//! Only async-signal-safe calls run between `fork` and `exec`: argument
//! vectors, environment, the resolved program path and every message are
//! built in the parent beforehand.

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::resource::{getrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, ForkResult, Pid};

use crate::device::PtyHandle;
use crate::error::SpawnError;
use crate::size::WindowSize;

/// Exit code of a child whose exec failed
pub const EXEC_FAILED: i32 = 127;

/// Upper bound for the descriptor sweep when the limit is unbounded
const MAX_SWEEP_FD: libc::rlim_t = 65536;

/// Highest signal number reset in the child
#[cfg(target_os = "linux")]
const MAX_SIGNAL: libc::c_int = 64;
#[cfg(not(target_os = "linux"))]
const MAX_SIGNAL: libc::c_int = 31;

const CTRL_C: libc::cc_t = 0x03;
const CTRL_BACKSLASH: libc::cc_t = 0x1c;
const DEL: libc::cc_t = 0x7f;

/// What to run in a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    program: String,
    argv: Vec<String>,
    term: String,
    tags: BTreeMap<String, String>,
    accounting: bool,
    xon_xoff: bool,
}

impl LaunchSpec {
    /// Run `program`, with `argv[0]` set to the program name
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            argv: vec![program.clone()],
            program,
            term: String::new(),
            tags: BTreeMap::new(),
            accounting: false,
            xon_xoff: false,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value for `TERM`; left untouched when empty
    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    /// Session-correlation environment entry, exported only when non-empty.
    /// Tagging the same name again replaces the value.
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    /// Register the session with login accounting
    pub fn accounting(mut self, enabled: bool) -> Self {
        self.accounting = enabled;
        self
    }

    /// Keep XON/XOFF flow control in the child's line discipline
    pub fn xon_xoff(mut self, enabled: bool) -> Self {
        self.xon_xoff = enabled;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn term_name(&self) -> &str {
        &self.term
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn wants_accounting(&self) -> bool {
        self.accounting
    }

    pub fn wants_xon_xoff(&self) -> bool {
        self.xon_xoff
    }

    /// Environment entries this launch adds to the inherited environment
    fn exports(&self) -> Vec<(&str, &str)> {
        let term = ("TERM", self.term.as_str());
        std::iter::once(term)
            .chain(self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect()
    }
}

/// A launched child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildHandle {
    pid: Pid,
}

impl ChildHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        kill(self.pid, signal)
    }
}

/// Look `program` up in `PATH` unless it already names a path
fn resolve_program(program: &str) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    let path = std::env::var_os("PATH").unwrap_or_else(|| OsString::from("/usr/bin:/bin"));
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .unwrap_or_else(|| PathBuf::from(program))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn cstring(bytes: impl Into<Vec<u8>>) -> Result<CString, SpawnError> {
    CString::new(bytes).map_err(|e| {
        SpawnError::Nul(String::from_utf8_lossy(&e.into_vec()).into_owned())
    })
}

/// Inherited environment with the launch exports replacing existing keys
fn build_environment(spec: &LaunchSpec) -> Result<Vec<CString>, SpawnError> {
    let exports = spec.exports();
    let overridden = |key: &OsStr| exports.iter().any(|(k, _)| k.as_bytes() == key.as_bytes());

    let mut env = Vec::new();
    for (key, value) in std::env::vars_os() {
        if overridden(&key) {
            continue;
        }
        let mut entry = key.into_vec();
        entry.push(b'=');
        entry.extend(value.into_vec());
        env.push(cstring(entry)?);
    }
    for (key, value) in exports {
        env.push(cstring(format!("{}={}", key, value))?);
    }
    Ok(env)
}

/// Null-terminated pointer array over `strings`
pub(crate) fn pointers(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

fn sweep_limit() -> Result<libc::c_int, SpawnError> {
    let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE).map_err(SpawnError::Limit)?;
    let limit = if soft == libc::RLIM_INFINITY {
        MAX_SWEEP_FD
    } else {
        soft.min(MAX_SWEEP_FD)
    };
    Ok(limit as libc::c_int)
}

/// Everything the child needs, allocated before fork
struct Prepared {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    subordinate: CString,
    winsize: libc::winsize,
    fd_limit: libc::c_int,
    xon_xoff: bool,
    exec_error: Vec<u8>,
}

impl Prepared {
    fn new(handle: &PtyHandle, spec: &LaunchSpec, size: WindowSize) -> Result<Self, SpawnError> {
        let program = resolve_program(spec.program());
        Ok(Self {
            program: cstring(program.into_os_string().into_vec())?,
            argv: spec
                .argv()
                .iter()
                .map(|arg| cstring(arg.as_bytes()))
                .collect::<Result<_, _>>()?,
            envp: build_environment(spec)?,
            subordinate: cstring(handle.subordinate_path().as_os_str().as_bytes())?,
            winsize: size.to_winsize(),
            fd_limit: sweep_limit()?,
            xon_xoff: spec.wants_xon_xoff(),
            exec_error: format!("ptyline: could not execute {}\r\n", spec.program()).into_bytes(),
        })
    }
}

/// Forks children onto pty handles
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildLauncher;

impl ChildLauncher {
    /// Fork and exec `spec` on the subordinate side of `handle`.
    ///
    /// On return the parent no longer holds the subordinate descriptor. A
    /// failed exec is only visible as the child exiting with
    /// [`EXEC_FAILED`].
    pub fn spawn(
        handle: &mut PtyHandle,
        spec: &LaunchSpec,
        size: WindowSize,
    ) -> Result<ChildHandle, SpawnError> {
        let prepared = Prepared::new(handle, spec, size)?;
        let argv = pointers(&prepared.argv);
        let envp = pointers(&prepared.envp);
        let master = handle.as_raw_fd();
        let subordinate = handle.subordinate().map(|fd| fd.as_raw_fd());

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                handle.close_subordinate();
                log::debug!(
                    "Spawned {} (pid {}) on {:?}",
                    spec.program(),
                    child,
                    handle.subordinate_path()
                );
                Ok(ChildHandle { pid: child })
            }
            Ok(ForkResult::Child) => unsafe {
                exec_child(&prepared, &argv, &envp, master, subordinate)
            },
            Err(e) => {
                log::error!("Failed to fork {}: {}", spec.program(), e);
                Err(SpawnError::Fork(e))
            }
        }
    }
}

/// Child side of the fork. Never returns.
unsafe fn exec_child(
    prepared: &Prepared,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    master: RawFd,
    subordinate: Option<RawFd>,
) -> ! {
    let sub = match subordinate {
        Some(fd) => fd,
        None => libc::open(prepared.subordinate.as_ptr(), libc::O_RDWR),
    };
    if sub < 0 {
        libc::_exit(1);
    }

    for signal in 1..=MAX_SIGNAL {
        libc::signal(signal, libc::SIG_DFL);
    }
    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

    for fd in 0..prepared.fd_limit {
        if fd != sub && fd != master {
            libc::close(fd);
        }
    }

    for target in 0..=2 {
        if sub != target && libc::dup2(sub, target) < 0 {
            libc::_exit(1);
        }
    }
    if sub > 2 {
        libc::close(sub);
    }

    if libc::setsid() < 0 {
        libc::_exit(1);
    }
    if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
        libc::_exit(1);
    }

    // some kernels only attach the controlling terminal on an open by name
    let pid = libc::getpid();
    libc::tcsetpgrp(0, pid);
    libc::setpgid(0, 0);
    let reopened = libc::open(prepared.subordinate.as_ptr(), libc::O_WRONLY);
    if reopened >= 0 {
        libc::close(reopened);
    }
    libc::setpgid(0, 0);
    libc::tcsetpgrp(0, pid);

    let mut attrs: libc::termios = std::mem::zeroed();
    if libc::tcgetattr(0, &mut attrs) == 0 {
        if !prepared.xon_xoff {
            attrs.c_iflag &= !(libc::IXON | libc::IXOFF);
        }
        attrs.c_cc[libc::VINTR] = CTRL_C;
        attrs.c_cc[libc::VQUIT] = CTRL_BACKSLASH;
        attrs.c_cc[libc::VERASE] = DEL;
        libc::tcsetattr(0, libc::TCSANOW, &attrs);
    }

    libc::close(master);

    if libc::setgid(libc::getgid()) < 0 || libc::setuid(libc::getuid()) < 0 {
        libc::_exit(1);
    }

    libc::ioctl(0, libc::TIOCSWINSZ as _, &prepared.winsize);

    libc::execve(prepared.program.as_ptr(), argv.as_ptr(), envp.as_ptr());

    libc::write(
        2,
        prepared.exec_error.as_ptr() as *const libc::c_void,
        prepared.exec_error.len(),
    );
    libc::_exit(EXEC_FAILED);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new("sh")
            .arg("-c")
            .arg("true")
            .term("xterm")
            .tag("SESSION_ID", "42")
            .accounting(true);
        assert_eq!(spec.program(), "sh");
        assert_eq!(spec.argv(), ["sh", "-c", "true"]);
        assert_eq!(spec.term_name(), "xterm");
        assert!(spec.wants_accounting());
        assert!(!spec.wants_xon_xoff());
    }

    #[test]
    fn test_empty_exports_are_skipped() {
        let spec = LaunchSpec::new("sh").tag("EMPTY", "").tag("SET", "yes");
        assert_eq!(spec.exports(), vec![("SET", "yes")]);

        let spec = spec.term("vt100");
        assert_eq!(spec.exports(), vec![("TERM", "vt100"), ("SET", "yes")]);
    }

    #[test]
    fn test_repeated_tag_replaces_value() {
        let spec = LaunchSpec::new("sh")
            .tag("SESSION_ID", "1")
            .tag("SESSION_ID", "2");
        assert_eq!(spec.tags().len(), 1);
        assert_eq!(spec.exports(), vec![("SESSION_ID", "2")]);

        let env = build_environment(&spec).unwrap();
        let ids: Vec<_> = env
            .iter()
            .filter(|e| e.as_bytes().starts_with(b"SESSION_ID="))
            .collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].as_bytes(), b"SESSION_ID=2");
    }

    #[test]
    fn test_environment_overrides_term() {
        let spec = LaunchSpec::new("sh").term("dumb-test-term");
        let env = build_environment(&spec).unwrap();
        let terms: Vec<_> = env
            .iter()
            .filter(|e| e.as_bytes().starts_with(b"TERM="))
            .collect();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].as_bytes(), b"TERM=dumb-test-term");
    }

    #[test]
    fn test_nul_in_argument_is_rejected() {
        let handle = crate::DeviceAllocator::default().allocate().unwrap();
        let spec = LaunchSpec::new("sh").arg("bad\0arg");
        assert!(matches!(
            Prepared::new(&handle, &spec, WindowSize::default()),
            Err(SpawnError::Nul(_))
        ));
    }

    #[test]
    fn test_resolve_program() {
        assert_eq!(resolve_program("/bin/sh"), PathBuf::from("/bin/sh"));
        let sh = resolve_program("sh");
        assert!(sh.is_absolute());
        assert!(is_executable(&sh));
        assert_eq!(
            resolve_program("definitely-not-a-program-name"),
            PathBuf::from("definitely-not-a-program-name")
        );
    }

    #[test]
    fn test_sweep_limit_is_bounded() {
        let limit = sweep_limit().unwrap();
        assert!(limit > 2);
        assert!(limit as libc::rlim_t <= MAX_SWEEP_FD);
    }

    #[test]
    fn test_pointer_array_is_null_terminated() {
        let strings = vec![CString::new("a").unwrap(), CString::new("b").unwrap()];
        let ptrs = pointers(&strings);
        assert_eq!(ptrs.len(), 3);
        assert!(ptrs[2].is_null());
    }
}
