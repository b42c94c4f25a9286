//! Interactive relay
//!
//! Connects the current terminal to a session: stdin goes to the child,
//! the child's output goes to stdout, and size changes of the current
//! terminal are passed on.

use std::error::Error;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::sync::mpsc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use ptyline_pty::{
    DeviceAllocator, PermissionBroker, Session, SessionEvent, UtempterAccounting, WindowSize,
    READ_CHUNK,
};

use crate::config::Config;

/// How often the size of the current terminal is checked
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// End-of-transmission, read as end of file by a canonical-mode child
const EOT: u8 = 0x04;

/// Run the configured program and relay it until it exits.
///
/// Returns the child's exit code.
pub fn run(config: &Config) -> Result<i32, Box<dyn Error>> {
    let (cols, rows) = terminal_size().unwrap_or(config.dimensions);

    let (tx, rx) = mpsc::channel();
    let mut session = Session::new(tx)
        .with_allocator(DeviceAllocator::with_strategies(config.strategies()?))
        .with_broker(PermissionBroker::new(config.helper.clone()));
    if config.accounting {
        session = session.with_accounting(UtempterAccounting::new(&config.utempter));
    }
    if let Some(path) = &config.tee {
        session = session.with_tee(File::create(path)?);
    }

    session.resize(rows, cols)?;
    session.run(&config.launch_spec())?;
    log::debug!(
        "Relaying {:?} on {:?} ({}x{})",
        config.program(),
        session.device_name(),
        cols,
        rows
    );

    // Not a terminal (piped input): relay without raw mode
    let _raw_guard = match RawModeGuard::new() {
        Ok(guard) => Some(guard),
        Err(e) => {
            log::debug!("Not switching stdin to raw mode: {}", e);
            None
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let mut stdin_open = true;
    let mut last_size = (cols, rows);
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let stdin_ready =
            session.dispatch_with(stdin_open.then(|| stdin.as_fd()), Some(POLL_INTERVAL))?;

        for event in rx.try_iter() {
            match event {
                SessionEvent::Output(bytes) => {
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
                SessionEvent::Exited(result) => {
                    log::debug!("Child exited: {:?}", result);
                    return Ok(result.exit_code);
                }
            }
        }

        if stdin_ready {
            match nix::unistd::read(libc::STDIN_FILENO, &mut buf) {
                Ok(0) => {
                    stdin_open = false;
                    forward(&mut session, &[EOT]);
                }
                Ok(n) => {
                    forward(&mut session, &buf[..n]);
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(size) = terminal_size() {
            if size != last_size {
                last_size = size;
                if let Err(e) = session.resize(size.1, size.0) {
                    log::warn!("Failed to pass on terminal size: {}", e);
                }
            }
        }
    }
}

/// Pass input to the child. A failed write is logged and the relay goes on;
/// the session ends only when the child does.
fn forward(session: &mut Session, bytes: &[u8]) -> bool {
    match session.send(bytes) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Dropped {} bytes of input: {}", bytes.len(), e);
            false
        }
    }
}

/// Size of the current terminal as (columns, rows)
fn terminal_size() -> Option<(u16, u16)> {
    let size = WindowSize::query(io::stdout().as_fd()).ok()?;
    if size.cols > 0 && size.rows > 0 {
        Some((size.cols, size.rows))
    } else {
        None
    }
}

/// RAII guard for raw terminal mode
struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    fn new() -> io::Result<Self> {
        let original = termios::tcgetattr(io::stdin()).map_err(io::Error::from)?;

        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        raw.local_flags.remove(LocalFlags::ECHO);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &raw).map_err(io::Error::from)?;

        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &self.original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_survives_write_failure() {
        let (tx, _rx) = mpsc::channel();
        let mut session = Session::new(tx);
        session.open().unwrap();
        assert!(forward(&mut session, b"typed"));

        session.teardown();
        assert!(!forward(&mut session, b"typed"));
        assert!(!forward(&mut session, &[EOT]));
    }
}
