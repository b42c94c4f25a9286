//! Error types for PTY session operations

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Device allocation failure
#[derive(Error, Debug)]
pub enum DeviceError {
    /// None of the configured strategies produced a master descriptor
    #[error("Unable to open a suitable terminal device")]
    NoPtyAvailable,

    /// The master was opened but could not be switched to non-blocking mode
    #[error("Failed to set non-blocking mode on pty master: {0}")]
    NonBlocking(#[source] nix::Error),
}

/// Permission grant/revoke failure.
///
/// Never fatal: a session that cannot be secured keeps running.
#[derive(Error, Debug)]
pub enum GrantError {
    #[error("Failed to change group of {path:?}: {source}")]
    Chown {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to change mode of {path:?}: {source}")]
    Chmod {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Grant helper path {0:?} is not usable")]
    InvalidHelper(PathBuf),

    #[error("Failed to change SIGCHLD disposition: {0}")]
    Signal(#[source] nix::Error),

    #[error("Failed to fork grant helper: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to wait for grant helper: {0}")]
    Wait(#[source] nix::Error),

    #[error("Grant helper {helper:?} failed: {status}")]
    HelperFailed { helper: PathBuf, status: String },

    #[error("Descriptor is not a pty master: {0}")]
    NotAMaster(#[source] io::Error),
}

/// Child launch failure
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Argument {0:?} contains an interior NUL byte")]
    Nul(String),

    #[error("Failed to query descriptor limit: {0}")]
    Limit(#[source] nix::Error),

    #[error("Session is already running")]
    AlreadyRunning,
}

/// Session error type
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Grant(#[from] GrantError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Persistent write failure; the affected bytes were dropped
    #[error("Write to pty failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("Failed to poll: {0}")]
    Poll(#[source] nix::Error),

    #[error("Failed to install child reaper: {0}")]
    Reaper(#[source] nix::Error),

    #[error("Failed to signal child: {0}")]
    Signal(#[source] nix::Error),

    #[error("Failed to set window size: {0}")]
    WindowSize(#[source] nix::Error),

    #[error("No pty is open")]
    NotOpen,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;
