//! Ptyline grant helper
//!
//! Installed setuid root. Secures (`--grant`) or releases (`--revoke`) the
//! subordinate of the pty master passed on descriptor 3, on behalf of the
//! invoking user. Exits 0 on success.

use std::os::fd::BorrowedFd;
use std::process::ExitCode;

use ptyline_pty::{apply_helper_op, HelperOp, HELPER_FD};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let Some(op) = HelperOp::from_args(std::env::args().skip(1)) else {
        eprintln!(
            "usage: ptyline-grantpty --grant|--revoke (pty master on descriptor {})",
            HELPER_FD
        );
        return ExitCode::from(2);
    };

    if unsafe { libc::fcntl(HELPER_FD, libc::F_GETFD) } < 0 {
        eprintln!("ptyline-grantpty: descriptor {} is not open", HELPER_FD);
        return ExitCode::FAILURE;
    }
    let master = unsafe { BorrowedFd::borrow_raw(HELPER_FD) };

    match apply_helper_op(master, op) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{} failed: {}", op.flag(), e);
            ExitCode::FAILURE
        }
    }
}
