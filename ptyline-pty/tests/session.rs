//! End-to-end session tests: real pty, real child processes

use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use ptyline_pty::{
    DeviceAllocator, LaunchSpec, PermissionBroker, Session, SessionEvent, SessionResult, State,
    Strategy, EXEC_FAILED,
};

const TIMEOUT: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_millis(20);

fn session() -> (Session, Receiver<SessionEvent>) {
    let (tx, rx) = mpsc::channel();
    (Session::new(tx), rx)
}

/// Dispatch until `done` accepts the collected output, returning it
fn collect_until(
    session: &mut Session,
    rx: &Receiver<SessionEvent>,
    output: &mut Vec<u8>,
    mut done: impl FnMut(&[u8]) -> bool,
) {
    let deadline = Instant::now() + TIMEOUT;
    while !done(output) {
        assert!(
            Instant::now() < deadline,
            "timed out, got {:?}",
            String::from_utf8_lossy(output)
        );
        if session.is_open() {
            session.dispatch(Some(TICK)).unwrap();
        }
        for event in rx.try_iter() {
            if let SessionEvent::Output(bytes) = event {
                output.extend_from_slice(&bytes);
            }
        }
    }
}

/// Dispatch until the exit notification arrives; returns output and result
fn run_to_exit(session: &mut Session, rx: &Receiver<SessionEvent>) -> (Vec<u8>, SessionResult) {
    let deadline = Instant::now() + TIMEOUT;
    let mut output = Vec::new();
    loop {
        assert!(Instant::now() < deadline, "child never exited");
        if session.is_open() {
            session.dispatch(Some(TICK)).unwrap();
        }
        for event in rx.try_iter() {
            match event {
                SessionEvent::Output(bytes) => output.extend_from_slice(&bytes),
                SessionEvent::Exited(result) => return (output, result),
            }
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn test_echo_round_trip() {
    let (mut session, rx) = session();
    session
        .run(&LaunchSpec::new("sh").args(["-c", "stty raw -echo; printf READY; exec cat"]))
        .unwrap();

    let mut output = Vec::new();
    collect_until(&mut session, &rx, &mut output, |out| contains(out, b"READY"));

    session.send(b"ping\n").unwrap();
    let mut echoed = Vec::new();
    collect_until(&mut session, &rx, &mut echoed, |out| out.len() >= 5);
    assert_eq!(echoed, b"ping\n");
}

#[test]
fn test_exit_code_is_reported_once() {
    let (mut session, rx) = session();
    session.run(&LaunchSpec::new("sh").args(["-c", "exit 7"])).unwrap();

    let (_, result) = run_to_exit(&mut session, &rx);
    assert_eq!(result, SessionResult::exited(7));
    assert_eq!(session.result(), Some(result));
    assert_eq!(session.state(), State::Exited);
    assert!(!session.is_open());

    // nothing more arrives
    std::thread::sleep(TICK);
    assert!(rx.try_iter().all(|e| !matches!(e, SessionEvent::Exited(_))));
}

#[test]
fn test_size_before_launch_is_seen_by_child() {
    let (mut session, rx) = session();
    session.resize(40, 100).unwrap();
    session.run(&LaunchSpec::new("sh").args(["-c", "stty size"])).unwrap();

    let (output, result) = run_to_exit(&mut session, &rx);
    assert!(result.success());
    assert!(
        contains(&output, b"40 100"),
        "got {:?}",
        String::from_utf8_lossy(&output)
    );
}

#[test]
fn test_resize_after_launch_is_visible() {
    let (mut session, rx) = session();
    session
        .run(&LaunchSpec::new("sh").args(["-c", "printf READY; read line; stty size"]))
        .unwrap();

    let mut output = Vec::new();
    collect_until(&mut session, &rx, &mut output, |out| contains(out, b"READY"));

    session.resize(33, 111).unwrap();
    assert_eq!(session.kernel_window_size().unwrap().rows, 33);
    session.send_str("\n").unwrap();

    let (output, _) = run_to_exit(&mut session, &rx);
    assert!(
        contains(&output, b"33 111"),
        "got {:?}",
        String::from_utf8_lossy(&output)
    );
}

#[test]
fn test_environment_reaches_child() {
    let (mut session, rx) = session();
    session
        .run(
            &LaunchSpec::new("sh")
                .args(["-c", "printf '%s:%s:%s' \"$TERM\" \"$PTYLINE_TEST_TAG\" \"${PTYLINE_EMPTY_TAG-unset}\""])
                .term("vt220")
                .tag("PTYLINE_TEST_TAG", "tagged")
                .tag("PTYLINE_EMPTY_TAG", ""),
        )
        .unwrap();

    let (output, _) = run_to_exit(&mut session, &rx);
    assert!(
        contains(&output, b"vt220:tagged:unset"),
        "got {:?}",
        String::from_utf8_lossy(&output)
    );
}

#[test]
fn test_child_is_session_leader_with_controlling_tty() {
    let (mut session, rx) = session();
    session
        .run(&LaunchSpec::new("sh").args(["-c", "tty; [ -t 0 ] && echo ISATTY"]))
        .unwrap();
    let device = session.device_name().unwrap().to_path_buf();

    let (output, _) = run_to_exit(&mut session, &rx);
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains(&*device.to_string_lossy()), "got {:?}", text);
    assert!(text.contains("ISATTY"), "got {:?}", text);
}

#[test]
fn test_exec_failure_is_an_ordinary_exit() {
    let (mut session, rx) = session();
    session
        .run(&LaunchSpec::new("/nonexistent/ptyline-test-program"))
        .unwrap();

    let (output, result) = run_to_exit(&mut session, &rx);
    assert_eq!(result.exit_code, EXEC_FAILED);
    assert!(contains(&output, b"could not execute"));
}

#[test]
fn test_teardown_is_idempotent() {
    let (mut session, _rx) = session();
    session
        .run(&LaunchSpec::new("sh").args(["-c", "sleep 5"]))
        .unwrap();
    let device = session.device_name().unwrap().to_path_buf();

    session.teardown();
    assert!(!session.is_open());
    assert!(session.send(b"x").is_err());

    let mode_after_first = std::fs::metadata(&device).map(|m| m.permissions());
    session.teardown();
    let mode_after_second = std::fs::metadata(&device).map(|m| m.permissions());
    assert_eq!(
        mode_after_first.ok().map(|p| format!("{:?}", p)),
        mode_after_second.ok().map(|p| format!("{:?}", p))
    );
}

#[test]
fn test_signal_reaches_child() {
    let (mut session, rx) = session();
    session
        .run(&LaunchSpec::new("sh").args(["-c", "printf READY; exec sleep 30"]))
        .unwrap();
    let mut output = Vec::new();
    collect_until(&mut session, &rx, &mut output, |out| contains(out, b"READY"));

    session.signal(nix::sys::signal::Signal::SIGTERM).unwrap();
    let (_, result) = run_to_exit(&mut session, &rx);
    assert!(result.signaled);
    assert_eq!(result.exit_code, 128 + libc::SIGTERM);
}

#[test]
fn test_unix98_device_without_helper_still_runs() {
    let (tx, rx) = mpsc::channel();
    let mut session = Session::new(tx)
        .with_allocator(DeviceAllocator::with_strategies(vec![Strategy::Unix98]))
        .with_broker(PermissionBroker::new(None));
    session.run(&LaunchSpec::new("sh").args(["-c", "exit 0"])).unwrap();

    let (_, result) = run_to_exit(&mut session, &rx);
    assert!(result.success());
}

#[test]
fn test_large_send_is_delivered_in_order() {
    let (mut session, rx) = session();
    session
        .run(&LaunchSpec::new("sh").args(["-c", "stty raw -echo; printf READY; exec cat"]))
        .unwrap();
    let mut output = Vec::new();
    collect_until(&mut session, &rx, &mut output, |out| contains(out, b"READY"));

    let payload: Vec<u8> = (0..64 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
    for chunk in payload.chunks(1000) {
        session.send(chunk).unwrap();
    }

    let mut echoed = Vec::new();
    collect_until(&mut session, &rx, &mut echoed, |out| out.len() >= payload.len());
    assert_eq!(echoed, payload);
}
