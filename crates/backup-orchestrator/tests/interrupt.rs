//! Tests for operator interrupts reaching supervised children
//!
//! This binary moves itself into its own process group, so it holds a single test.

use core::time::Duration;
use std::{process::Command, thread, time::Instant};

use backup_orchestrator::{Cancellation, supervise};
use nix::{
    sys::signal::{Signal, killpg},
    unistd::{Pid, getpgrp, setpgid},
};

#[test]
fn interrupt_does_not_reach_children() {
    shared::test::init_test_logger();

    // Stand in for a terminal's foreground group, the interrupt must not reach the test runner.
    setpgid(Pid::from_raw(0), Pid::from_raw(0)).unwrap();

    let interrupted = Cancellation::new();
    interrupted.install_signal_handlers().unwrap();

    let interrupter = thread::spawn(|| {
        thread::sleep(Duration::from_millis(300));
        killpg(getpgrp(), Signal::SIGINT).unwrap();
    });

    // Resuming services supervises its commands without observing the interrupt.
    let mut command = Command::new("sh");
    command.args(["-c", "sleep 1; printf started"]);
    let output = supervise(
        &mut command,
        None,
        Some(Instant::now() + Duration::from_secs(30)),
        &Cancellation::new(),
    )
    .unwrap();

    interrupter.join().unwrap();

    assert!(output.status.success());
    assert_eq!(output.stdout, b"started");
    assert!(interrupted.is_cancelled());
}
