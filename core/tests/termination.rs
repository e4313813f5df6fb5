//! Integration tests for graduated termination and reaping
//!
//! These tests verify that wait_close_term correctly:
//! - Escalates passive wait, stream close, SIGTERM, SIGKILL in order
//! - Stays idempotent once a terminal status is cached
//! - Keeps the drop path bounded while guaranteeing eventual reaping

#![cfg(unix)]
#![allow(unsafe_code)] // Required for libc calls in tests

use procmux_core::{ProcessStatus, Signal, SpawnCommand, StdioPolicy};
use std::time::{Duration, Instant};

#[test]
fn test_sigterm_terminates_a_sleeper() {
    let mut process = SpawnCommand::new("sleep")
        .arg("30")
        .stdin(StdioPolicy::Null)
        .spawn()
        .expect("Failed to spawn sleep");

    process
        .wait_close_term(Duration::ZERO, Duration::ZERO, Duration::from_secs(5))
        .expect("Failed to terminate sleep");
    assert_eq!(process.status(), ProcessStatus::Signaled(Signal::SIGTERM));
}

#[test]
fn test_escalation_to_sigkill_for_term_ignoring_child() {
    // The shell ignores SIGTERM and respawns its sleep; only SIGKILL to
    // the group takes the tree down.
    let mut process = SpawnCommand::new("/bin/sh")
        .arg("-c")
        .arg("trap '' TERM; while true; do sleep 0.1; done")
        .new_process_group(true)
        .stdin(StdioPolicy::Null)
        .spawn()
        .expect("Failed to spawn stubborn shell");

    process
        .wait_close_term(Duration::ZERO, Duration::ZERO, Duration::from_millis(500))
        .expect("SIGKILL escalation failed");
    assert_eq!(process.status(), ProcessStatus::Signaled(Signal::SIGKILL));
}

#[test]
fn test_closing_streams_ends_a_cat() {
    let mut process = SpawnCommand::new("/bin/cat")
        .spawn()
        .expect("Failed to spawn cat");

    // Phase 2 closes stdin; cat sees EOF and exits on its own.
    process
        .wait_close_term(Duration::ZERO, Duration::from_secs(5), Duration::from_secs(1))
        .expect("Failed to wind down cat");
    assert!(process.status().success());
}

#[test]
fn test_wait_close_term_is_idempotent() {
    let mut process = SpawnCommand::new("/bin/true")
        .stdin(StdioPolicy::Null)
        .spawn()
        .expect("Failed to spawn true");

    process
        .wait_close_term(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .expect("First wait failed");
    let status = process.status();
    assert!(status.terminated());

    // Second call must neither block, signal, nor error.
    let start = Instant::now();
    process
        .wait_close_term(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .expect("Second wait failed");
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(process.status(), status);
}

#[test]
fn test_terminal_status_is_sticky() {
    let mut process = SpawnCommand::new("/bin/true")
        .stdin(StdioPolicy::Null)
        .spawn()
        .expect("Failed to spawn true");

    let mut attempts = 0;
    loop {
        let status = process.poll_status().expect("Failed to poll status");
        if status.terminated() {
            break;
        }
        attempts += 1;
        assert!(attempts < 100, "true did not exit within the polling budget");
        std::thread::sleep(Duration::from_millis(50));
    }
    let terminal = process.status();

    // A terminal status is cached, never re-polled, never regresses.
    for _ in 0..3 {
        assert_eq!(process.poll_status().expect("Failed to poll"), terminal);
    }
}

#[test]
fn test_abandoned_process_is_reaped_with_bounded_drop() {
    let pid = {
        let process = SpawnCommand::new("sleep")
            .arg("30")
            .stdin(StdioPolicy::Null)
            .spawn()
            .expect("Failed to spawn sleep");
        process.pid()
    };
    // The drop above ran the bounded teardown; the pid must be gone.

    let mut attempts = 0;
    loop {
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        if !alive {
            break;
        }
        attempts += 1;
        assert!(attempts < 100, "Abandoned process {pid} was never reaped");
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn test_drop_of_terminated_process_is_quiet() {
    let mut process = SpawnCommand::new("/bin/true")
        .stdin(StdioPolicy::Null)
        .spawn()
        .expect("Failed to spawn true");
    process
        .wait_close_term(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .expect("Failed to wait for true");

    let start = Instant::now();
    drop(process);
    assert!(start.elapsed() < Duration::from_secs(1));
}
