//! Integration tests for the I/O gathering engine
//!
//! These tests verify that process_input_output correctly:
//! - Round-trips data through a cat child across chunk-size boundaries
//! - Gathers output from many children, attributed per process
//! - Enforces capture limits and overall / idle-reset timeouts

#![cfg(unix)]

use procmux_core::{
    process_input_output, run_capture, CoreError, InputFeed, OutputCapture, OutputSink, Process,
    SpawnCommand, StreamKind, Timeout, IO_CHUNK_SIZE,
};
use std::time::Duration;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_cat_round_trip_across_chunk_sizes() {
    for len in [0, 1, 512, IO_CHUNK_SIZE, IO_CHUNK_SIZE * 3 + 17] {
        let input = pattern(len);
        let (status, output) = run_capture(
            &SpawnCommand::new("/bin/cat"),
            &input,
            IO_CHUNK_SIZE * 8,
            Timeout::Relative(Duration::from_secs(30)),
        )
        .expect("Failed to run cat");
        assert!(status.success(), "cat failed for {len} bytes");
        assert_eq!(output, input, "Round trip mismatch for {len} bytes");
    }
}

/// Sink that keeps one buffer per process index
struct PerProcessCapture {
    buffers: Vec<Vec<u8>>,
}

impl OutputSink for PerProcessCapture {
    fn on_output(
        &mut self,
        index: usize,
        _stream: StreamKind,
        data: &[u8],
    ) -> procmux_core::Result<()> {
        self.buffers[index].extend_from_slice(data);
        Ok(())
    }
}

#[test]
fn test_five_processes_gather_per_process_content() {
    let tags = ["alpha", "bravo", "charlie", "delta", "echo"];
    let mut children: Vec<Process> = tags
        .iter()
        .map(|tag| {
            SpawnCommand::new("/bin/sh")
                .arg("-c")
                .arg(format!("echo {tag}"))
                .spawn()
                .expect("Failed to spawn echo child")
        })
        .collect();

    let mut sink = PerProcessCapture {
        buffers: vec![Vec::new(); tags.len()],
    };
    let mut feed = InputFeed::new(Vec::new());
    {
        let mut refs: Vec<&mut Process> = children.iter_mut().collect();
        process_input_output(
            &mut sink,
            &mut refs,
            &mut feed,
            Timeout::Relative(Duration::from_secs(30)),
        )
        .expect("Gathering failed");
    }

    for (index, tag) in tags.iter().enumerate() {
        assert_eq!(
            sink.buffers[index],
            format!("{tag}\n").into_bytes(),
            "Wrong content for process {index}"
        );
    }
    for child in &mut children {
        child
            .wait_close_term(
                Duration::from_secs(5),
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .expect("Failed to wait for echo child");
        assert!(child.status().success());
    }
}

#[test]
fn test_backpressure_keeps_exactly_the_limit() {
    const LIMIT: usize = 4;
    let mut process = SpawnCommand::new("/bin/sh")
        .arg("-c")
        .arg("printf 0123456789")
        .spawn()
        .expect("Failed to spawn printf");

    let mut capture = OutputCapture::new(LIMIT);
    let mut feed = InputFeed::new(Vec::new());
    let err = {
        let mut refs = [&mut process];
        process_input_output(
            &mut capture,
            &mut refs,
            &mut feed,
            Timeout::Relative(Duration::from_secs(30)),
        )
        .expect_err("Gathering should hit the capture limit")
    };
    assert!(matches!(err, CoreError::BufferFull { limit: LIMIT }));
    assert_eq!(capture.as_bytes(), b"0123");

    process
        .wait_close_term(Duration::ZERO, Duration::from_secs(1), Duration::from_secs(2))
        .expect("Failed to tear down printf");
}

#[test]
fn test_fixed_timeout_fails_before_late_output() {
    let mut process = SpawnCommand::new("/bin/sh")
        .arg("-c")
        .arg("sleep 3; echo late")
        .spawn()
        .expect("Failed to spawn sleeper");

    let mut capture = OutputCapture::new(IO_CHUNK_SIZE);
    let mut feed = InputFeed::new(Vec::new());
    let err = {
        let mut refs = [&mut process];
        process_input_output(
            &mut capture,
            &mut refs,
            &mut feed,
            Timeout::Relative(Duration::from_millis(300)),
        )
        .expect_err("Gathering should time out")
    };
    assert!(matches!(err, CoreError::Timeout(_)));
    assert!(capture.as_bytes().is_empty());

    process
        .wait_close_term(Duration::ZERO, Duration::ZERO, Duration::from_secs(2))
        .expect("Failed to tear down sleeper");
}

#[test]
fn test_idle_reset_timeout_survives_steady_output() {
    // Total runtime well beyond the idle window, but each line of output
    // arrives inside it and resets the clock.
    let mut process = SpawnCommand::new("/bin/sh")
        .arg("-c")
        .arg("for i in 1 2 3 4 5 6; do echo tick; sleep 0.4; done")
        .spawn()
        .expect("Failed to spawn ticker");

    let mut capture = OutputCapture::new(IO_CHUNK_SIZE);
    let mut feed = InputFeed::new(Vec::new());
    {
        let mut refs = [&mut process];
        process_input_output(
            &mut capture,
            &mut refs,
            &mut feed,
            Timeout::RelativeWithReset(Duration::from_secs(1)),
        )
        .expect("Idle-reset gathering should survive steady output");
    }
    assert_eq!(capture.as_bytes(), b"tick\ntick\ntick\ntick\ntick\ntick\n".as_slice());

    process
        .wait_close_term(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .expect("Failed to wait for ticker");
}

#[test]
fn test_stderr_is_gathered_and_tagged() {
    let mut process = SpawnCommand::new("/bin/sh")
        .arg("-c")
        .arg("echo out; echo err >&2")
        .spawn()
        .expect("Failed to spawn sh");

    struct TaggedCapture {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    }
    impl OutputSink for TaggedCapture {
        fn on_output(
            &mut self,
            _index: usize,
            stream: StreamKind,
            data: &[u8],
        ) -> procmux_core::Result<()> {
            match stream {
                StreamKind::Stdout => self.stdout.extend_from_slice(data),
                StreamKind::Stderr => self.stderr.extend_from_slice(data),
            }
            Ok(())
        }
    }

    let mut sink = TaggedCapture {
        stdout: Vec::new(),
        stderr: Vec::new(),
    };
    let mut feed = InputFeed::new(Vec::new());
    {
        let mut refs = [&mut process];
        process_input_output(
            &mut sink,
            &mut refs,
            &mut feed,
            Timeout::Relative(Duration::from_secs(30)),
        )
        .expect("Gathering failed");
    }
    assert_eq!(sink.stdout, b"out\n");
    assert_eq!(sink.stderr, b"err\n");

    process
        .wait_close_term(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .expect("Failed to wait for sh");
}

#[test]
fn test_early_stdin_close_by_child_is_not_an_error() {
    // head stops reading after one line; the engine must treat the broken
    // pipe as an early stdin close and still gather the output.
    let big_input = pattern(IO_CHUNK_SIZE * 4);
    let mut input = b"first line\n".to_vec();
    input.extend_from_slice(&big_input);

    let command = SpawnCommand::new("head").arg("-n").arg("1");
    let (status, output) = run_capture(
        &command,
        &input,
        IO_CHUNK_SIZE,
        Timeout::Relative(Duration::from_secs(30)),
    )
    .expect("head run should succeed despite unread stdin");
    assert!(status.success());
    assert_eq!(output, b"first line\n");
}
