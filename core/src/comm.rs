//! N-process 3-stream I/O gathering
//!
//! [`process_input_output`] multiplexes stdout/stderr reads and stdin
//! writes for any number of processes against a single [`Timeout`],
//! delivering output chunks to a pluggable [`OutputSink`] and pulling
//! stdin data from a pluggable [`InputSource`]. With
//! [`Timeout::RelativeWithReset`] the clock restarts on every successful
//! read or write, so the call fails only on true inactivity.

use crate::pipe::{self, Direction, PipeChannel};
use crate::process::{Process, ProcessStatus};
use crate::select::{wait_ready, WaitFd, WaitOutcome};
use crate::spawn::SpawnCommand;
use crate::timeout::{Timeout, TimeoutTimer};
use crate::{CoreError, Result};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Largest single read or write issued by the gathering loop
pub const IO_CHUNK_SIZE: usize = 64 * 1024;

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Receives output chunks as they are read
pub trait OutputSink {
    /// Deliver one chunk from process `index`'s stdout or stderr. An error
    /// aborts the whole gathering call; a sink enforcing a byte limit
    /// keeps what fits before returning [`CoreError::BufferFull`].
    fn on_output(&mut self, index: usize, stream: StreamKind, data: &[u8]) -> Result<()>;
}

/// Supplies stdin data on demand
pub trait InputSource {
    /// Next chunk for process `index`, or `None` when no more data is
    /// available right now. Closing the channel's write end is how a
    /// source signals end of input; leaving it open means "more later".
    fn next_chunk(&mut self, index: usize, stdin: &PipeChannel) -> Option<Vec<u8>>;
}

/// Tracked I/O state for one process
struct IoState {
    stdout_open: bool,
    stderr_open: bool,
    stdin_open: bool,
    pending: Vec<u8>,
    offset: usize,
}

impl IoState {
    fn has_pending(&self) -> bool {
        self.offset < self.pending.len()
    }
}

enum Slot {
    Stdout(usize),
    Stderr(usize),
    Stdin(usize),
}

/// Multiplex reads and writes for `processes` until every stdout and
/// stderr has reached end-of-stream.
///
/// Ready descriptors drain in array order within one iteration; there is
/// no fairness guarantee across iterations. `EPIPE` on a stdin write
/// closes that stdin early without failing the call. Genuine timeout
/// expiry is [`CoreError::Timeout`]; a sink's backpressure error aborts
/// the call with whatever the sink kept.
pub fn process_input_output(
    sink: &mut dyn OutputSink,
    processes: &mut [&mut Process],
    source: &mut dyn InputSource,
    timeout: Timeout,
) -> Result<()> {
    pipe::ignore_sigpipe();
    let mut timer = TimeoutTimer::start(timeout);
    let mut states = initialize(processes, source)?;

    let mut chunk = vec![0u8; IO_CHUNK_SIZE];
    while states.iter().any(|s| s.stdout_open || s.stderr_open) {
        let (mut fds, slots) = build_wait_set(processes, &states);
        let slice = timer.wait_slice();
        match wait_ready(&mut fds, Timeout::Relative(slice), None)? {
            WaitOutcome::TimedOut => {
                if timer.expired() {
                    warn!("I/O gathering timed out");
                    return Err(CoreError::Timeout(
                        "gathering child output timed out".to_string(),
                    ));
                }
                continue;
            }
            WaitOutcome::Ready(_) => {}
        }
        for (entry, slot) in fds.iter().zip(slots.iter()) {
            match *slot {
                Slot::Stdout(index) if entry.ready.readable || entry.ready.error => {
                    drain_output(
                        sink,
                        processes[index].stdout(),
                        index,
                        StreamKind::Stdout,
                        &mut states[index].stdout_open,
                        &mut chunk,
                        &mut timer,
                    )?;
                }
                Slot::Stderr(index) if entry.ready.readable || entry.ready.error => {
                    drain_output(
                        sink,
                        processes[index].stderr(),
                        index,
                        StreamKind::Stderr,
                        &mut states[index].stderr_open,
                        &mut chunk,
                        &mut timer,
                    )?;
                }
                Slot::Stdin(index) if entry.ready.writable || entry.ready.error => {
                    feed_stdin(source, processes[index].stdin(), index, &mut states[index], &mut timer)?;
                }
                _ => {}
            }
        }
    }
    debug!("I/O gathering complete for {} processes", processes.len());
    Ok(())
}

fn initialize(
    processes: &mut [&mut Process],
    source: &mut dyn InputSource,
) -> Result<Vec<IoState>> {
    let mut states = Vec::with_capacity(processes.len());
    for (index, process) in processes.iter().enumerate() {
        let stdout_open = process.stdout().and_then(PipeChannel::read_fd).is_some();
        let stderr_open = process.stderr().and_then(PipeChannel::read_fd).is_some();
        let mut state = IoState {
            stdout_open,
            stderr_open,
            stdin_open: false,
            pending: Vec::new(),
            offset: 0,
        };
        if let Some(stdin) = process.stdin() {
            if stdin.write_fd().is_some() {
                // Writes must never block the whole gathering loop.
                stdin.set_nonblocking(Direction::Write, true)?;
                if let Some(data) = source.next_chunk(index, stdin) {
                    state.pending = data;
                }
                state.stdin_open = stdin.write_fd().is_some();
            }
        }
        states.push(state);
    }
    Ok(states)
}

fn build_wait_set(processes: &[&mut Process], states: &[IoState]) -> (Vec<WaitFd>, Vec<Slot>) {
    let mut fds = Vec::new();
    let mut slots = Vec::new();
    for (index, state) in states.iter().enumerate() {
        if state.stdout_open {
            if let Some(fd) = processes[index].stdout().and_then(PipeChannel::read_fd) {
                fds.push(WaitFd::readable(fd));
                slots.push(Slot::Stdout(index));
            }
        }
        if state.stderr_open {
            if let Some(fd) = processes[index].stderr().and_then(PipeChannel::read_fd) {
                fds.push(WaitFd::readable(fd));
                slots.push(Slot::Stderr(index));
            }
        }
        if state.stdin_open && state.has_pending() {
            if let Some(fd) = processes[index].stdin().and_then(PipeChannel::write_fd) {
                fds.push(WaitFd::writable(fd));
                slots.push(Slot::Stdin(index));
            }
        }
    }
    (fds, slots)
}

fn drain_output(
    sink: &mut dyn OutputSink,
    channel: Option<&PipeChannel>,
    index: usize,
    stream: StreamKind,
    open: &mut bool,
    chunk: &mut [u8],
    timer: &mut TimeoutTimer,
) -> Result<()> {
    let Some(channel) = channel else {
        *open = false;
        return Ok(());
    };
    match channel.read(chunk) {
        Ok(0) => {
            channel.close_read();
            *open = false;
            timer.notify_progress();
            Ok(())
        }
        Ok(n) => {
            timer.notify_progress();
            sink.on_output(index, stream, &chunk[..n])
        }
        Err(CoreError::Io(err)) if err.raw_os_error() == Some(libc::EAGAIN) => Ok(()),
        Err(err) => Err(err),
    }
}

fn feed_stdin(
    source: &mut dyn InputSource,
    channel: Option<&PipeChannel>,
    index: usize,
    state: &mut IoState,
    timer: &mut TimeoutTimer,
) -> Result<()> {
    let Some(channel) = channel else {
        state.stdin_open = false;
        return Ok(());
    };
    match channel.write(&state.pending[state.offset..]) {
        // Zero bytes accepted is not an error; retry on a later wakeup.
        Ok(0) => Ok(()),
        Ok(n) => {
            state.offset += n;
            timer.notify_progress();
            if !state.has_pending() {
                state.pending.clear();
                state.offset = 0;
                if let Some(data) = source.next_chunk(index, channel) {
                    state.pending = data;
                }
                // The source may have closed the channel to signal EOF.
                state.stdin_open = channel.write_fd().is_some();
            }
            Ok(())
        }
        Err(CoreError::Io(err)) if err.raw_os_error() == Some(libc::EAGAIN) => Ok(()),
        Err(CoreError::Io(err)) if err.raw_os_error() == Some(libc::EPIPE) => {
            // The child stopped reading; expected, not an error.
            debug!("Child {index} closed its stdin early");
            channel.close_write();
            state.stdin_open = false;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Single-buffer accumulator with a byte limit
///
/// Concatenates all output across processes and streams. On overflow it
/// keeps exactly as much as fits before reporting
/// [`CoreError::BufferFull`], so partial output stays reachable.
#[derive(Debug)]
pub struct OutputCapture {
    buffer: Vec<u8>,
    limit: usize,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn into_string_lossy(self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

impl OutputSink for OutputCapture {
    fn on_output(&mut self, _index: usize, _stream: StreamKind, data: &[u8]) -> Result<()> {
        let space = self.limit - self.buffer.len();
        if data.len() <= space {
            self.buffer.extend_from_slice(data);
            Ok(())
        } else {
            self.buffer.extend_from_slice(&data[..space]);
            Err(CoreError::BufferFull { limit: self.limit })
        }
    }
}

/// Feeds each process one fixed byte string, then closes its stdin
#[derive(Debug)]
pub struct InputFeed {
    data: Vec<u8>,
    fed: HashSet<usize>,
}

impl InputFeed {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            fed: HashSet::new(),
        }
    }
}

impl InputSource for InputFeed {
    fn next_chunk(&mut self, index: usize, stdin: &PipeChannel) -> Option<Vec<u8>> {
        if self.fed.insert(index) && !self.data.is_empty() {
            Some(self.data.clone())
        } else {
            stdin.close_write();
            None
        }
    }
}

/// Run a command to completion: spawn, feed `input`, capture all output up
/// to `limit` bytes, then tear the child down.
pub fn run_capture(
    command: &SpawnCommand,
    input: &[u8],
    limit: usize,
    timeout: Timeout,
) -> Result<(ProcessStatus, Vec<u8>)> {
    let mut process = command.spawn()?;
    let mut capture = OutputCapture::new(limit);
    let mut feed = InputFeed::new(input);
    let gathered = {
        let mut processes = [&mut process];
        process_input_output(&mut capture, &mut processes, &mut feed, timeout)
    };
    match gathered {
        Ok(()) => {
            process.wait_close_term(
                Duration::from_secs(5),
                Duration::from_secs(1),
                Duration::from_secs(5),
            )?;
            Ok((process.status(), capture.into_bytes()))
        }
        Err(err) => {
            let _ = process.wait_close_term(
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(5),
            );
            Err(err)
        }
    }
}
