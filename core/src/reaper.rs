//! Background zombie reaper
//!
//! A lazily-started pool of worker threads fed by a FIFO of pure-data
//! requests. Each request owns its pid exclusively; a worker keeps
//! escalating signals and polling until the child is confirmed terminated,
//! with no upper bound on patience. This is the fire-and-forget backstop
//! behind [`crate::Process`]'s drop path.

use crate::process::{poll_waitpid, ProcessStatus};
use crate::serializer;
use crate::{CoreError, Result};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How often a reaper worker re-sends its escalation signal
const REAP_SIGNAL_INTERVAL: Duration = Duration::from_secs(10);

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(200);
const WORKER_COUNT: usize = 2;

#[derive(Debug, Clone, Copy)]
struct ReapRequest {
    pid: i32,
    group: bool,
}

struct Queue {
    items: Mutex<VecDeque<ReapRequest>>,
    available: Condvar,
}

fn queue() -> &'static Queue {
    static QUEUE: OnceLock<Queue> = OnceLock::new();
    QUEUE.get_or_init(|| {
        for index in 0..WORKER_COUNT {
            let result = std::thread::Builder::new()
                .name(format!("procmux-reaper-{index}"))
                .spawn(worker_loop);
            if let Err(err) = result {
                error!("Failed to start reaper worker: {err}");
            }
        }
        Queue {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    })
}

/// Queue a pid for unboundedly patient background reaping
pub(crate) fn submit(pid: i32, group: bool) {
    let queue = queue();
    let mut items = queue.items.lock().unwrap();
    items.push_back(ReapRequest { pid, group });
    queue.available.notify_one();
}

fn worker_loop() {
    // Blocks until the initializing thread finishes building the queue.
    let queue = queue();
    loop {
        let request = {
            let mut items = queue.items.lock().unwrap();
            loop {
                if let Some(request) = items.pop_front() {
                    break request;
                }
                items = queue.available.wait(items).unwrap();
            }
        };
        reap(request);
    }
}

/// Alternate SIGTERM and SIGKILL every [`REAP_SIGNAL_INTERVAL`] until the
/// child is observed terminal.
fn reap(request: ReapRequest) {
    let pid = Pid::from_raw(request.pid);
    let mut next_signal = Signal::SIGTERM;
    let mut last_signal: Option<Instant> = None;
    loop {
        match poll_status(pid) {
            Ok(Some(status)) if status.terminated() => {
                debug!("Reaped process {pid} with status {status:?}");
                return;
            }
            Ok(_) => {}
            // Nothing left to wait for (already reaped elsewhere).
            Err(CoreError::Io(err)) if err.raw_os_error() == Some(libc::ECHILD) => return,
            // A transient failure must not abandon the request; patience
            // is the whole contract here.
            Err(err) => warn!("Status poll for {pid} failed, retrying: {err}"),
        }
        if last_signal.is_none_or(|at| at.elapsed() >= REAP_SIGNAL_INTERVAL) {
            warn!("Process {pid} still alive, sending {next_signal}");
            send(pid, request.group, next_signal);
            next_signal = match next_signal {
                Signal::SIGTERM => Signal::SIGKILL,
                _ => Signal::SIGTERM,
            };
            last_signal = Some(Instant::now());
        }
        std::thread::sleep(REAP_POLL_INTERVAL);
    }
}

/// One status poll, redirected to the serializer worker when only the
/// forking thread may wait on its children.
fn poll_status(pid: Pid) -> Result<Option<ProcessStatus>> {
    if serializer::should_redirect() {
        serializer::wait_status_on_worker(pid.as_raw())
    } else {
        poll_waitpid(pid)
    }
}

fn send(pid: Pid, group: bool, signal: Signal) {
    let result = if group {
        killpg(pid, signal)
    } else {
        kill(pid, signal)
    };
    // ESRCH and friends just mean the next poll will observe the exit.
    let _ = result;
}
