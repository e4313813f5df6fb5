//! Optional serialization of fork and waitpid onto one worker thread
//!
//! Some platforms only allow the thread that forked a child to wait on it.
//! When enabled, every spawn and status poll is redirected to a single
//! lazily-started worker thread; the submitting thread blocks on a
//! per-item reply channel. A thread-id guard stops the worker from
//! redirecting to itself when it spawns or polls.

use crate::process::{poll_waitpid, Process, ProcessStatus};
use crate::spawn::SpawnCommand;
use crate::{CoreError, Result};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Condvar, Mutex, OnceLock};
use std::thread::ThreadId;
use tracing::{debug, error};

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Route all spawn and wait-status operations through the dedicated
/// worker thread. Affects operations that start after the call.
pub fn set_serialized(enabled: bool) {
    debug!("Fork/waitpid serialization {}", if enabled { "enabled" } else { "disabled" });
    ENABLED.store(enabled, Ordering::SeqCst);
}

/// Whether serialization is currently enabled
pub fn is_serialized() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

enum WorkItem {
    Spawn(SpawnCommand, mpsc::Sender<Result<Process>>),
    WaitStatus(i32, mpsc::Sender<Result<Option<ProcessStatus>>>),
}

struct WorkerState {
    items: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
    thread_id: OnceLock<ThreadId>,
}

static STATE: OnceLock<WorkerState> = OnceLock::new();

fn state() -> &'static WorkerState {
    STATE.get_or_init(|| {
        let result = std::thread::Builder::new()
            .name("procmux-serializer".to_string())
            .spawn(worker_loop);
        if let Err(err) = result {
            error!("Failed to start serializer worker: {err}");
        }
        WorkerState {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            thread_id: OnceLock::new(),
        }
    })
}

/// Whether the current operation must be handed to the worker: enabled,
/// and we are not already on the worker thread.
pub(crate) fn should_redirect() -> bool {
    if !is_serialized() {
        return false;
    }
    match STATE.get() {
        Some(state) => state
            .thread_id
            .get()
            .is_none_or(|id| *id != std::thread::current().id()),
        None => true,
    }
}

pub(crate) fn spawn_on_worker(command: SpawnCommand) -> Result<Process> {
    let (reply, result) = mpsc::channel();
    submit(WorkItem::Spawn(command, reply));
    result
        .recv()
        .map_err(|_| CoreError::Other("serializer worker dropped a spawn request".to_string()))?
}

pub(crate) fn wait_status_on_worker(pid: i32) -> Result<Option<ProcessStatus>> {
    let (reply, result) = mpsc::channel();
    submit(WorkItem::WaitStatus(pid, reply));
    result
        .recv()
        .map_err(|_| CoreError::Other("serializer worker dropped a wait request".to_string()))?
}

fn submit(item: WorkItem) {
    let state = state();
    let mut items = state.items.lock().unwrap();
    items.push_back(item);
    state.available.notify_one();
}

fn worker_loop() {
    let state = state();
    let _ = state.thread_id.set(std::thread::current().id());
    loop {
        let item = {
            let mut items = state.items.lock().unwrap();
            loop {
                if let Some(item) = items.pop_front() {
                    break item;
                }
                items = state.available.wait(items).unwrap();
            }
        };
        // A failing item is attached to its reply, never crashes the
        // worker; the loop itself never exits.
        match item {
            WorkItem::Spawn(command, reply) => {
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| command.spawn_direct()));
                let result = outcome.unwrap_or_else(|_| {
                    Err(CoreError::Other(
                        "spawn panicked on the serializer worker".to_string(),
                    ))
                });
                let _ = reply.send(result);
            }
            WorkItem::WaitStatus(pid, reply) => {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    poll_waitpid(Pid::from_raw(pid))
                }));
                let result = outcome.unwrap_or_else(|_| {
                    Err(CoreError::Other(
                        "status poll panicked on the serializer worker".to_string(),
                    ))
                });
                let _ = reply.send(result);
            }
        }
    }
}
