//! Process ownership, status polling and graduated termination

use crate::pipe::PipeChannel;
use crate::reaper;
use crate::serializer;
use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg};
pub use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How long [`Process::wait_close_term`] waits after SIGKILL before giving
/// up and reporting a fatal termination error
pub const KILL_WAIT_CEILING: Duration = Duration::from_secs(60);

/// Kill ceiling used on the drop path, which must stay bounded; anything
/// still alive after this is handed to the zombie reaper.
const DROP_KILL_CEILING: Duration = Duration::from_secs(5);

const BACKOFF_INITIAL: Duration = Duration::from_millis(1);
const BACKOFF_CAP: Duration = Duration::from_millis(100);

/// Normalized child status
///
/// `Running` is initial; `Stopped` is non-terminal and can return to
/// `Running`; `Exited` and `Signaled` are terminal and sticky once
/// observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The child is (as far as the last poll knew) still running
    Running,
    /// The child is stopped by a job-control signal
    Stopped(Signal),
    /// The child exited with this code
    Exited(i32),
    /// The child was terminated by this signal
    Signaled(Signal),
}

impl ProcessStatus {
    /// Whether the status is terminal
    pub fn terminated(&self) -> bool {
        matches!(self, ProcessStatus::Exited(_) | ProcessStatus::Signaled(_))
    }

    /// Whether the child exited with code 0
    pub fn success(&self) -> bool {
        matches!(self, ProcessStatus::Exited(0))
    }
}

/// An owned child process: its pid, cached status, and the parent ends of
/// its standard streams
///
/// Dropping a still-running process runs a bounded graceful teardown and,
/// if the child outlives it, hands the pid to the background zombie
/// reaper. A process is therefore always eventually reaped, but callers
/// that care about the exit status should call
/// [`Process::wait_close_term`] themselves.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    status: ProcessStatus,
    stdin: Option<PipeChannel>,
    stdout: Option<PipeChannel>,
    stderr: Option<PipeChannel>,
    group: bool,
    handed_off: bool,
}

impl Process {
    pub(crate) fn from_spawn(
        pid: libc::pid_t,
        stdin: Option<PipeChannel>,
        stdout: Option<PipeChannel>,
        stderr: Option<PipeChannel>,
        group: bool,
    ) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            status: ProcessStatus::Running,
            stdin,
            stdout,
            stderr,
            group,
            handed_off: false,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// The child's process-group id, when it leads its own group
    pub fn pgid(&self) -> Option<i32> {
        self.group.then(|| self.pid.as_raw())
    }

    /// The last polled status. Does not touch the OS; see
    /// [`Process::poll_status`].
    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn stdin(&self) -> Option<&PipeChannel> {
        self.stdin.as_ref()
    }

    pub fn stdout(&self) -> Option<&PipeChannel> {
        self.stdout.as_ref()
    }

    pub fn stderr(&self) -> Option<&PipeChannel> {
        self.stderr.as_ref()
    }

    /// Close all std-stream handles, pressuring the child with EOF on its
    /// stdin and SIGPIPE on its writes.
    pub fn close_streams(&mut self) {
        for channel in [self.stdin.take(), self.stdout.take(), self.stderr.take()]
            .into_iter()
            .flatten()
        {
            channel.close();
        }
    }

    /// Poll the child non-blockingly and cache the result. A no-op once a
    /// terminal status has been observed: terminal states are sticky and
    /// never re-polled.
    pub fn poll_status(&mut self) -> Result<ProcessStatus> {
        if self.status.terminated() {
            return Ok(self.status);
        }
        let polled = if serializer::should_redirect() {
            serializer::wait_status_on_worker(self.pid.as_raw())?
        } else {
            poll_waitpid(self.pid)?
        };
        if let Some(status) = polled {
            self.status = status;
        }
        Ok(self.status)
    }

    /// Graduated termination: passive wait, stream close, SIGTERM, SIGKILL.
    ///
    /// Phases with a zero budget are skipped; every phase returns early
    /// once the child is terminal. The SIGKILL phase always runs and waits
    /// up to [`KILL_WAIT_CEILING`]; a child still alive after that is a
    /// fatal [`CoreError::Termination`] and the caller must not assume
    /// cleanup succeeded. Calling this again on an already-terminated
    /// process is a safe no-op.
    pub fn wait_close_term(
        &mut self,
        wait_initial: Duration,
        wait_close: Duration,
        wait_term: Duration,
    ) -> Result<()> {
        self.wait_close_term_inner(wait_initial, wait_close, wait_term, KILL_WAIT_CEILING)
    }

    fn wait_close_term_inner(
        &mut self,
        wait_initial: Duration,
        wait_close: Duration,
        wait_term: Duration,
        kill_ceiling: Duration,
    ) -> Result<()> {
        if self.poll_status()?.terminated() {
            return Ok(());
        }
        if !wait_initial.is_zero() && self.passive_wait(wait_initial)? {
            return Ok(());
        }
        if !wait_close.is_zero() {
            self.close_streams();
            if self.passive_wait(wait_close)? {
                return Ok(());
            }
        }
        if !wait_term.is_zero() {
            debug!("Sending SIGTERM to process {}", self.pid);
            self.send_signal(Signal::SIGTERM)?;
            if self.passive_wait(wait_term)? {
                return Ok(());
            }
        }
        debug!("Sending SIGKILL to process {}", self.pid);
        self.send_signal(Signal::SIGKILL)?;
        if self.passive_wait(kill_ceiling)? {
            return Ok(());
        }
        error!("Process {} survived SIGKILL", self.pid);
        Err(CoreError::Termination(format!(
            "process {} did not terminate after SIGKILL",
            self.pid
        )))
    }

    /// Poll-and-sleep with exponential backoff until the child is terminal
    /// or the budget runs out. Returns whether the child terminated.
    fn passive_wait(&mut self, budget: Duration) -> Result<bool> {
        let deadline = Instant::now() + budget;
        let mut backoff = BACKOFF_INITIAL;
        loop {
            if self.poll_status()?.terminated() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    /// Deliver a signal to the pid, or to the whole group when the child
    /// leads one. A target that is already gone is not an error.
    fn send_signal(&self, signal: Signal) -> Result<()> {
        let result = if self.group {
            killpg(self.pid, signal)
        } else {
            kill(self.pid, signal)
        };
        match result {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) | Err(Errno::EPERM) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Blocking reap of a child known to be exiting, caching the terminal
    /// status so the drop path stays quiet.
    pub(crate) fn reap_blocking(&mut self) -> Result<ProcessStatus> {
        if self.status.terminated() {
            return Ok(self.status);
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.status = ProcessStatus::Exited(code);
                    return Ok(self.status);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.status = ProcessStatus::Signaled(signal);
                    return Ok(self.status);
                }
                Ok(_) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Forcible teardown used when a spawn fails mid-protocol.
    pub(crate) fn kill_and_reap(&mut self) {
        let _ = self.send_signal(Signal::SIGKILL);
        if self.reap_blocking().is_err() {
            reaper::submit(self.pid.as_raw(), self.group);
            self.handed_off = true;
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.handed_off || self.status.terminated() {
            return;
        }
        let result = self.wait_close_term_inner(
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(5),
            DROP_KILL_CEILING,
        );
        if result.is_err() || !self.status.terminated() {
            warn!("Handing process {} to the zombie reaper", self.pid);
            reaper::submit(self.pid.as_raw(), self.group);
            self.handed_off = true;
        }
    }
}

/// One non-blocking status poll, shared with the serializer worker
pub(crate) fn poll_waitpid(pid: Pid) -> Result<Option<ProcessStatus>> {
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    match waitpid(pid, Some(flags)) {
        Ok(WaitStatus::StillAlive) => Ok(None),
        Ok(WaitStatus::Exited(_, code)) => Ok(Some(ProcessStatus::Exited(code))),
        Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(ProcessStatus::Signaled(signal))),
        Ok(WaitStatus::Stopped(_, signal)) => Ok(Some(ProcessStatus::Stopped(signal))),
        Ok(WaitStatus::Continued(_)) => Ok(Some(ProcessStatus::Running)),
        Ok(_) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
