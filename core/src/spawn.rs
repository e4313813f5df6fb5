//! Spawning children and the exec-status protocol
//!
//! [`SpawnCommand`] is the builder; [`SpawnCommand::spawn`] forks, runs the
//! child-startup protocol in the child, and in the parent drains the
//! exec-status pipe to turn the inherently racy fork/exec sequence into one
//! synchronous call: end-of-stream on the pipe means the child's
//! close-on-exec fired and exec succeeded; bytes mean a structured
//! [`StartupError`]; a hang past [`EXEC_STATUS_TIMEOUT`] means the child is
//! stuck between fork and exec and is forcibly torn down.

#![allow(unsafe_code)]

use crate::pipe::{self, PipeChannel};
use crate::preexec::{ChildSpec, ChildWiring, StartupError};
use crate::process::Process;
use crate::select::{wait_ready, WaitFd, WaitOutcome};
use crate::serializer;
use crate::timeout::Timeout;
use crate::{CoreError, Result};
use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bound on how long a parent waits for the child to reach `exec`
pub const EXEC_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// What to attach to one of a child's standard streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioPolicy {
    /// A pipe whose parent end lives on the resulting [`Process`]
    #[default]
    Pipe,
    /// `/dev/null`
    Null,
}

/// Builder for spawning a supervised child process
///
/// ```no_run
/// use procmux_core::SpawnCommand;
///
/// let process = SpawnCommand::new("/bin/echo")
///     .arg("hello")
///     .spawn()?;
/// # Ok::<(), procmux_core::CoreError>(())
/// ```
#[derive(Debug, Clone)]
pub struct SpawnCommand {
    program: String,
    argv: Vec<String>,
    env: Option<Vec<(String, String)>>,
    cwd: Option<PathBuf>,
    stdin: StdioPolicy,
    stdout: StdioPolicy,
    stderr: StdioPolicy,
    new_group: bool,
    keep_fds: Vec<RawFd>,
}

impl SpawnCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            argv: Vec::new(),
            env: None,
            cwd: None,
            stdin: StdioPolicy::default(),
            stdout: StdioPolicy::default(),
            stderr: StdioPolicy::default(),
            new_group: false,
            keep_fds: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace the child's environment with exactly these variables.
    /// Without this the child inherits the parent's environment.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, policy: StdioPolicy) -> Self {
        self.stdin = policy;
        self
    }

    pub fn stdout(mut self, policy: StdioPolicy) -> Self {
        self.stdout = policy;
        self
    }

    pub fn stderr(mut self, policy: StdioPolicy) -> Self {
        self.stderr = policy;
        self
    }

    /// Put the child in its own process group so the whole subtree can be
    /// signalled together
    pub fn new_process_group(mut self, enabled: bool) -> Self {
        self.new_group = enabled;
        self
    }

    /// Let the child inherit this descriptor across exec
    pub fn keep_fd(mut self, fd: RawFd) -> Self {
        self.keep_fds.push(fd);
        self
    }

    /// The argv the child will see: the caller's, or `{program}` when none
    /// was given.
    fn effective_argv(&self) -> Vec<String> {
        if self.argv.is_empty() {
            vec![self.program.clone()]
        } else {
            let mut argv = Vec::with_capacity(self.argv.len() + 1);
            argv.push(self.program.clone());
            argv.extend(self.argv.iter().cloned());
            argv
        }
    }

    /// Fork and exec, returning a [`Process`] once the child has
    /// successfully replaced its image.
    pub fn spawn(&self) -> Result<Process> {
        if serializer::should_redirect() {
            return serializer::spawn_on_worker(self.clone());
        }
        self.spawn_direct()
    }

    pub(crate) fn spawn_direct(&self) -> Result<Process> {
        pipe::ignore_sigpipe();
        if self.program.is_empty() {
            return Err(CoreError::spawn("empty program path", None));
        }
        let spec = self.build_child_spec()?;

        let stdin_pipe = self.make_pipe(self.stdin)?;
        let stdout_pipe = self.make_pipe(self.stdout)?;
        let stderr_pipe = self.make_pipe(self.stderr)?;
        let status = PipeChannel::new()?;
        let wiring = ChildWiring {
            stdin: stdin_pipe.as_ref().and_then(PipeChannel::read_fd),
            stdout: stdout_pipe.as_ref().and_then(PipeChannel::write_fd),
            stderr: stderr_pipe.as_ref().and_then(PipeChannel::write_fd),
            status: status
                .write_fd()
                .ok_or_else(|| CoreError::spawn("status pipe missing write end", None))?,
        };

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(CoreError::spawn(
                "fork failed",
                std::io::Error::last_os_error().raw_os_error(),
            ));
        }
        if pid == 0 {
            // Child: never returns.
            spec.run_in_child(wiring);
        }

        // Parent: release the child's ends so EOFs propagate.
        if let Some(pipe) = &stdin_pipe {
            pipe.close_read();
        }
        if let Some(pipe) = &stdout_pipe {
            pipe.close_write();
        }
        if let Some(pipe) = &stderr_pipe {
            pipe.close_write();
        }
        status.close_write();

        let mut process =
            Process::from_spawn(pid, stdin_pipe, stdout_pipe, stderr_pipe, self.new_group);
        match drain_status_pipe(&status) {
            Ok(None) => {
                debug!("Spawned '{}' as pid {}", self.program, pid);
                Ok(process)
            }
            Ok(Some(report)) => {
                // Child wrote its report and exited with 127; reap it.
                let _ = process.reap_blocking();
                warn!(
                    "Child startup failed for '{}': {}",
                    self.program,
                    report.message()
                );
                Err(CoreError::Spawn {
                    message: report.message(),
                    errno: report.errno(),
                })
            }
            Err(CoreError::Timeout(_)) => {
                warn!("Child {} hung between fork and exec, killing", pid);
                process.kill_and_reap();
                Err(CoreError::spawn("timed out waiting for child to exec", None))
            }
            Err(err) => {
                process.kill_and_reap();
                Err(err)
            }
        }
    }

    fn make_pipe(&self, policy: StdioPolicy) -> Result<Option<PipeChannel>> {
        match policy {
            StdioPolicy::Pipe => PipeChannel::new().map(Some),
            StdioPolicy::Null => Ok(None),
        }
    }

    fn build_child_spec(&self) -> Result<ChildSpec> {
        let program = to_cstring(self.program.as_bytes(), "program path")?;
        let argv = self
            .effective_argv()
            .into_iter()
            .map(|arg| to_cstring(arg.as_bytes(), "argv"))
            .collect::<Result<Vec<_>>>()?;
        let envp = match &self.env {
            Some(vars) => Some(
                vars.iter()
                    .map(|(k, v)| to_cstring(format!("{k}={v}").as_bytes(), "environment"))
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };
        let cwd = self
            .cwd
            .as_ref()
            .map(|dir| to_cstring(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;
        ChildSpec::new(
            program,
            argv,
            envp,
            cwd,
            self.new_group,
            self.keep_fds.clone(),
        )
    }
}

fn to_cstring(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| CoreError::spawn(format!("{what} contains an interior NUL byte"), None))
}

/// Drain the exec-status pipe under a bounded multiplexed read.
///
/// `Ok(None)` = end-of-stream with no bytes, exec succeeded. `Ok(Some)` =
/// the child's startup report. `Err(Timeout)` = the child never reached
/// exec within [`EXEC_STATUS_TIMEOUT`].
fn drain_status_pipe(status: &PipeChannel) -> Result<Option<StartupError>> {
    let fd = status
        .read_fd()
        .ok_or_else(|| CoreError::spawn("status pipe missing read end", None))?;
    let deadline = Timeout::Absolute(Instant::now() + EXEC_STATUS_TIMEOUT);
    let mut buf = [0u8; StartupError::WIRE_SIZE];
    let mut filled = 0usize;
    loop {
        let mut fds = [WaitFd::readable(fd)];
        match wait_ready(&mut fds, deadline, None)? {
            WaitOutcome::TimedOut => {
                return Err(CoreError::Timeout(
                    "exec-status pipe never closed".to_string(),
                ));
            }
            WaitOutcome::Ready(_) => {}
        }
        let n = status.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return match StartupError::decode(&buf[..filled]) {
                Some(report) => Ok(Some(report)),
                None => Err(CoreError::spawn(
                    "truncated startup report from child",
                    None,
                )),
            };
        }
        filled += n;
        if filled >= StartupError::WIRE_SIZE {
            return match StartupError::decode(&buf) {
                Some(report) => Ok(Some(report)),
                None => Err(CoreError::spawn("malformed startup report from child", None)),
            };
        }
    }
}
