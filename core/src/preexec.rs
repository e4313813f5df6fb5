//! Child-startup protocol run between `fork` and `exec`
//!
//! The forked child is a minimal-guarantees environment: the heap, locks
//! and runtime state are frozen copies of the parent's, so everything here
//! is prepared before the fork and the child-side path performs no
//! allocation and takes no locks. Failures do not unwind across the fork
//! boundary; the setup path is a tagged-result function whose error arm is
//! a fixed-layout [`StartupError`] written to the exec-status pipe in a
//! single `write()`, after which the child calls `_exit(127)`.
//!
//! On successful `exec` the status pipe's close-on-exec flag closes it and
//! the parent reads end-of-stream. Silence on the pipe means success.

#![allow(unsafe_code)]

use crate::{CoreError, Result};
use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::sync::OnceLock;

/// Exit code of a child that failed before or during `exec`
pub const CHILD_FAILURE_EXIT: i32 = 127;

const MESSAGE_CAPACITY: usize = 256;

/// Largest descriptor limit the close-on-exec sweep will iterate over
const DESCRIPTOR_LIMIT_CEILING: u64 = 1_048_576;

/// Structured startup failure reported by the child over the exec-status
/// pipe
///
/// Fixed layout, constructed without allocation, written as raw bytes in a
/// single `write()` of [`StartupError::WIRE_SIZE`] bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StartupError {
    message: [u8; MESSAGE_CAPACITY],
    errno: i32,
}

impl StartupError {
    /// Exact number of bytes a child writes for one report
    pub const WIRE_SIZE: usize = std::mem::size_of::<StartupError>();

    /// Build a report from a stage message and an OS error code. The
    /// message is truncated to the fixed buffer; 0 means "no errno".
    pub fn new(stage: &str, errno: i32) -> Self {
        let mut message = [0u8; MESSAGE_CAPACITY];
        let src = stage.as_bytes();
        let len = src.len().min(MESSAGE_CAPACITY - 1);
        message[..len].copy_from_slice(&src[..len]);
        Self { message, errno }
    }

    /// The stage message, up to the first NUL
    pub fn message(&self) -> String {
        let end = self
            .message
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MESSAGE_CAPACITY);
        String::from_utf8_lossy(&self.message[..end]).into_owned()
    }

    /// The OS error code, if the failing call reported one
    pub fn errno(&self) -> Option<i32> {
        (self.errno != 0).then_some(self.errno)
    }

    /// The wire representation, suitable for a single `write()`
    pub fn as_bytes(&self) -> &[u8] {
        // repr(C) POD with no padding invariants beyond zero-init.
        unsafe { std::slice::from_raw_parts((self as *const Self).cast(), Self::WIRE_SIZE) }
    }

    /// Decode one report from bytes read off the status pipe
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast()) })
    }
}

/// Process-wide descriptor limit used by the close-on-exec sweep
///
/// `sysconf(_SC_OPEN_MAX)` sanity-checked against a ceiling, falling back
/// to `RLIMIT_NOFILE`. Computed once before the first fork and cached, so
/// the child never has to compute it.
pub fn descriptor_limit() -> Result<usize> {
    static LIMIT: OnceLock<usize> = OnceLock::new();
    if let Some(limit) = LIMIT.get() {
        return Ok(*limit);
    }
    let limit = compute_descriptor_limit()?;
    Ok(*LIMIT.get_or_init(|| limit))
}

fn compute_descriptor_limit() -> Result<usize> {
    let raw = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if raw > 0 && (raw as u64) <= DESCRIPTOR_LIMIT_CEILING {
        return Ok(raw as usize);
    }

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if rc == 0 && rlim.rlim_cur > 0 {
        let cur = rlim.rlim_cur as u64;
        return Ok(cur.min(DESCRIPTOR_LIMIT_CEILING) as usize);
    }
    Err(CoreError::spawn(
        "failed to determine descriptor limit",
        std::io::Error::last_os_error().raw_os_error(),
    ))
}

/// Raw descriptors the child wires onto fds 0/1/2 plus the status pipe's
/// write end. Captured from the pipe channels before the fork so the child
/// never touches a lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildWiring {
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
    pub status: RawFd,
}

/// Everything the child needs, prepared in the parent
///
/// Argv/envp are held as `CString`s with NUL-terminated pointer arrays
/// built up front; the heap blocks do not move, so the pointers stay valid
/// across the fork. Not `Send`: a spec is built, forked over, and dropped
/// on one thread.
pub(crate) struct ChildSpec {
    program: CString,
    #[allow(dead_code)]
    argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp: Option<Vec<CString>>,
    envp_ptrs: Vec<*const libc::c_char>,
    cwd: Option<CString>,
    new_group: bool,
    keep_fds: Vec<RawFd>,
    descriptor_limit: usize,
}

impl ChildSpec {
    pub(crate) fn new(
        program: CString,
        argv: Vec<CString>,
        envp: Option<Vec<CString>>,
        cwd: Option<CString>,
        new_group: bool,
        keep_fds: Vec<RawFd>,
    ) -> Result<Self> {
        // Fail fast in the parent rather than invisibly inside the child.
        let descriptor_limit = descriptor_limit()?;

        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv.iter().map(|arg| arg.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        let envp_ptrs = match &envp {
            Some(vars) => {
                let mut ptrs: Vec<*const libc::c_char> =
                    vars.iter().map(|var| var.as_ptr()).collect();
                ptrs.push(std::ptr::null());
                ptrs
            }
            None => Vec::new(),
        };

        Ok(Self {
            program,
            argv,
            argv_ptrs,
            envp,
            envp_ptrs,
            cwd,
            new_group,
            keep_fds,
            descriptor_limit,
        })
    }

    /// Entry point in the forked child. Ends in `exec` or in one status
    /// write followed by `_exit(127)`; never returns normally.
    pub(crate) fn run_in_child(&self, wiring: ChildWiring) -> ! {
        let err = match self.child_setup(&wiring) {
            Ok(never) => match never {},
            Err(err) => err,
        };
        let bytes = err.as_bytes();
        unsafe {
            libc::write(wiring.status, bytes.as_ptr().cast(), bytes.len());
            libc::_exit(CHILD_FAILURE_EXIT)
        }
    }

    /// Async-signal-safe setup path: no allocation, no locks, libc only.
    fn child_setup(&self, wiring: &ChildWiring) -> std::result::Result<Infallible, StartupError> {
        reset_signals();

        if self.new_group && unsafe { libc::setpgid(0, 0) } != 0 {
            return Err(stage_error("setpgid failed in child"));
        }
        if let Some(cwd) = &self.cwd {
            if unsafe { libc::chdir(cwd.as_ptr()) } != 0 {
                return Err(stage_error("chdir failed in child"));
            }
        }

        wire_stream(wiring.stdin, 0)?;
        wire_stream(wiring.stdout, 1)?;
        wire_stream(wiring.stderr, 2)?;

        self.sweep_cloexec();

        unsafe {
            if self.envp.is_some() {
                libc::execve(
                    self.program.as_ptr(),
                    self.argv_ptrs.as_ptr(),
                    self.envp_ptrs.as_ptr(),
                );
            } else {
                libc::execvp(self.program.as_ptr(), self.argv_ptrs.as_ptr());
            }
        }
        Err(stage_error("exec failed"))
    }

    /// Mark every descriptor above the standard streams close-on-exec,
    /// minus the keep-list. The status pipe stays close-on-exec from
    /// creation, which is the success signal.
    fn sweep_cloexec(&self) {
        for fd in 3..self.descriptor_limit as RawFd {
            if self.keep_fds.contains(&fd) {
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
                if flags >= 0 {
                    unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
                }
            } else {
                // EBADF for unused slots is expected and ignored.
                unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
            }
        }
    }
}

fn stage_error(stage: &str) -> StartupError {
    StartupError::new(
        stage,
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
    )
}

/// Restore default dispositions and clear the inherited signal mask
fn reset_signals() {
    for sig in 1..=31 {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        unsafe { libc::signal(sig, libc::SIG_DFL) };
    }
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
    }
}

/// Attach a supplied pipe end, or `/dev/null`, onto a standard fd. `dup2`
/// clears close-on-exec on the target; the equal-fd case clears it by hand
/// because `dup2` is a no-op there.
fn wire_stream(source: Option<RawFd>, target: RawFd) -> std::result::Result<(), StartupError> {
    let source = match source {
        Some(fd) => fd,
        None => {
            let fd = unsafe { libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR) };
            if fd < 0 {
                return Err(stage_error("failed to open /dev/null in child"));
            }
            fd
        }
    };
    if source == target {
        let flags = unsafe { libc::fcntl(target, libc::F_GETFD) };
        if flags < 0 || unsafe { libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0
        {
            return Err(stage_error("failed to clear close-on-exec in child"));
        }
        return Ok(());
    }
    if unsafe { libc::dup2(source, target) } < 0 {
        return Err(stage_error("dup2 failed in child"));
    }
    Ok(())
}
