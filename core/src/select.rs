//! Readiness multiplexer with layered backend fallback
//!
//! [`wait_ready`] waits for read/write readiness on a set of descriptors
//! under a single [`Timeout`]. It is implemented by layered platform
//! backends, tried in order: epoll where available, then `poll(2)`, then
//! `select(2)`. Selection happens at runtime: a backend that is
//! categorically unavailable on the running kernel reports
//! [`CoreError::Unsupported`] internally and the multiplexer degrades to
//! the next one. The sentinel never reaches callers.
//!
//! Every wait runs in bounded slices (at most [`MAX_WAIT_SLICE`]) so that a
//! cooperating [`CancelToken`] is observed even when the caller asked for an
//! infinite wait. A token also carries a self-pipe whose read end is
//! watched as one more descriptor, which makes cancellation prompt rather
//! than slice-granular.

#![allow(unsafe_code)]

use crate::pipe::{Direction, PipeChannel};
use crate::timeout::{Timeout, TimeoutTimer};
use crate::{CoreError, Result};
use nix::errno::Errno;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which kinds of readiness a caller is interested in
#[derive(Debug, Clone, Copy, Default)]
pub struct Interest {
    /// Wake when the descriptor becomes readable
    pub read: bool,
    /// Wake when the descriptor becomes writable
    pub write: bool,
}

/// Per-descriptor readiness reported by a wait
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    /// Data (or end-of-stream) can be read without blocking
    pub readable: bool,
    /// A write would be accepted without blocking
    pub writable: bool,
    /// The descriptor is in an error state and should be closed
    pub error: bool,
}

impl Readiness {
    /// Whether any condition fired for this descriptor
    pub fn any(&self) -> bool {
        self.readable || self.writable || self.error
    }
}

/// One entry in a wait set
#[derive(Debug)]
pub struct WaitFd {
    /// The descriptor to watch
    pub fd: RawFd,
    /// What to wait for
    pub interest: Interest,
    /// Filled in by the wait
    pub ready: Readiness,
}

impl WaitFd {
    /// Watch a descriptor for readability
    pub fn readable(fd: RawFd) -> Self {
        Self {
            fd,
            interest: Interest {
                read: true,
                write: false,
            },
            ready: Readiness::default(),
        }
    }

    /// Watch a descriptor for writability
    pub fn writable(fd: RawFd) -> Self {
        Self {
            fd,
            interest: Interest {
                read: false,
                write: true,
            },
            ready: Readiness::default(),
        }
    }
}

/// Result of a successful wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least this many descriptors have readiness set
    Ready(usize),
    /// The full timeout elapsed with no descriptor ready
    TimedOut,
}

/// Cooperative cancellation for blocked waits
///
/// A token pairs a flag with a self-pipe. [`CancelToken::cancel`] sets the
/// flag and writes a wake byte; every [`wait_ready`] call that was handed
/// the token watches the pipe's read end and returns
/// [`CoreError::Cancelled`] promptly. Tokens are cheap to clone and share.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    wake: PipeChannel,
}

impl CancelToken {
    /// Create a new, un-cancelled token
    pub fn new() -> Result<Self> {
        let wake = PipeChannel::new()?;
        // A full wake pipe must never block the cancelling thread.
        wake.set_nonblocking(Direction::Write, true)?;
        Ok(Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                wake,
            }),
        })
    }

    /// Request cancellation of every wait watching this token
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // Any error (including a full pipe) is fine: the byte only makes
        // the wakeup prompt, the flag is authoritative.
        let _ = self.inner.wake.write(&[1u8]);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn wake_fd(&self) -> Option<RawFd> {
        self.inner.wake.read_fd()
    }
}

/// Wait for readiness on `fds` under `timeout`.
///
/// Readiness is written into each entry's `ready` field. Returns
/// [`WaitOutcome::TimedOut`] when the full timeout elapses,
/// [`CoreError::Cancelled`] when the token fires, and an I/O error for an
/// operation-fatal backend failure. `EINTR` is retried without corrupting
/// the timeout budget. Duplicate descriptors in `fds` are caller error;
/// which slot reports first is unspecified.
pub fn wait_ready(
    fds: &mut [WaitFd],
    timeout: Timeout,
    cancel: Option<&CancelToken>,
) -> Result<WaitOutcome> {
    let timer = TimeoutTimer::start(timeout);
    let wake_fd = cancel.and_then(CancelToken::wake_fd);
    loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
        }
        for entry in fds.iter_mut() {
            entry.ready = Readiness::default();
        }
        let ready = wait_once(fds, wake_fd, timer.wait_slice())?;
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
        }
        if ready > 0 {
            return Ok(WaitOutcome::Ready(ready));
        }
        if timer.expired() {
            return Ok(WaitOutcome::TimedOut);
        }
    }
}

// Backend selection. The chain degrades monotonically: kernel capability
// does not come back at runtime, so the choice is cached process-wide.
const BACKEND_UNPROBED: u8 = 0;
const BACKEND_EPOLL: u8 = 1;
const BACKEND_POLL: u8 = 2;
const BACKEND_SELECT: u8 = 3;

static BACKEND: AtomicU8 = AtomicU8::new(BACKEND_UNPROBED);

fn current_backend() -> u8 {
    match BACKEND.load(Ordering::Relaxed) {
        BACKEND_UNPROBED => {
            let initial = if cfg!(target_os = "linux") {
                BACKEND_EPOLL
            } else {
                BACKEND_POLL
            };
            BACKEND.store(initial, Ordering::Relaxed);
            initial
        }
        chosen => chosen,
    }
}

fn downgrade_backend(from: u8, to: u8, reason: &'static str) {
    let _ = BACKEND.compare_exchange(from, to, Ordering::Relaxed, Ordering::Relaxed);
    warn!("Multiplexer backend unavailable ({reason}), falling back");
}

/// One bounded slice of waiting. Returns the number of entries with
/// readiness set; 0 means the slice elapsed (or `EINTR` interrupted it).
fn wait_once(fds: &mut [WaitFd], wake_fd: Option<RawFd>, slice: std::time::Duration) -> Result<usize> {
    match current_backend() {
        BACKEND_EPOLL => match epoll_once(fds, wake_fd, slice) {
            Err(CoreError::Unsupported(reason)) => {
                downgrade_backend(BACKEND_EPOLL, BACKEND_POLL, reason);
                wait_once(fds, wake_fd, slice)
            }
            other => other,
        },
        BACKEND_POLL => match poll_once(fds, wake_fd, slice) {
            Err(CoreError::Unsupported(reason)) => {
                downgrade_backend(BACKEND_POLL, BACKEND_SELECT, reason);
                wait_once(fds, wake_fd, slice)
            }
            other => other,
        },
        _ => select_once(fds, wake_fd, slice),
    }
}

/// Milliseconds for an OS wait, rounded up so sub-millisecond slices do not
/// degenerate into a busy loop.
fn slice_millis(slice: std::time::Duration) -> libc::c_int {
    let mut ms = slice.as_millis();
    if slice.as_nanos() % 1_000_000 != 0 {
        ms += 1;
    }
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

fn count_ready(fds: &[WaitFd]) -> usize {
    fds.iter().filter(|entry| entry.ready.any()).count()
}

#[cfg(target_os = "linux")]
fn epoll_once(fds: &mut [WaitFd], wake_fd: Option<RawFd>, slice: std::time::Duration) -> Result<usize> {
    let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if epfd < 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(code) if code == Errno::ENOSYS as i32 || code == Errno::EPERM as i32 => {
                Err(CoreError::Unsupported("epoll_create1"))
            }
            _ => Err(CoreError::Io(err)),
        };
    }
    // Drops on every return path below, including errors.
    let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };
    let epfd_raw = std::os::fd::AsRawFd::as_raw_fd(&epfd);

    let wake_index = fds.len() as u64;
    for (index, entry) in fds.iter().enumerate() {
        let mut events = 0u32;
        if entry.interest.read {
            events |= libc::EPOLLIN as u32;
        }
        if entry.interest.write {
            events |= libc::EPOLLOUT as u32;
        }
        if events == 0 {
            continue;
        }
        let mut event = libc::epoll_event {
            events,
            u64: index as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epfd_raw, libc::EPOLL_CTL_ADD, entry.fd, &mut event) };
        if rc != 0 {
            return Err(CoreError::Io(std::io::Error::last_os_error()));
        }
    }
    if let Some(fd) = wake_fd {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_index,
        };
        let rc = unsafe { libc::epoll_ctl(epfd_raw, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc != 0 {
            return Err(CoreError::Io(std::io::Error::last_os_error()));
        }
    }

    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 64];
    let n = unsafe {
        libc::epoll_wait(
            epfd_raw,
            events.as_mut_ptr(),
            events.len() as libc::c_int,
            slice_millis(slice),
        )
    };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(Errno::EINTR as i32) {
            return Ok(0);
        }
        return Err(CoreError::Io(err));
    }
    for event in events.iter().take(n as usize) {
        let index = event.u64;
        if index >= wake_index {
            // Wake pipe: the caller's cancellation check handles it.
            continue;
        }
        let entry = &mut fds[index as usize];
        let bits = event.events;
        if bits & (libc::EPOLLIN as u32 | libc::EPOLLHUP as u32) != 0 {
            entry.ready.readable = true;
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            entry.ready.writable = true;
        }
        if bits & libc::EPOLLERR as u32 != 0 {
            entry.ready.error = true;
        }
    }
    Ok(count_ready(fds))
}

#[cfg(not(target_os = "linux"))]
fn epoll_once(_fds: &mut [WaitFd], _wake_fd: Option<RawFd>, _slice: std::time::Duration) -> Result<usize> {
    Err(CoreError::Unsupported("epoll"))
}

fn poll_once(fds: &mut [WaitFd], wake_fd: Option<RawFd>, slice: std::time::Duration) -> Result<usize> {
    let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(fds.len() + 1);
    let mut slots: Vec<usize> = Vec::with_capacity(fds.len());
    for (index, entry) in fds.iter().enumerate() {
        let mut events: libc::c_short = 0;
        if entry.interest.read {
            events |= libc::POLLIN;
        }
        if entry.interest.write {
            events |= libc::POLLOUT;
        }
        if events == 0 {
            continue;
        }
        pollfds.push(libc::pollfd {
            fd: entry.fd,
            events,
            revents: 0,
        });
        slots.push(index);
    }
    if let Some(fd) = wake_fd {
        pollfds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }

    let n = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            slice_millis(slice),
        )
    };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(code) if code == Errno::EINTR as i32 => Ok(0),
            Some(code) if code == Errno::ENOSYS as i32 => Err(CoreError::Unsupported("poll")),
            _ => Err(CoreError::Io(err)),
        };
    }
    for (slot, pollfd) in slots.iter().zip(pollfds.iter()) {
        let entry = &mut fds[*slot];
        if pollfd.revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            entry.ready.readable = true;
        }
        if pollfd.revents & libc::POLLOUT != 0 {
            entry.ready.writable = true;
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            entry.ready.error = true;
        }
    }
    Ok(count_ready(fds))
}

fn select_once(fds: &mut [WaitFd], wake_fd: Option<RawFd>, slice: std::time::Duration) -> Result<usize> {
    let capacity = libc::FD_SETSIZE as RawFd;
    for entry in fds.iter() {
        if entry.fd >= capacity {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("descriptor {} exceeds select() capacity", entry.fd),
            )));
        }
    }

    let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut error_set: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe {
        libc::FD_ZERO(&mut read_set);
        libc::FD_ZERO(&mut write_set);
        libc::FD_ZERO(&mut error_set);
    }

    let mut max_fd: RawFd = -1;
    for entry in fds.iter() {
        if entry.interest.read {
            unsafe { libc::FD_SET(entry.fd, &mut read_set) };
        }
        if entry.interest.write {
            unsafe { libc::FD_SET(entry.fd, &mut write_set) };
        }
        if entry.interest.read || entry.interest.write {
            unsafe { libc::FD_SET(entry.fd, &mut error_set) };
            max_fd = max_fd.max(entry.fd);
        }
    }
    if let Some(fd) = wake_fd {
        if fd >= capacity {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "wake descriptor exceeds select() capacity",
            )));
        }
        unsafe { libc::FD_SET(fd, &mut read_set) };
        max_fd = max_fd.max(fd);
    }

    let mut timeval = libc::timeval {
        tv_sec: slice.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_usec: slice.subsec_micros() as libc::suseconds_t,
    };
    let n = unsafe {
        libc::select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            &mut error_set,
            &mut timeval,
        )
    };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(Errno::EINTR as i32) {
            return Ok(0);
        }
        return Err(CoreError::Io(err));
    }
    for entry in fds.iter_mut() {
        if entry.interest.read && unsafe { libc::FD_ISSET(entry.fd, &read_set) } {
            entry.ready.readable = true;
        }
        if entry.interest.write && unsafe { libc::FD_ISSET(entry.fd, &write_set) } {
            entry.ready.writable = true;
        }
        if (entry.interest.read || entry.interest.write)
            && unsafe { libc::FD_ISSET(entry.fd, &error_set) }
        {
            entry.ready.error = true;
        }
    }
    debug!("select() slice returned {n} ready descriptors");
    Ok(count_ready(fds))
}
