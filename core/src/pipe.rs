//! Reference-counted, independently half-closable pipe channels
//!
//! A [`PipeChannel`] wraps up to two descriptors (a read end and a write
//! end) behind a shared handle. Either end can be closed independently and
//! idempotently; the last owner to drop the handle closes whatever is still
//! open. Blocking mode is per direction.
//!
//! All descriptors are created with `O_CLOEXEC`. Child-side wiring clears
//! the flag implicitly when an end is `dup2()`ed onto fds 0-2, which is
//! exactly the behavior the exec-status protocol relies on.

// Descriptor-level work requires raw libc calls
#![allow(unsafe_code)]

use crate::{CoreError, Result};
use nix::errno::Errno;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

/// One direction of a [`PipeChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The end this process reads from
    Read,
    /// The end this process writes to
    Write,
}

#[derive(Debug)]
struct Inner {
    read: Mutex<Option<OwnedFd>>,
    write: Mutex<Option<OwnedFd>>,
}

/// A shared handle over the two ends of a pipe
///
/// Cloning the handle shares the underlying descriptors; they are closed
/// when explicitly requested or when the last clone is dropped. Concurrent
/// reads (or concurrent writes) on the same direction require external
/// synchronization by the caller.
#[derive(Debug, Clone)]
pub struct PipeChannel {
    inner: Arc<Inner>,
}

impl PipeChannel {
    /// Create a fresh pipe, holding both ends, with `O_CLOEXEC` set
    pub fn new() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(CoreError::Io(std::io::Error::last_os_error()));
        }
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self::from_ends(Some(read), Some(write)))
    }

    /// Wrap an existing descriptor as the read end of a channel
    pub fn from_read_fd(fd: OwnedFd) -> Self {
        Self::from_ends(Some(fd), None)
    }

    /// Wrap an existing descriptor as the write end of a channel
    pub fn from_write_fd(fd: OwnedFd) -> Self {
        Self::from_ends(None, Some(fd))
    }

    fn from_ends(read: Option<OwnedFd>, write: Option<OwnedFd>) -> Self {
        Self {
            inner: Arc::new(Inner {
                read: Mutex::new(read),
                write: Mutex::new(write),
            }),
        }
    }

    /// Raw descriptor of the read end, if still open
    pub fn read_fd(&self) -> Option<RawFd> {
        self.inner.read.lock().unwrap().as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Raw descriptor of the write end, if still open
    pub fn write_fd(&self) -> Option<RawFd> {
        self.inner.write.lock().unwrap().as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Close the read end. Idempotent: closing an already-closed end is a
    /// no-op.
    pub fn close_read(&self) {
        self.inner.read.lock().unwrap().take();
    }

    /// Close the write end. Idempotent.
    pub fn close_write(&self) {
        self.inner.write.lock().unwrap().take();
    }

    /// Close both ends
    pub fn close(&self) {
        self.close_read();
        self.close_write();
    }

    /// Set or clear `O_NONBLOCK` on one direction
    pub fn set_nonblocking(&self, direction: Direction, nonblocking: bool) -> Result<()> {
        let fd = match direction {
            Direction::Read => self.read_fd(),
            Direction::Write => self.write_fd(),
        }
        .ok_or_else(|| closed_end_error(direction))?;

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(CoreError::Io(std::io::Error::last_os_error()));
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
        if rc < 0 {
            return Err(CoreError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Read from the channel's read end, retrying on `EINTR`.
    /// Returns `Ok(0)` on end-of-stream.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.read_fd().ok_or_else(|| closed_end_error(Direction::Read))?;
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(Errno::EINTR as i32) {
                continue;
            }
            return Err(CoreError::Io(err));
        }
    }

    /// Write to the channel's write end, retrying on `EINTR`.
    /// Returns the number of bytes accepted; other errors (including
    /// `EAGAIN` and `EPIPE`) surface to the caller untranslated.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let fd = self.write_fd().ok_or_else(|| closed_end_error(Direction::Write))?;
        loop {
            let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(Errno::EINTR as i32) {
                continue;
            }
            return Err(CoreError::Io(err));
        }
    }
}

/// Ignore SIGPIPE process-wide, once. A write to a pipe whose reader is
/// gone must surface as `EPIPE`, not kill the process.
pub(crate) fn ignore_sigpipe() {
    static DONE: std::sync::Once = std::sync::Once::new();
    DONE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

fn closed_end_error(direction: Direction) -> CoreError {
    let which = match direction {
        Direction::Read => "read",
        Direction::Write => "write",
    };
    CoreError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        format!("pipe {which} end is closed"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let pipe = PipeChannel::new().expect("Failed to create pipe");
        let n = pipe.write(b"hello").expect("Failed to write");
        assert_eq!(n, 5);

        let mut buf = [0u8; 16];
        let n = pipe.read(&mut buf).expect("Failed to read");
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_eof_after_write_end_closed() {
        let pipe = PipeChannel::new().expect("Failed to create pipe");
        pipe.write(b"x").expect("Failed to write");
        pipe.close_write();

        let mut buf = [0u8; 4];
        assert_eq!(pipe.read(&mut buf).expect("Failed to read"), 1);
        assert_eq!(pipe.read(&mut buf).expect("Failed to read EOF"), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let pipe = PipeChannel::new().expect("Failed to create pipe");
        pipe.close_read();
        pipe.close_read();
        pipe.close_write();
        pipe.close_write();
        pipe.close();
        assert!(pipe.read_fd().is_none());
        assert!(pipe.write_fd().is_none());
    }

    #[test]
    fn test_clone_shares_descriptors() {
        let pipe = PipeChannel::new().expect("Failed to create pipe");
        let other = pipe.clone();
        assert_eq!(pipe.read_fd(), other.read_fd());

        other.close_read();
        assert!(pipe.read_fd().is_none());
    }

    #[test]
    fn test_nonblocking_read_returns_eagain() {
        let pipe = PipeChannel::new().expect("Failed to create pipe");
        pipe.set_nonblocking(Direction::Read, true)
            .expect("Failed to set nonblocking");

        let mut buf = [0u8; 4];
        let err = pipe.read(&mut buf).expect_err("Read should not block");
        match err {
            CoreError::Io(e) => {
                assert_eq!(e.raw_os_error(), Some(libc::EAGAIN));
            }
            e => panic!("Expected Io error, got: {e:?}"),
        }
    }

    #[test]
    fn test_read_from_closed_end_fails() {
        let pipe = PipeChannel::new().expect("Failed to create pipe");
        pipe.close_read();
        let mut buf = [0u8; 4];
        assert!(pipe.read(&mut buf).is_err());
    }
}
