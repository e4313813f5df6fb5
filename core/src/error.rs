//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    /// Child startup failed: fork failure, a structured error reported by
    /// the child through the exec-status pipe, or a hang before exec.
    #[error("Spawn error: {message}")]
    Spawn {
        /// Human-readable reason, including the child's reported stage
        message: String,
        /// OS error code reported by the child or the failing syscall
        errno: Option<i32>,
    },

    /// The overall timeout of a multiplexed operation expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// An output capture limit was exceeded; data up to the limit is
    /// preserved in the capture buffer.
    #[error("Capture buffer full: limit of {limit} bytes exceeded")]
    BufferFull {
        /// Configured capture limit in bytes
        limit: usize,
    },

    /// A process refused to die even after SIGKILL within the final ceiling
    #[error("Termination error: {0}")]
    Termination(String),

    /// A blocking wait was interrupted by a cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// A multiplexer backend is categorically unavailable on this kernel.
    /// Internal fallback sentinel; never surfaced to callers.
    #[error("Backend unavailable: {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Other(String),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Spawn { .. } => "PMX001",
            CoreError::Timeout(_) => "PMX002",
            CoreError::BufferFull { .. } => "PMX003",
            CoreError::Termination(_) => "PMX004",
            CoreError::Cancelled => "PMX005",
            CoreError::Unsupported(_) => "PMX006",
            CoreError::Io(_) => "PMX007",
            CoreError::Other(_) => "PMX999",
        }
    }

    /// Build a spawn error from a stage message and an OS errno
    pub(crate) fn spawn(message: impl Into<String>, errno: Option<i32>) -> Self {
        CoreError::Spawn {
            message: message.into(),
            errno,
        }
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;

// Convenience implementations
impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Other(s.to_string())
    }
}

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Other(s)
    }
}

impl From<nix::errno::Errno> for CoreError {
    fn from(e: nix::errno::Errno) -> Self {
        CoreError::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::spawn("exec failed", Some(2)).code(), "PMX001");
        assert_eq!(CoreError::Timeout("gather".to_string()).code(), "PMX002");
        assert_eq!(CoreError::BufferFull { limit: 16 }.code(), "PMX003");
        assert_eq!(CoreError::Termination("pid 1".to_string()).code(), "PMX004");
        assert_eq!(CoreError::Cancelled.code(), "PMX005");
        assert_eq!(CoreError::Other("test".to_string()).code(), "PMX999");
    }

    #[test]
    fn test_error_display() {
        let error = CoreError::spawn("exec failed: No such file", Some(2));
        assert_eq!(error.to_string(), "Spawn error: exec failed: No such file");

        let error = CoreError::BufferFull { limit: 1024 };
        assert_eq!(
            error.to_string(),
            "Capture buffer full: limit of 1024 bytes exceeded"
        );
    }

    #[test]
    fn test_from_implementations() {
        let error: CoreError = "test error".into();
        assert_eq!(error.to_string(), "Generic error: test error");

        let error: CoreError = nix::errno::Errno::ESRCH.into();
        assert!(matches!(error, CoreError::Io(_)));
    }
}
