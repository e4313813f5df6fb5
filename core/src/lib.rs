//! Core functionality for the procmux project
//!
//! A portable process-supervision and multiplexed-I/O layer: spawn child
//! processes safely across the fork/exec boundary, talk to them through
//! pipes, gather I/O for many children at once under one timeout, and
//! guarantee every child is eventually reaped.

#[cfg(unix)]
pub mod comm;
pub mod error;
#[cfg(unix)]
pub mod pipe;
#[cfg(unix)]
pub mod preexec;
#[cfg(unix)]
pub mod process;
#[cfg(unix)]
mod reaper;
#[cfg(unix)]
pub mod select;
#[cfg(unix)]
pub mod serializer;
#[cfg(unix)]
pub mod spawn;
pub mod timeout;

#[cfg(unix)]
pub use comm::{
    process_input_output, run_capture, InputFeed, InputSource, OutputCapture, OutputSink,
    StreamKind, IO_CHUNK_SIZE,
};
pub use error::{CoreError, Result};
#[cfg(unix)]
pub use pipe::{Direction, PipeChannel};
#[cfg(unix)]
pub use preexec::StartupError;
#[cfg(unix)]
pub use process::{Process, ProcessStatus, Signal, KILL_WAIT_CEILING};
#[cfg(unix)]
pub use select::{wait_ready, CancelToken, Interest, Readiness, WaitFd, WaitOutcome};
#[cfg(unix)]
pub use spawn::{SpawnCommand, StdioPolicy, EXEC_STATUS_TIMEOUT};
pub use timeout::{Timeout, TimeoutTimer, MAX_WAIT_SLICE};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::CoreError::Other(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
