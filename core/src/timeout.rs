//! Timeout values and the timer cursor used by every blocking wait
//!
//! A [`Timeout`] expresses how long a caller is willing to wait: until an
//! absolute deadline, for a relative duration, for a relative duration that
//! restarts on every unit of progress (idle-reset), or forever. A
//! [`TimeoutTimer`] is the mutable cursor a wait loop drives against it.
//!
//! Every OS-level wait in this crate goes through [`TimeoutTimer::wait_slice`],
//! which clamps the wait to [`MAX_WAIT_SLICE`] so that even an "infinite"
//! wait wakes up periodically and can observe cancellation.

use std::time::{Duration, Instant};

/// Upper bound for any single OS-level wait issued by this crate
pub const MAX_WAIT_SLICE: Duration = Duration::from_secs(10);

/// How long a caller is willing to wait for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until the given deadline
    Absolute(Instant),
    /// Wait for the given duration, counted from when the timer starts
    Relative(Duration),
    /// Wait for the given duration of *inactivity*; the clock restarts on
    /// every unit of progress reported to the timer.
    RelativeWithReset(Duration),
    /// Wait forever (still interruptible via bounded slices)
    Infinite,
}

impl Timeout {
    /// Whether this timeout restarts on progress
    pub fn is_idle_reset(&self) -> bool {
        matches!(self, Timeout::RelativeWithReset(_))
    }
}

/// Mutable cursor over a [`Timeout`], owned by the loop that created it
#[derive(Debug)]
pub struct TimeoutTimer {
    timeout: Timeout,
    anchor: Instant,
}

impl TimeoutTimer {
    /// Anchor the timer's origin at the current instant
    pub fn start(timeout: Timeout) -> Self {
        Self {
            timeout,
            anchor: Instant::now(),
        }
    }

    /// The timeout this timer was started with
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// Report a unit of progress. Re-anchors the origin for idle-reset
    /// timeouts; a no-op for every other kind, so relative timeouts keep
    /// counting from their original start.
    pub fn notify_progress(&mut self) {
        if self.timeout.is_idle_reset() {
            self.anchor = Instant::now();
        }
    }

    /// Remaining wait budget, or `None` for an infinite timeout
    pub fn remaining(&self) -> Option<Duration> {
        match self.timeout {
            Timeout::Absolute(deadline) => {
                Some(deadline.saturating_duration_since(Instant::now()))
            }
            Timeout::Relative(dur) | Timeout::RelativeWithReset(dur) => {
                Some(dur.saturating_sub(self.anchor.elapsed()))
            }
            Timeout::Infinite => None,
        }
    }

    /// Whether the full timeout has elapsed
    pub fn expired(&self) -> bool {
        match self.remaining() {
            Some(rem) => rem.is_zero(),
            None => false,
        }
    }

    /// The next OS wait to issue: the remaining budget clamped to
    /// [`MAX_WAIT_SLICE`]. An infinite timeout yields the full slice; an
    /// expired timer yields zero.
    pub fn wait_slice(&self) -> Duration {
        match self.remaining() {
            Some(rem) => rem.min(MAX_WAIT_SLICE),
            None => MAX_WAIT_SLICE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_expiry() {
        let timer = TimeoutTimer::start(Timeout::Relative(Duration::from_millis(20)));
        assert!(!timer.expired());
        std::thread::sleep(Duration::from_millis(40));
        assert!(timer.expired());
        assert_eq!(timer.wait_slice(), Duration::ZERO);
    }

    #[test]
    fn test_zero_timeout_is_immediately_expired() {
        let timer = TimeoutTimer::start(Timeout::Relative(Duration::ZERO));
        assert!(timer.expired());
    }

    #[test]
    fn test_infinite_never_expires() {
        let timer = TimeoutTimer::start(Timeout::Infinite);
        assert!(!timer.expired());
        assert_eq!(timer.remaining(), None);
        assert_eq!(timer.wait_slice(), MAX_WAIT_SLICE);
    }

    #[test]
    fn test_wait_slice_is_clamped() {
        let timer = TimeoutTimer::start(Timeout::Relative(Duration::from_secs(3600)));
        assert_eq!(timer.wait_slice(), MAX_WAIT_SLICE);

        let timer = TimeoutTimer::start(Timeout::Relative(Duration::from_millis(5)));
        assert!(timer.wait_slice() <= Duration::from_millis(5));
    }

    #[test]
    fn test_absolute_deadline() {
        let deadline = Instant::now() + Duration::from_millis(30);
        let timer = TimeoutTimer::start(Timeout::Absolute(deadline));
        assert!(!timer.expired());
        std::thread::sleep(Duration::from_millis(50));
        assert!(timer.expired());
    }

    #[test]
    fn test_progress_resets_only_idle_timers() {
        let mut idle = TimeoutTimer::start(Timeout::RelativeWithReset(Duration::from_millis(50)));
        let mut fixed = TimeoutTimer::start(Timeout::Relative(Duration::from_millis(50)));

        std::thread::sleep(Duration::from_millis(30));
        idle.notify_progress();
        fixed.notify_progress();
        std::thread::sleep(Duration::from_millis(30));

        // 60ms total elapsed: the idle timer was re-anchored at 30ms and
        // still has budget; the fixed timer has expired.
        assert!(!idle.expired());
        assert!(fixed.expired());
    }
}
