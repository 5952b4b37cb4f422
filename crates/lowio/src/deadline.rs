// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant, SystemTime};

/// A timeout carrier for deadlined I/O.
///
/// A deadline is either **relative** — a steady-clock duration measured from
/// the moment the operation begins, immune to wall-clock adjustment — or
/// **absolute** — a wall-clock instant, so that a set of operations can share
/// one common cut-off.
///
/// A relative deadline of zero means "poll": attempt the operation once and
/// report [`Errc::TimedOut`](crate::Errc::TimedOut) if it cannot complete
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Expires this long after the operation begins (steady clock).
    Relative(Duration),
    /// Expires at this wall-clock time.
    Absolute(SystemTime),
}

impl Deadline {
    /// The polling deadline: try once, never sleep.
    pub const POLL: Self = Self::Relative(Duration::ZERO);

    /// Whether this is the zero relative deadline.
    #[must_use]
    pub fn is_poll(&self) -> bool {
        matches!(self, Self::Relative(d) if d.is_zero())
    }

    /// The steady-clock instant at which this deadline expires, given the
    /// instant the operation began. Absolute deadlines are converted through
    /// the current wall clock.
    #[must_use]
    pub fn expires_at(&self, began: Instant) -> Instant {
        match *self {
            Self::Relative(duration) => began.checked_add(duration).unwrap_or_else(far_future),
            Self::Absolute(when) => match when.duration_since(SystemTime::now()) {
                Ok(remaining) => Instant::now().checked_add(remaining).unwrap_or_else(far_future),
                // Already past.
                Err(_) => Instant::now(),
            },
        }
    }

    /// Time remaining before expiry, measured against `began` for relative
    /// deadlines. Zero once expired.
    #[must_use]
    pub fn remaining(&self, began: Instant) -> Duration {
        self.expires_at(began).saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn expired(&self, began: Instant) -> bool {
        self.remaining(began).is_zero()
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::Relative(duration)
    }
}

impl From<SystemTime> for Deadline {
    fn from(when: SystemTime) -> Self {
        Self::Absolute(when)
    }
}

fn far_future() -> Instant {
    // ~30 years out; effectively "never" without risking Instant overflow.
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_relative_is_poll() {
        assert!(Deadline::POLL.is_poll());
        assert!(Deadline::Relative(Duration::ZERO).is_poll());
        assert!(!Deadline::Relative(Duration::from_millis(1)).is_poll());
        assert!(!Deadline::Absolute(SystemTime::now()).is_poll());
    }

    #[test]
    fn poll_deadline_is_immediately_expired() {
        let began = Instant::now();
        assert!(Deadline::POLL.expired(began));
        assert_eq!(Deadline::POLL.remaining(began), Duration::ZERO);
    }

    #[test]
    fn relative_deadline_counts_from_begin() {
        let began = Instant::now();
        let deadline = Deadline::Relative(Duration::from_secs(60));
        assert!(!deadline.expired(began));
        let remaining = deadline.remaining(began);
        assert!(remaining > Duration::from_secs(59), "{remaining:?}");
    }

    #[test]
    fn absolute_deadline_in_the_past_is_expired() {
        let long_ago = SystemTime::now() - Duration::from_secs(3600);
        assert!(Deadline::Absolute(long_ago).expired(Instant::now()));
    }
}
