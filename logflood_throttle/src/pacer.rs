//! Fixed-interval pacing
//!
//! The pacer hands out tick indexes and says when each one is due. Tick `n` is
//! due `n / rate` seconds after the run starts and the last tick is the one
//! due strictly before the run's deadline. Due times are computed from the
//! absolute index, never by adding intervals together, so a long run does not
//! accumulate rounding drift.

use std::time::Duration;

use crate::TICKS_PER_SECOND;

/// Errors produced by [`Pacer`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// Rate must be finite and strictly positive.
    #[error("Rate must be a finite, positive number of ticks per second, got {0}")]
    Rate(f64),
    /// Duration must be strictly positive.
    #[error("Duration must be greater than zero")]
    Duration,
}

/// The outcome of asking the pacer for another tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Tick `index` is yours, emit it once `due` ticks have elapsed since start.
    Granted {
        /// The index of this tick, starting at zero.
        index: u64,
        /// The offset from run start, in clock ticks, at which this tick is due.
        due: u64,
    },
    /// No tick remains before the deadline.
    Exhausted,
}

/// The non-async interior of the scheduler, about which we can make proof
/// claims.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    /// Clock ticks between two consecutive tick due times, fractional.
    interval: f64,
    /// The offset from run start, in clock ticks, at which the run ends.
    deadline: u64,
    /// Total reservations granted.
    granted: u64,
}

impl Pacer {
    /// Create a new `Pacer` emitting `rate_per_second` ticks per second for
    /// `duration`.
    ///
    /// # Errors
    ///
    /// Returns an error if `rate_per_second` is not finite and positive or if
    /// `duration` is zero.
    pub fn new(rate_per_second: f64, duration: Duration) -> Result<Self, Error> {
        if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
            return Err(Error::Rate(rate_per_second));
        }
        if duration.is_zero() {
            return Err(Error::Duration);
        }
        let deadline = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Ok(Self {
            interval: TICKS_PER_SECOND as f64 / rate_per_second,
            deadline,
            granted: 0,
        })
    }

    /// The offset from run start, in clock ticks, at which tick `index` is due.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn due(&self, index: u64) -> u64 {
        // Saturating float-to-int conversion, an absurd index maps to u64::MAX.
        (index as f64 * self.interval).ceil() as u64
    }

    /// The offset from run start, in clock ticks, at which the run ends.
    #[must_use]
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    /// The clock ticks between consecutive ticks, rounded up.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn interval(&self) -> u64 {
        self.interval.ceil() as u64
    }

    /// Total reservations granted so far.
    #[must_use]
    pub fn granted(&self) -> u64 {
        self.granted
    }

    /// The total number of ticks this pacer will ever grant.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn total(&self) -> u64 {
        // Estimate then correct for float rounding at the boundary.
        let mut n = (self.deadline as f64 / self.interval).floor() as u64;
        while n > 0 && self.due(n - 1) >= self.deadline {
            n -= 1;
        }
        while self.due(n) < self.deadline {
            n += 1;
        }
        n
    }

    /// Reserve the next tick.
    pub fn reserve(&mut self) -> Reservation {
        let index = self.granted;
        let due = self.due(index);
        if due >= self.deadline {
            return Reservation::Exhausted;
        }
        self.granted += 1;
        Reservation::Granted { index, due }
    }
}
