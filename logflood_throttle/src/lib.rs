//! The logflood tick scheduler
//!
//! This library decides *when* work happens in a logflood run. It knows nothing
//! about what the work is: callers pull [`scheduler::Tick`] values out of a
//! [`Scheduler`] and the scheduler guarantees those ticks arrive at the target
//! rate, for the target duration, and not at all once the run is stopped.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use async_trait::async_trait;
use tokio::time::{self, Duration, Instant};

pub mod pacer;
pub mod scheduler;
pub mod state_machine;

pub use scheduler::{Scheduler, Summary, Tick};
pub use state_machine::State;

/// The number of clock ticks in one second. One tick is one microsecond.
pub const TICKS_PER_SECOND: u64 = 1_000_000;

/// Errors produced by this crate.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// See [`pacer::Error`].
    #[error(transparent)]
    Pacer(#[from] pacer::Error),
    /// See [`state_machine::Error`].
    #[error(transparent)]
    StateMachine(#[from] state_machine::Error),
}

#[async_trait]
/// The `Clock` used by the scheduler
pub trait Clock {
    /// The number of ticks elapsed since the clock was created
    fn ticks_elapsed(&self) -> u64;
    /// Wait for `ticks` amount of time
    async fn wait(&self, ticks: u64);
}

#[derive(Debug, Clone, Copy)]
/// A clock that operates with respect to Tokio's notion of time.
///
/// Under a paused Tokio runtime this clock is paused too, which is how the
/// time-dependent tests in this workspace run without sleeping.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for RealClock {
    /// Return the number of ticks since `Clock` was created, saturating at
    /// `u64::MAX`.
    fn ticks_elapsed(&self) -> u64 {
        let ticks_since: u128 = Instant::now().duration_since(self.start).as_micros();
        u64::try_from(ticks_since).unwrap_or(u64::MAX)
    }

    async fn wait(&self, ticks: u64) {
        time::sleep(Duration::from_micros(ticks)).await;
    }
}
