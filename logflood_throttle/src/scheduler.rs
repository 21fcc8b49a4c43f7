//! The rate scheduler
//!
//! [`Scheduler`] is the single authority on tick timing in a run. Consumers
//! call [`Scheduler::next_tick`] -- from one task or many -- and receive each
//! tick no earlier than it is due. Once the run's duration has elapsed every
//! consumer receives `None` and the scheduler is `Draining`; the owner reports
//! the end of in-flight work with [`Scheduler::drained`]. A stop signal ends
//! the run immediately from any state.

use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use tokio::time::Duration;
use tracing::{debug, info};

use crate::{
    Clock, Error, RealClock,
    pacer::{Pacer, Reservation},
    state_machine::{Event, Operation, State, StateMachine},
};

/// One scheduled unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// The index of this tick in the run, starting at zero.
    pub index: u64,
    /// When this tick was due, relative to the start of the run.
    pub due: Duration,
}

/// What a scheduler has done, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Ticks handed to consumers.
    pub ticks_emitted: u64,
    /// Time from the first tick request to the end of the run, or to now if
    /// the run has not ended.
    pub elapsed: Duration,
    /// The lifecycle state when the summary was taken.
    pub state: State,
}

#[derive(Debug)]
struct Inner {
    pacer: Pacer,
    machine: StateMachine,
    started_at: u64,
    stopped_at: Option<u64>,
}

impl Inner {
    fn apply(&mut self, event: Event, now: u64) -> Result<Operation, Error> {
        let operation = self.machine.next(event)?;
        match operation {
            Operation::Emit => self.started_at = now,
            Operation::Halt => {
                if self.stopped_at.is_none() {
                    self.stopped_at = Some(now);
                }
            }
            Operation::Refuse => {}
        }
        Ok(operation)
    }

    fn deadline(&self) -> u64 {
        self.started_at.saturating_add(self.pacer.deadline())
    }
}

/// Fires ticks at a target rate for a target duration.
#[derive(Debug)]
pub struct Scheduler<C = RealClock> {
    clock: C,
    inner: Mutex<Inner>,
    emitted: AtomicU64,
    interval: Duration,
    stop: logflood_signal::Watcher,
}

impl Scheduler<RealClock> {
    /// Create a new [`Scheduler`] with a real-time clock
    ///
    /// # Errors
    ///
    /// Returns an error if `rate_per_second` is not finite and positive or if
    /// `duration` is zero.
    pub fn new(
        rate_per_second: f64,
        duration: Duration,
        stop: logflood_signal::Watcher,
    ) -> Result<Self, Error> {
        Self::with_clock(rate_per_second, duration, RealClock::default(), stop)
    }
}

impl<C> Scheduler<C>
where
    C: Clock + Send + Sync,
{
    /// Create a new [`Scheduler`] driven by `clock`
    ///
    /// # Errors
    ///
    /// Returns an error if `rate_per_second` is not finite and positive or if
    /// `duration` is zero.
    pub fn with_clock(
        rate_per_second: f64,
        duration: Duration,
        clock: C,
        stop: logflood_signal::Watcher,
    ) -> Result<Self, Error> {
        let pacer = Pacer::new(rate_per_second, duration)?;
        let interval = Duration::from_micros(pacer.interval());
        Ok(Self {
            clock,
            inner: Mutex::new(Inner {
                pacer,
                machine: StateMachine::new(),
                started_at: 0,
                stopped_at: None,
            }),
            emitted: AtomicU64::new(0),
            interval,
            stop,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The interior is never left half-updated, a poisoned lock is still
        // consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The spacing between consecutive ticks.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().machine.state()
    }

    /// Wait for the next tick.
    ///
    /// Returns `None` once the duration has elapsed or the run is stopped,
    /// and for every call after that. The first call starts the run.
    pub async fn next_tick(&self) -> Option<Tick> {
        let mut stop = self.stop.clone();
        let (reservation, started_at, deadline) = {
            let mut inner = self.lock();
            let now = self.clock.ticks_elapsed();
            if inner.machine.state() == State::Idle {
                // Cannot fail from Idle.
                let _ = inner.apply(Event::Started, now);
                info!(
                    "scheduler running, {total} ticks over {secs:.3}s",
                    total = inner.pacer.total(),
                    secs = Duration::from_micros(inner.pacer.deadline()).as_secs_f64(),
                );
            }
            if inner.machine.state() != State::Running {
                return None;
            }
            if stop.is_signaled() {
                let _ = inner.apply(Event::StopSignaled, now);
                info!("stop signal received, scheduler stopped");
                return None;
            }
            (inner.pacer.reserve(), inner.started_at, inner.deadline())
        };

        match reservation {
            Reservation::Granted { index, due } => {
                let target = started_at.saturating_add(due);
                let now = self.clock.ticks_elapsed();
                if target > now {
                    tokio::select! {
                        () = self.clock.wait(target - now) => {},
                        () = stop.recv() => {},
                    }
                }
                if stop.is_signaled() {
                    self.stop();
                    return None;
                }
                if self.state() == State::Stopped {
                    return None;
                }
                self.emitted.fetch_add(1, Ordering::Relaxed);
                Some(Tick {
                    index,
                    due: Duration::from_micros(due),
                })
            }
            Reservation::Exhausted => {
                // Every tick is handed out, but the run lasts until the
                // deadline.
                let now = self.clock.ticks_elapsed();
                if deadline > now {
                    tokio::select! {
                        () = self.clock.wait(deadline - now) => {},
                        () = stop.recv() => {},
                    }
                }
                if stop.is_signaled() {
                    self.stop();
                    return None;
                }
                let mut inner = self.lock();
                let now = self.clock.ticks_elapsed();
                if let Ok(Operation::Refuse) = inner.apply(Event::DurationElapsed, now) {
                    debug!("duration elapsed, scheduler draining");
                }
                None
            }
        }
    }

    /// Stop the run. Ticks not yet handed out are abandoned.
    pub fn stop(&self) {
        let mut inner = self.lock();
        let was = inner.machine.state();
        let now = self.clock.ticks_elapsed();
        // Valid from every state.
        let _ = inner.apply(Event::StopSignaled, now);
        if was != State::Stopped {
            info!("scheduler stopped from {was:?}");
        }
    }

    /// Report that in-flight work started before the deadline has finished.
    ///
    /// A no-op if the run was already stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler is not `Draining` or `Stopped`.
    pub fn drained(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.machine.state() == State::Stopped {
            return Ok(());
        }
        let now = self.clock.ticks_elapsed();
        inner.apply(Event::Drained, now)?;
        Ok(())
    }

    /// Total ticks emitted, elapsed time and state.
    #[must_use]
    pub fn summary(&self) -> Summary {
        let inner = self.lock();
        let elapsed = match inner.machine.state() {
            State::Idle => 0,
            _ => inner
                .stopped_at
                .unwrap_or_else(|| self.clock.ticks_elapsed())
                .saturating_sub(inner.started_at),
        };
        Summary {
            ticks_emitted: self.emitted.load(Ordering::Relaxed),
            elapsed: Duration::from_micros(elapsed),
            state: inner.machine.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc};

    use tokio::time::{Duration, Instant, sleep};

    use super::Scheduler;
    use crate::State;

    #[tokio::test(start_paused = true)]
    async fn emits_rate_times_duration_ticks() {
        let (watcher, _broadcaster) = logflood_signal::signal();
        let scheduler = Scheduler::new(2.0, Duration::from_secs(5), watcher).unwrap();
        assert_eq!(scheduler.state(), State::Idle);

        let start = Instant::now();
        let mut ticks = Vec::new();
        while let Some(tick) = scheduler.next_tick().await {
            ticks.push((tick, start.elapsed()));
        }

        assert_eq!(ticks.len(), 10);
        for (n, (tick, at)) in ticks.iter().enumerate() {
            assert_eq!(tick.index, n as u64);
            assert_eq!(tick.due, Duration::from_millis(500 * n as u64));
            assert!(*at >= tick.due);
            assert!(*at < tick.due + scheduler.interval());
        }

        // The run ends at its deadline, not at its last tick.
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(scheduler.state(), State::Draining);
        assert!(scheduler.next_tick().await.is_none());

        scheduler.drained().unwrap();
        let summary = scheduler.summary();
        assert_eq!(summary.state, State::Stopped);
        assert_eq!(summary.ticks_emitted, 10);
        assert!(summary.elapsed >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_emits_nothing_after_cancel() {
        let (watcher, broadcaster) = logflood_signal::signal();
        let scheduler = Scheduler::new(10.0, Duration::from_secs(60), watcher).unwrap();
        let cancel_at = Duration::from_millis(1_250);

        let canceller = tokio::spawn(async move {
            sleep(cancel_at).await;
            broadcaster.signal();
            broadcaster
        });

        let start = Instant::now();
        let mut last = Duration::ZERO;
        let mut emitted = 0;
        while scheduler.next_tick().await.is_some() {
            last = start.elapsed();
            emitted += 1;
        }
        let _broadcaster = canceller.await.unwrap();

        assert!(last <= cancel_at + scheduler.interval());
        // Ticks at 0, 100, .. 1200 ms.
        assert_eq!(emitted, 13);
        assert!(start.elapsed() < cancel_at + scheduler.interval());
        let summary = scheduler.summary();
        assert_eq!(summary.state, State::Stopped);
        assert_eq!(summary.ticks_emitted, 13);
        assert!(scheduler.next_tick().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start_emits_nothing() {
        let (watcher, _broadcaster) = logflood_signal::signal();
        let scheduler = Scheduler::new(1.0, Duration::from_secs(1), watcher).unwrap();
        scheduler.stop();
        assert!(scheduler.next_tick().await.is_none());
        let summary = scheduler.summary();
        assert_eq!(summary.ticks_emitted, 0);
        assert_eq!(summary.state, State::Stopped);
        assert_eq!(summary.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_is_rejected_while_running() {
        let (watcher, _broadcaster) = logflood_signal::signal();
        let scheduler = Scheduler::new(1.0, Duration::from_secs(10), watcher).unwrap();
        assert!(scheduler.next_tick().await.is_some());
        assert!(scheduler.drained().is_err());
        assert_eq!(scheduler.state(), State::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_consumers_share_ticks() {
        let (watcher, _broadcaster) = logflood_signal::signal();
        let scheduler = Arc::new(Scheduler::new(20.0, Duration::from_secs(2), watcher).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(tick) = scheduler.next_tick().await {
                    seen.push(tick.index);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: BTreeSet<u64> = all.iter().copied().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique, (0..40).collect());
        assert_eq!(scheduler.summary().ticks_emitted, 40);
        assert_eq!(scheduler.state(), State::Draining);
    }
}
