//! Pure state machine for the scheduler lifecycle

use serde::Serialize;

/// The state of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Created, no tick emitted yet
    Idle,
    /// Emitting ticks
    Running,
    /// Duration elapsed, waiting for in-flight work to finish
    Draining,
    /// Terminal state
    Stopped,
}

/// Operations the state machine requests of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Emit ticks at the configured rate
    Emit,
    /// Refuse new ticks, let in-flight work complete
    Refuse,
    /// Record the end of the run and refuse every tick from now on
    Halt,
}

/// Events that can drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The run began
    Started,
    /// The configured duration elapsed
    DurationElapsed,
    /// All in-flight work started before the deadline finished
    Drained,
    /// An external stop was requested
    StopSignaled,
}

/// Errors produced by [`StateMachine`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Transition is not valid
    #[error("Invalid transition from {from:?} via {via:?}")]
    InvalidTransition {
        /// The state the machine was in
        from: State,
        /// The event that could not be applied
        via: Event,
    },
}

/// State machine for the scheduler
///
/// This holds the lifecycle rules _without_ clock or IO concerns. The
/// scheduler owns the clock and follows the `Operation` this machine returns.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a new state machine in `Idle`
    #[must_use]
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Process an event and return the next operation
    ///
    /// State transitions:
    /// ```text
    /// Format: CurrentState --[Event]--> NextState (Operation)
    ///
    /// Idle --[Started]--> Running (Emit)
    /// Idle --[StopSignaled]--> Stopped (Halt)
    ///
    /// Running --[DurationElapsed]--> Draining (Refuse)
    /// Running --[StopSignaled]--> Stopped (Halt)
    ///
    /// Draining --[DurationElapsed]--> Draining (Refuse)
    /// Draining --[Drained]--> Stopped (Halt)
    /// Draining --[StopSignaled]--> Stopped (Halt)
    ///
    /// Stopped --[StopSignaled]--> Stopped (Halt)
    /// ```
    ///
    /// `DurationElapsed` in `Draining` and `StopSignaled` in `Stopped` are
    /// accepted because many concurrent consumers may observe the same
    /// deadline or stop.
    ///
    /// # Errors
    ///
    /// Function will error with `InvalidTransition` if the `event` is not valid
    /// for the present state.
    pub fn next(&mut self, event: Event) -> Result<Operation, Error> {
        let (next_state, operation) = match (self.state, event) {
            (State::Idle, Event::Started) => (State::Running, Operation::Emit),
            (State::Running | State::Draining, Event::DurationElapsed) => {
                (State::Draining, Operation::Refuse)
            }
            (State::Draining, Event::Drained)
            | (
                State::Idle | State::Running | State::Draining | State::Stopped,
                Event::StopSignaled,
            ) => (State::Stopped, Operation::Halt),
            _ => {
                return Err(Error::InvalidTransition {
                    from: self.state,
                    via: event,
                });
            }
        };

        self.state = next_state;
        Ok(operation)
    }
}
