//! The summary of a run.

use std::collections::BTreeMap;

use logflood_throttle::{State, Summary};
use serde::Serialize;

use crate::PushOutcome;

/// Pushes by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Outcomes {
    /// Accepted by the endpoint
    pub success: u64,
    /// Ran past the request timeout
    pub client_timeout: u64,
    /// Answered with a non-2xx status, by status code
    pub server_error: BTreeMap<u16, u64>,
    /// Failed in transport
    pub network_error: u64,
    /// Dispatched but never sent because the run stopped first
    pub abandoned: u64,
}

impl Outcomes {
    /// Pushes that reached the endpoint or failed trying.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.success + self.client_timeout + self.server_errors() + self.network_error
    }

    /// Every server error, whatever the status.
    #[must_use]
    pub fn server_errors(&self) -> u64 {
        self.server_error.values().sum()
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Ticks the scheduler emitted
    pub ticks_emitted: u64,
    /// Batches handed to submission tasks
    pub pushes_dispatched: u64,
    /// What became of those batches
    pub outcomes: Outcomes,
    /// Batch bytes of every push the endpoint answered, framing excluded
    pub bytes_pushed: u64,
    /// Distinct streams pushed to
    pub streams: u64,
    /// Wall-clock seconds from the first tick to the end of the run
    pub elapsed_seconds: f64,
    /// The scheduler state at the end of the run
    pub final_state: State,
}

impl Report {
    pub(crate) fn new() -> Self {
        Self {
            ticks_emitted: 0,
            pushes_dispatched: 0,
            outcomes: Outcomes::default(),
            bytes_pushed: 0,
            streams: 0,
            elapsed_seconds: 0.0,
            final_state: State::Idle,
        }
    }

    /// Record the outcome of a push of `bytes` batch bytes. `None` means the
    /// push was abandoned. Bytes count only when a response arrived.
    pub(crate) fn record(&mut self, outcome: Option<PushOutcome>, bytes: u64) {
        let Some(outcome) = outcome else {
            self.outcomes.abandoned += 1;
            return;
        };
        match outcome {
            PushOutcome::Success => {
                self.outcomes.success += 1;
                self.bytes_pushed += bytes;
            }
            PushOutcome::ClientTimeout => self.outcomes.client_timeout += 1,
            PushOutcome::ServerError(code) => {
                *self.outcomes.server_error.entry(code).or_default() += 1;
                self.bytes_pushed += bytes;
            }
            PushOutcome::NetworkError => self.outcomes.network_error += 1,
        }
    }

    pub(crate) fn finish(&mut self, summary: Summary) {
        self.ticks_emitted = summary.ticks_emitted;
        self.elapsed_seconds = summary.elapsed.as_secs_f64();
        self.final_state = summary.state;
    }
}
