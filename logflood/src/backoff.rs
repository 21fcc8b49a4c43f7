//! Per-stream backoff
//!
//! A stream whose pushes in one tick all fail with a retryable outcome has its
//! next push delayed. Each further all-retryable tick doubles the delay:
//!
//! ```text
//! level 0    no delay
//! level n    initial_millis * 2^(n-1), capped at maximum_millis
//! ```
//!
//! The level stops rising at `max_level`. A success or a non-retryable outcome
//! drops the stream back to level 0. Only failing streams are tracked.
//!
//! Rounds are kept per tick, so a tick's outcomes count even when they arrive
//! after later ticks for the same stream were dispatched.
//!
//! Backoff shifts a stream's pushes later, it does not thin them: a stream at
//! level n still gets every push its ticks call for, each sent `delay(n)` after
//! its tick. Load on a failing stream is deferred, not shed.

use std::collections::BTreeMap;

use logflood_payload::LabelSet;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::PushOutcome;

/// The most streams tracked as failing at once. Streams that start failing
/// past this point are not delayed.
const MAX_TRACKED_STREAMS: usize = 65_536;

fn default_initial_millis() -> u64 {
    100
}

fn default_maximum_millis() -> u64 {
    6_400
}

fn default_max_level() -> u32 {
    7
}

/// Backoff configuration
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The delay at level one
    #[serde(default = "default_initial_millis")]
    pub initial_millis: u64,
    /// No delay exceeds this
    #[serde(default = "default_maximum_millis")]
    pub maximum_millis: u64,
    /// The level stops rising here
    #[serde(default = "default_max_level")]
    pub max_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_millis: default_initial_millis(),
            maximum_millis: default_maximum_millis(),
            max_level: default_max_level(),
        }
    }
}

impl Config {
    /// The delay for a stream at `level`.
    #[must_use]
    pub fn delay(&self, level: u32) -> Duration {
        if level == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(level - 1).unwrap_or(u64::MAX);
        let millis = self
            .initial_millis
            .saturating_mul(factor)
            .min(self.maximum_millis);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Copy)]
struct Round {
    outstanding: u32,
    all_retryable: bool,
}

#[derive(Debug, Default, Clone)]
struct Stream {
    level: u32,
    /// Rounds still waiting on outcomes, by tick. Pushes outlive ticks when
    /// latency exceeds the tick interval, so several may be open at once.
    rounds: BTreeMap<u64, Round>,
    /// The newest tick that saw a success or a non-retryable outcome. Rounds
    /// from older ticks finishing later do not escalate.
    cleared_at: Option<u64>,
}

/// Backoff state for every stream, owned by the runner's driver loop.
#[derive(Debug)]
pub struct Streams {
    config: Config,
    streams: FxHashMap<LabelSet, Stream>,
}

impl Streams {
    /// Create a new, empty, [`Streams`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            streams: FxHashMap::default(),
        }
    }

    /// The delay to apply to the next push for `labels`.
    #[must_use]
    pub fn delay_for(&self, labels: &LabelSet) -> Duration {
        self.streams
            .get(labels)
            .map_or(Duration::ZERO, |stream| self.config.delay(stream.level))
    }

    /// The backoff level of `labels`.
    #[must_use]
    pub fn level(&self, labels: &LabelSet) -> u32 {
        self.streams.get(labels).map_or(0, |stream| stream.level)
    }

    /// The number of streams tracked as failing or awaiting outcomes.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.streams.len()
    }

    /// Note that a push for `labels` was dispatched in `tick`.
    pub fn dispatched(&mut self, tick: u64, labels: &LabelSet) {
        if !self.streams.contains_key(labels) {
            if self.streams.len() >= MAX_TRACKED_STREAMS {
                debug!(%labels, "backoff table full, stream not tracked");
                return;
            }
            self.streams.insert(labels.clone(), Stream::default());
        }
        let Some(stream) = self.streams.get_mut(labels) else {
            return;
        };
        stream
            .rounds
            .entry(tick)
            .or_insert(Round {
                outstanding: 0,
                all_retryable: true,
            })
            .outstanding += 1;
    }

    /// Record the outcome of a push for `labels` dispatched in `tick`. `None`
    /// means the push was abandoned before it was sent.
    pub fn completed(&mut self, tick: u64, labels: &LabelSet, outcome: Option<PushOutcome>) {
        let Some(stream) = self.streams.get_mut(labels) else {
            return;
        };
        let retryable = match outcome {
            Some(outcome) if !outcome.is_retryable() => {
                stream.level = 0;
                stream.cleared_at = stream.cleared_at.max(Some(tick));
                false
            }
            Some(_) => true,
            None => false,
        };

        if let Some(round) = stream.rounds.get_mut(&tick) {
            round.all_retryable &= retryable;
            round.outstanding = round.outstanding.saturating_sub(1);
            if round.outstanding == 0 {
                let escalate = round.all_retryable
                    && stream.cleared_at.is_none_or(|cleared| tick > cleared);
                stream.rounds.remove(&tick);
                if escalate {
                    let level = stream.level.saturating_add(1).min(self.config.max_level);
                    if level != stream.level {
                        warn!(%labels, level, "stream failing, backing off");
                    }
                    stream.level = level;
                }
            }
        }

        if stream.level == 0 && stream.rounds.is_empty() {
            self.streams.remove(labels);
        }
    }
}
