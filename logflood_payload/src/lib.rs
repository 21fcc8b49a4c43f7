//! The logflood payloads
//!
//! This library builds what logflood sends: batches of synthetic log lines
//! with a bounded total size, the label set naming the stream each batch
//! belongs to and the Loki push encoding of the pair.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::cargo)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub use generator::{PayloadGenerator, size_range};
pub use labels::{BaseLabel, LabelSet, LabelSetFactory};

pub mod generator;
pub mod labels;
pub mod loki;
mod strings;

/// Errors related to payload generation
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No batch of `line_count` non-empty lines fits the requested bounds.
    #[error(
        "Cannot fit {line_count} non-empty lines into [{min_bytes}, {max_bytes}) bytes"
    )]
    InvalidBounds {
        /// Lines requested
        line_count: usize,
        /// Inclusive lower bound on the batch size
        min_bytes: usize,
        /// Exclusive upper bound on the batch size
        max_bytes: usize,
    },
    /// Label cardinality factor outside of [0, 1]
    #[error("Label cardinality factor must lie in [0, 1], got {0}")]
    InvalidFactor(f64),
    /// A base label with a cardinality of zero can take no value
    #[error("Base label {key} has a cardinality of zero")]
    ZeroCardinality {
        /// The offending label key
        key: String,
    },
    /// Failed to generate string
    #[error("Failed to generate string")]
    StringGenerate,
    /// Json payload could not be encoded
    #[error("Json payload could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
}

/// An ordered group of synthetic log lines bound for a single stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    lines: Vec<String>,
    labels: LabelSet,
}

impl LogBatch {
    /// Construct a batch from `lines` with an empty label set.
    #[must_use]
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            labels: LabelSet::default(),
        }
    }

    /// Attach `labels`, replacing any present.
    #[must_use]
    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = labels;
        self
    }

    /// The lines of this batch, in order.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The label set of this batch.
    #[must_use]
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Total size of the batch: the sum of its lines' byte lengths. Encoding
    /// overhead is not counted.
    ///
    /// Generated batches fall in `[min_bytes, max_bytes)`, except that equal
    /// bounds yield exactly `max_bytes`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lines.iter().map(String::len).sum()
    }
}
