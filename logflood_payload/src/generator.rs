//! Synthetic log line generation.

use std::ops::RangeInclusive;

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::debug;

use crate::{Error, LogBatch, strings::RandomStringPool};

/// Initial size of the character pool, grown on demand.
const INITIAL_POOL_BYTES: usize = 64 * 1024;

/// The batch sizes that can hold `line_count` non-empty lines within
/// `[min_bytes, max_bytes)`, or exactly `max_bytes` when the bounds are equal.
///
/// # Errors
///
/// Returns [`Error::InvalidBounds`] if `line_count` is zero, if
/// `min_bytes > max_bytes` or if no size in the range can hold `line_count`
/// non-empty lines.
pub fn size_range(
    line_count: usize,
    min_bytes: usize,
    max_bytes: usize,
) -> Result<RangeInclusive<usize>, Error> {
    let invalid = Error::InvalidBounds {
        line_count,
        min_bytes,
        max_bytes,
    };
    if line_count == 0 || min_bytes > max_bytes {
        return Err(invalid);
    }
    if min_bytes == max_bytes {
        return if max_bytes >= line_count {
            Ok(max_bytes..=max_bytes)
        } else {
            Err(invalid)
        };
    }
    let lower = min_bytes.max(line_count);
    if lower >= max_bytes {
        return Err(invalid);
    }
    Ok(lower..=max_bytes - 1)
}

#[derive(Debug, Clone)]
/// Generates batches of printable ASCII log lines with a bounded total size
///
/// Output is fully determined by the seed and the sequence of calls made.
pub struct PayloadGenerator {
    rng: StdRng,
    pool: RandomStringPool,
}

impl PayloadGenerator {
    /// Construct a new instance of `PayloadGenerator` from `seed`.
    #[must_use]
    pub fn new(seed: [u8; 32]) -> Self {
        let mut rng = StdRng::from_seed(seed);
        let pool = RandomStringPool::with_size(&mut rng, INITIAL_POOL_BYTES);
        Self { rng, pool }
    }

    /// Generate a batch of `line_count` lines whose combined size lies in
    /// `[min_bytes, max_bytes)`.
    ///
    /// The size is chosen uniformly at random in that range on every call.
    /// Every line holds at least one byte, so the range is narrowed to start
    /// no lower than `line_count`. When `min_bytes == max_bytes` the batch is
    /// exactly that size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBounds`] if `line_count` is zero, if
    /// `min_bytes > max_bytes` or if no size in the range can hold
    /// `line_count` non-empty lines.
    pub fn generate(
        &mut self,
        line_count: usize,
        min_bytes: usize,
        max_bytes: usize,
    ) -> Result<LogBatch, Error> {
        let target = self.rng.random_range(size_range(line_count, min_bytes, max_bytes)?);

        let mut lines = Vec::with_capacity(line_count);
        let mut remaining = target;
        for written in 0..line_count {
            let lines_left = line_count - written;
            let length = if lines_left == 1 {
                remaining
            } else {
                // Leave at least one byte for every line still to come and
                // keep each line near the mean so no line starves the rest.
                let ceiling = remaining - (lines_left - 1);
                let mean = remaining / lines_left;
                let upper = mean.saturating_mul(2).clamp(1, ceiling);
                self.rng.random_range(1..=upper)
            };
            lines.push(self.line(length)?);
            remaining -= length;
        }
        debug!(line_count, target, "generated batch");

        Ok(LogBatch::new(lines))
    }

    fn line(&mut self, length: usize) -> Result<String, Error> {
        self.pool.reserve(&mut self.rng, length);
        self.pool
            .of_size(&mut self.rng, length)
            .map(str::to_owned)
            .ok_or(Error::StringGenerate)
    }
}
