//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.

use std::collections::BTreeMap;

use http::Uri;
use logflood_payload::BaseLabel;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::backoff;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// The target URI has no scheme or host.
    #[error("Target URI must be absolute with an http or https scheme, got {0}")]
    TargetUri(String),
    /// Request timeout must be positive.
    #[error("request_timeout_millis must be greater than zero")]
    RequestTimeout,
    /// Rate must be finite and positive.
    #[error("target_rate_per_second must be a finite, positive number, got {0}")]
    Rate(f64),
    /// Duration must be finite and positive.
    #[error("duration_seconds must be a finite, positive number, got {0}")]
    Duration(f64),
    /// Cardinality factor must lie in [0, 1].
    #[error("label_cardinality_factor must lie in [0, 1], got {0}")]
    Factor(f64),
    /// A payload byte bound does not fit in memory.
    #[error("Payload byte bound {0} is too large for this platform")]
    ByteBound(u128),
    /// The payload bounds cannot be satisfied.
    #[error(transparent)]
    Payload(#[from] logflood_payload::Error),
    /// Value provided must not be zero.
    #[error("{0} must not be zero")]
    Zero(&'static str),
    /// The backoff configuration is inconsistent.
    #[error("backoff.initial_millis ({initial}) must not exceed backoff.maximum_millis ({maximum})")]
    Backoff {
        /// Configured initial delay
        initial: u64,
        /// Configured maximum delay
        maximum: u64,
    },
}

/// Compression applied to push request bodies
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Send bodies as-is
    #[default]
    None,
    /// Gzip bodies and set `Content-Encoding: gzip`
    Gzip,
}

fn default_seed() -> [u8; 32] {
    [
        2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
        97, 101, 103, 107, 109, 113, 127, 131,
    ]
}

fn default_pushes_per_tick() -> u32 {
    1
}

fn default_max_in_flight() -> u32 {
    256
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The seed for random operations in this run
    #[serde(default = "default_seed")]
    pub seed: [u8; 32],
    /// The base URI of the ingestion endpoint, must be a valid URI
    #[serde(with = "http_serde::uri")]
    pub target_uri: Uri,
    /// Time allowed for one push before it is counted a client timeout
    pub request_timeout_millis: u64,
    /// The fraction of requests that get a stream of their own, in [0, 1]
    pub label_cardinality_factor: f64,
    /// Labels merged into every stream's label set
    #[serde(default)]
    pub base_labels: BTreeMap<String, BaseLabel>,
    /// Ticks per second
    pub target_rate_per_second: f64,
    /// How long to run for
    pub duration_seconds: f64,
    /// Log lines in each batch
    pub lines_per_iteration: u32,
    /// Inclusive lower bound on the size of each batch
    pub min_payload_bytes: byte_unit::Byte,
    /// Exclusive upper bound on the size of each batch
    pub max_payload_bytes: byte_unit::Byte,
    /// Batches pushed per tick
    #[serde(default = "default_pushes_per_tick")]
    pub pushes_per_tick: u32,
    /// The maximum number of pushes in flight at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    /// Sent as `X-Scope-OrgID` when present
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Compression applied to push bodies
    #[serde(default)]
    pub compression: Compression,
    /// Delay applied to streams whose pushes keep failing
    #[serde(default)]
    pub backoff: backoff::Config,
}

impl Config {
    /// Parse and validate a YAML configuration
    ///
    /// # Errors
    ///
    /// Function will error if `contents` is not a valid configuration or if
    /// [`Config::validate`] rejects it.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every constraint a run depends on
    ///
    /// # Errors
    ///
    /// Function will error with the first constraint found violated.
    pub fn validate(&self) -> Result<(), Error> {
        match self.target_uri.scheme_str() {
            Some("http" | "https") if self.target_uri.host().is_some() => {}
            _ => return Err(Error::TargetUri(self.target_uri.to_string())),
        }
        if self.request_timeout_millis == 0 {
            return Err(Error::RequestTimeout);
        }
        let rate = self.target_rate_per_second;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(Error::Rate(rate));
        }
        let duration = self.duration_seconds;
        if duration <= 0.0 || Duration::try_from_secs_f64(duration).is_err() {
            return Err(Error::Duration(duration));
        }
        let factor = self.label_cardinality_factor;
        if !factor.is_finite() || !(0.0..=1.0).contains(&factor) {
            return Err(Error::Factor(factor));
        }
        if self.pushes_per_tick == 0 {
            return Err(Error::Zero("pushes_per_tick"));
        }
        if self.max_in_flight == 0 {
            return Err(Error::Zero("max_in_flight"));
        }
        if self.backoff.max_level == 0 {
            return Err(Error::Zero("backoff.max_level"));
        }
        if self.backoff.initial_millis > self.backoff.maximum_millis {
            return Err(Error::Backoff {
                initial: self.backoff.initial_millis,
                maximum: self.backoff.maximum_millis,
            });
        }
        let (min, max) = self.payload_bounds()?;
        logflood_payload::size_range(self.line_count(), min, max)?;
        // Rejects zero-cardinality base labels.
        logflood_payload::LabelSetFactory::new(factor, self.base_labels.clone())?;
        Ok(())
    }

    /// The payload bounds as `(min, max)` in bytes
    ///
    /// # Errors
    ///
    /// Function will error if either bound does not fit in `usize`.
    pub fn payload_bounds(&self) -> Result<(usize, usize), Error> {
        let min = self.min_payload_bytes.as_u128();
        let max = self.max_payload_bytes.as_u128();
        Ok((
            usize::try_from(min).map_err(|_| Error::ByteBound(min))?,
            usize::try_from(max).map_err(|_| Error::ByteBound(max))?,
        ))
    }

    /// Log lines in each batch.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.lines_per_iteration as usize
    }

    /// The request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }

    /// The run duration as a [`Duration`], zero if the configured value is not
    /// representable.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration_seconds).unwrap_or_default()
    }
}
