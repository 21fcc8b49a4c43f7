//! Label sets and the factory that assigns them to requests
//!
//! Every request index maps to a stream, and every stream to one label set.
//! How many requests share a stream is controlled by the cardinality factor:
//!
//! ```text
//! factor 0    every request shares stream 0
//! factor 1    every request has a stream of its own
//! factor f    requests are bucketed round(1 / f) at a time
//! ```

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::Error;

/// The label key that distinguishes streams.
pub const STREAM_KEY: &str = "stream";

/// An ordered set of labels identifying one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Look up the value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterate the labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v:?}")?;
        }
        f.write_str("}")
    }
}

/// The value of a base label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BaseLabel {
    /// Spread streams over `n` values, `{key}_0` through `{key}_{n-1}`
    Cardinality(u32),
    /// The same value on every stream
    Fixed(String),
}

/// Produces the label set for each request index.
#[derive(Debug, Clone)]
pub struct LabelSetFactory {
    /// Requests per stream; `None` when every request shares one stream.
    bucket: Option<u64>,
    base: BTreeMap<String, BaseLabel>,
}

impl LabelSetFactory {
    /// Construct a new instance of `LabelSetFactory`
    ///
    /// # Errors
    ///
    /// Returns an error if `factor` is not a finite number in `[0, 1]` or if
    /// any base label has a cardinality of zero.
    pub fn new(factor: f64, base: BTreeMap<String, BaseLabel>) -> Result<Self, Error> {
        if !factor.is_finite() || !(0.0..=1.0).contains(&factor) {
            return Err(Error::InvalidFactor(factor));
        }
        if let Some((key, _)) = base
            .iter()
            .find(|(_, value)| matches!(value, BaseLabel::Cardinality(0)))
        {
            return Err(Error::ZeroCardinality { key: key.clone() });
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bucket = if factor == 0.0 {
            None
        } else {
            // factor in (0, 1], so 1 / factor >= 1 and the cast is lossless for
            // any factor a person would configure.
            Some(((1.0 / factor).round() as u64).max(1))
        };
        Ok(Self { bucket, base })
    }

    /// The stream that request `index` belongs to.
    #[must_use]
    pub fn stream_for(&self, index: u64) -> u64 {
        self.bucket.map_or(0, |bucket| index / bucket)
    }

    /// The number of distinct streams among the first `requests` requests.
    #[must_use]
    pub fn distinct_streams(&self, requests: u64) -> u64 {
        match self.bucket {
            None => requests.min(1),
            Some(bucket) => requests.div_ceil(bucket),
        }
    }

    /// The label set for request `index`.
    ///
    /// Base labels are merged in first, the `stream` label wins any conflict.
    #[must_use]
    pub fn label_set_for(&self, index: u64) -> LabelSet {
        let stream = self.stream_for(index);
        let mut labels: BTreeMap<String, String> = self
            .base
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    BaseLabel::Fixed(value) => value.clone(),
                    BaseLabel::Cardinality(n) => format!("{key}_{}", stream % u64::from(*n)),
                };
                (key.clone(), value)
            })
            .collect();
        labels.insert(STREAM_KEY.to_string(), format!("stream_{stream}"));
        LabelSet(labels)
    }
}
