//! Loki push API encoding
//!
//! A batch becomes one stream in a push request:
//!
//! ```text
//! {"streams":[{"stream":{"app":"app_0","stream":"stream_3"},
//!              "values":[["1700000000000000000","line one"],
//!                        ["1700000000000000001","line two"]]}]}
//! ```
//!
//! Timestamps are unix nanoseconds carried as strings. Each line is stamped
//! one nanosecond after the previous so entries in a batch keep their order.

use serde::Serialize;

use crate::{Error, LabelSet, LogBatch};

/// The path, relative to the endpoint, at which Loki accepts pushes.
pub const PUSH_PATH: &str = "/loki/api/v1/push";

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: [Stream<'a>; 1],
}

#[derive(Serialize)]
struct Stream<'a> {
    stream: &'a LabelSet,
    values: Vec<(String, &'a str)>,
}

/// Encode `batch` as a JSON push request, stamping the first line at
/// `start_nanos` since the unix epoch.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode(batch: &LogBatch, start_nanos: u128) -> Result<Vec<u8>, Error> {
    let values = batch
        .lines()
        .iter()
        .zip(start_nanos..)
        .map(|(line, ts)| (ts.to_string(), line.as_str()))
        .collect();
    let request = PushRequest {
        streams: [Stream {
            stream: batch.labels(),
            values,
        }],
    };
    // Framing adds a few dozen bytes per line on top of the content.
    let mut buf = Vec::with_capacity(batch.size() + 64 * (batch.lines().len() + 1));
    serde_json::to_writer(&mut buf, &request)?;
    Ok(buf)
}
