//! The logflood log-ingestion load generator.
//!
//! This library supports the logflood binary found elsewhere in this project.
//! A run pushes batches of synthetic log lines at a Loki-compatible endpoint at
//! a fixed rate for a fixed duration and reports what became of every push.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
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

pub mod backoff;
pub mod client;
pub mod config;
pub mod report;
pub mod runner;

pub use client::{Client, Push, PushOutcome};
pub use config::Config;
pub use report::Report;
pub use runner::Runner;
