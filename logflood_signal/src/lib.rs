//! Stop signalling for logflood runs.
//!
//! A run is stopped either because its configured duration elapsed or because
//! an operator asked it to stop. Both paths flow through the same mechanism: a
//! single `Broadcaster` and any number of `Watcher` instances. Once the
//! `Broadcaster` signals, every `Watcher` -- including ones cloned after the
//! fact -- observes the stop and never un-observes it.
//!
//! Stopping is cooperative. Nothing here aborts work; a `Watcher` is polled by
//! the code that wants to stop and that code decides where it is safe to do
//! so.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use tokio::sync::watch;
use tracing::{debug, info};

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

#[derive(Debug)]
/// Mechanism to notify every `Watcher` that the run must stop.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the stop signal to every `Watcher`.
    ///
    /// Signalling more than once has no further effect. Function will NOT
    /// block until watchers have acted on the signal.
    pub fn signal(&self) {
        self.sender.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
    }

    /// Send the stop signal and wait until every `Watcher` has been dropped.
    ///
    /// Function WILL block until the last `Watcher` goes away, so callers must
    /// not hold one themselves.
    pub async fn signal_and_wait(self) {
        self.signal();
        let watchers = self.sender.receiver_count();
        if watchers > 0 {
            info!("Waiting for {watchers} watchers to finish");
        }
        self.sender.closed().await;
        debug!("all watchers finished");
    }

    /// Whether the stop signal has been sent.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.sender.borrow()
    }
}

#[derive(Debug, Clone)]
/// Mechanism to observe the stop signal.
///
/// Dropping the `Broadcaster` without signalling is treated as a stop: there is
/// no longer anyone able to keep the run alive.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait for the stop signal. Returns immediately if it has already been
    /// sent.
    pub async fn recv(&mut self) {
        // An error here means the `Broadcaster` is gone, which counts as a stop.
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }

    /// Check for the stop signal without waiting.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }
}
