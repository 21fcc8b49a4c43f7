//! The load runner.
//!
//! A run has three moving parts. A ticker task pulls ticks out of the
//! [`Scheduler`] and hands them to the driver loop over a channel, so pacing
//! never waits on anything else. The driver builds a batch per push, stamps it
//! with its stream's labels and spawns a submission task for it. Submission
//! tasks wait out any backoff, take a slot under the in-flight bound and push.
//! Their outcomes flow back to the driver, which owns the report and the
//! per-stream backoff table.
//!
//! ## Metrics
//!
//! `ticks_emitted`: Ticks received from the scheduler
//! `pushes_abandoned`: Pushes dropped unsent because the run stopped
//!
//! The push client emits its own metrics, see [`crate::client`].

use std::sync::Arc;

use logflood_payload::{LabelSet, LabelSetFactory, LogBatch, PayloadGenerator};
use logflood_throttle::{Scheduler, Tick};
use metrics::counter;
use tokio::{
    sync::{Semaphore, mpsc},
    task::{JoinError, JoinSet},
    time::{self, Duration},
};
use tracing::{debug, error, info, warn};

use crate::{
    Client, Push, PushOutcome, Report, backoff,
    config::{self, Config},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Runner`].
pub enum Error {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// The push client could not be built.
    #[error(transparent)]
    Client(#[from] crate::client::Error),
    /// Batch generation failed.
    #[error(transparent)]
    Payload(#[from] logflood_payload::Error),
    /// The scheduler rejected its configuration or a lifecycle event.
    #[error(transparent)]
    Throttle(#[from] logflood_throttle::Error),
}

/// What a submission task hands back to the driver.
#[derive(Debug)]
struct Completed {
    tick: u64,
    labels: LabelSet,
    bytes: u64,
    outcome: Option<PushOutcome>,
}

/// Runs one load scenario to completion.
#[derive(Debug)]
pub struct Runner<P = Client> {
    client: Arc<P>,
    generator: PayloadGenerator,
    labels: LabelSetFactory,
    scheduler: Arc<Scheduler>,
    backoff: backoff::Streams,
    semaphore: Arc<Semaphore>,
    shutdown: logflood_signal::Watcher,
    line_count: usize,
    min_bytes: usize,
    max_bytes: usize,
    pushes_per_tick: u64,
    metric_labels: Vec<(String, String)>,
}

impl Runner<Client> {
    /// Create a new [`Runner`] pushing to the configured Loki endpoint
    ///
    /// # Errors
    ///
    /// Function will error if the configuration is invalid or the push client
    /// cannot be built.
    pub fn new(config: &Config, shutdown: logflood_signal::Watcher) -> Result<Self, Error> {
        let client = Client::new(config)?;
        Self::with_client(config, client, shutdown)
    }
}

impl<P> Runner<P>
where
    P: Push + 'static,
{
    /// Create a new [`Runner`] pushing through `client`
    ///
    /// Every configuration error surfaces here, before any traffic is sent.
    ///
    /// # Errors
    ///
    /// Function will error if the configuration is invalid.
    pub fn with_client(
        config: &Config,
        client: P,
        shutdown: logflood_signal::Watcher,
    ) -> Result<Self, Error> {
        config.validate()?;
        let (min_bytes, max_bytes) = config.payload_bounds()?;
        let labels = LabelSetFactory::new(
            config.label_cardinality_factor,
            config.base_labels.clone(),
        )?;
        let scheduler = Scheduler::new(
            config.target_rate_per_second,
            config.duration(),
            shutdown.clone(),
        )?;

        Ok(Self {
            client: Arc::new(client),
            generator: PayloadGenerator::new(config.seed),
            labels,
            scheduler: Arc::new(scheduler),
            backoff: backoff::Streams::new(config.backoff),
            semaphore: Arc::new(Semaphore::new(config.max_in_flight as usize)),
            shutdown,
            line_count: config.line_count(),
            min_bytes,
            max_bytes,
            pushes_per_tick: u64::from(config.pushes_per_tick),
            metric_labels: vec![("component".to_string(), "runner".to_string())],
        })
    }

    /// Run until the configured duration elapses or a stop is signaled, then
    /// wait for in-flight pushes and report.
    ///
    /// Transport failures never end a run early.
    ///
    /// # Errors
    ///
    /// Function will error if batch generation fails, in which case the run
    /// is stopped.
    pub async fn run(mut self) -> Result<Report, Error> {
        info!(
            interval_micros = self.scheduler.interval().as_micros(),
            pushes_per_tick = self.pushes_per_tick,
            "run starting"
        );

        // Unbounded so the ticker never waits on the driver.
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<Tick>();
        let scheduler = Arc::clone(&self.scheduler);
        let ticker = tokio::spawn(async move {
            while let Some(tick) = scheduler.next_tick().await {
                if tick_tx.send(tick).is_err() {
                    break;
                }
            }
        });

        let mut report = Report::new();
        let mut tasks: JoinSet<Completed> = JoinSet::new();
        let result = loop {
            tokio::select! {
                tick = tick_rx.recv() => match tick {
                    Some(tick) => {
                        if let Err(err) = self.dispatch(tick, &mut tasks, &mut report) {
                            error!("Stopping run, batch generation failed: {err}");
                            break Err(err);
                        }
                    }
                    None => break Ok(()),
                },
                Some(joined) = tasks.join_next() => self.complete(joined, &mut report),
            }
        };
        if result.is_err() {
            self.scheduler.stop();
            ticker.abort();
        }
        drop(tick_rx);

        if !tasks.is_empty() {
            info!("waiting on {} in-flight pushes", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            self.complete(joined, &mut report);
        }
        if let Err(err) = ticker.await {
            if !err.is_cancelled() {
                error!("Ticker task failed: {err}");
            }
        }
        result?;

        self.scheduler.drained()?;
        report.finish(self.scheduler.summary());
        report.streams = self.labels.distinct_streams(report.pushes_dispatched);
        info!(
            ticks = report.ticks_emitted,
            dispatched = report.pushes_dispatched,
            success = report.outcomes.success,
            elapsed_seconds = report.elapsed_seconds,
            "run finished in state {:?}",
            report.final_state,
        );
        Ok(report)
    }

    fn dispatch(
        &mut self,
        tick: Tick,
        tasks: &mut JoinSet<Completed>,
        report: &mut Report,
    ) -> Result<(), Error> {
        counter!("ticks_emitted", &self.metric_labels).increment(1);
        for offset in 0..self.pushes_per_tick {
            let index = tick
                .index
                .saturating_mul(self.pushes_per_tick)
                .saturating_add(offset);
            let labels = self.labels.label_set_for(index);
            let batch = self
                .generator
                .generate(self.line_count, self.min_bytes, self.max_bytes)?
                .with_labels(labels.clone());

            let delay = self.backoff.delay_for(&labels);
            self.backoff.dispatched(tick.index, &labels);
            report.pushes_dispatched += 1;

            tasks.spawn(submit(
                Arc::clone(&self.client),
                Arc::clone(&self.semaphore),
                self.shutdown.clone(),
                delay,
                tick.index,
                labels,
                batch,
            ));
        }
        Ok(())
    }

    fn complete(&mut self, joined: Result<Completed, JoinError>, report: &mut Report) {
        let completed = match joined {
            Ok(completed) => completed,
            Err(err) => {
                error!("Could not join the spawned submission task: {err}");
                return;
            }
        };
        match completed.outcome {
            Some(PushOutcome::ServerError(code)) if !(500..600).contains(&code) => {
                warn!(code, labels = %completed.labels, "push rejected");
            }
            Some(outcome) if outcome.is_retryable() => {
                debug!(?outcome, labels = %completed.labels, "push failed");
            }
            None => counter!("pushes_abandoned", &self.metric_labels).increment(1),
            Some(_) => {}
        }
        report.record(completed.outcome, completed.bytes);
        self.backoff
            .completed(completed.tick, &completed.labels, completed.outcome);
    }
}

async fn submit<P>(
    client: Arc<P>,
    semaphore: Arc<Semaphore>,
    mut shutdown: logflood_signal::Watcher,
    delay: Duration,
    tick: u64,
    labels: LabelSet,
    batch: LogBatch,
) -> Completed
where
    P: Push + ?Sized,
{
    let bytes = batch.size() as u64;
    let outcome = send(&*client, &semaphore, &mut shutdown, delay, batch).await;
    Completed {
        tick,
        labels,
        bytes,
        outcome,
    }
}

/// Push `batch` after `delay`, holding an in-flight slot for the push. Returns
/// `None` if a stop arrives before the push starts.
async fn send<P>(
    client: &P,
    semaphore: &Semaphore,
    shutdown: &mut logflood_signal::Watcher,
    delay: Duration,
    batch: LogBatch,
) -> Option<PushOutcome>
where
    P: Push + ?Sized,
{
    if !delay.is_zero() {
        tokio::select! {
            () = time::sleep(delay) => {},
            () = shutdown.recv() => return None,
        }
    }
    let permit = tokio::select! {
        permit = semaphore.acquire() => permit.ok()?,
        () = shutdown.recv() => return None,
    };
    if shutdown.is_signaled() {
        return None;
    }
    let outcome = client.push(batch).await;
    drop(permit);
    Some(outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use logflood_payload::{LabelSet, LogBatch};
    use logflood_throttle::State;
    use tokio::time::{Duration, Instant, sleep};
    use warp::Filter;

    use super::Runner;
    use crate::{Config, Push, PushOutcome};

    #[derive(Debug, Clone)]
    struct Call {
        at: Duration,
        lines: usize,
        size: usize,
        labels: LabelSet,
    }

    /// An in-process sink that records every push.
    #[derive(Debug)]
    struct Recorder {
        start: Instant,
        hold: Duration,
        respond: fn(usize, &LabelSet) -> PushOutcome,
        calls: Mutex<Vec<Call>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl Recorder {
        fn new(hold: Duration, respond: fn(usize, &LabelSet) -> PushOutcome) -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                hold,
                respond,
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Push for Arc<Recorder> {
        async fn push(&self, batch: LogBatch) -> PushOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            let labels = batch.labels().clone();
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Call {
                    at: self.start.elapsed(),
                    lines: batch.lines().len(),
                    size: batch.size(),
                    labels: batch.labels().clone(),
                });
                calls.len() - 1
            };
            if !self.hold.is_zero() {
                sleep(self.hold).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.respond)(n, &labels)
        }
    }

    fn ok(_: usize, _: &LabelSet) -> PushOutcome {
        PushOutcome::Success
    }

    fn unavailable(_: usize, _: &LabelSet) -> PushOutcome {
        PushOutcome::ServerError(503)
    }

    fn config(target: &str, rate: f64, duration: f64, extra: &str) -> Config {
        Config::parse(&format!(
            r#"
target_uri: "{target}"
request_timeout_millis: 1000
label_cardinality_factor: 0.5
base_labels:
  app: 1
target_rate_per_second: {rate}
duration_seconds: {duration}
lines_per_iteration: 2
min_payload_bytes: 64
max_payload_bytes: 4096
{extra}
"#
        ))
        .unwrap()
    }

    fn assert_near(actual: Duration, expected_millis: u64) {
        let expected = Duration::from_millis(expected_millis);
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(5),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn example_run() {
        let recorder = Recorder::new(Duration::ZERO, ok);
        let mut config = config("http://127.0.0.1:3100", 2.0, 5.0, "");
        config.min_payload_bytes = byte_unit::Byte::from_u64(512_000);
        config.max_payload_bytes = byte_unit::Byte::from_u64(1_048_576);
        let (watcher, _broadcaster) = logflood_signal::signal();

        let runner = Runner::with_client(&config, Arc::clone(&recorder), watcher).unwrap();
        let report = runner.run().await.unwrap();

        assert!((9..=11).contains(&report.ticks_emitted));
        assert_eq!(report.pushes_dispatched, report.ticks_emitted);
        assert_eq!(report.outcomes.success, report.ticks_emitted);
        assert_eq!(report.final_state, State::Stopped);
        assert!(report.elapsed_seconds >= 5.0);

        let calls = recorder.calls();
        assert_eq!(calls.len() as u64, report.ticks_emitted);
        for call in &calls {
            assert_eq!(call.lines, 2);
            assert!((512_000..1_048_576).contains(&call.size));
            assert_eq!(call.labels.get("app"), Some("app_0"));
        }
        assert_eq!(
            report.bytes_pushed,
            calls.iter().map(|c| c.size as u64).sum::<u64>()
        );
        // Factor 0.5 pairs consecutive requests onto one stream.
        assert_eq!(calls[0].labels, calls[1].labels);
        assert_ne!(calls[1].labels, calls[2].labels);
        assert_eq!(report.streams, report.pushes_dispatched.div_ceil(2));
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_per_tick_fan_out() {
        let recorder = Recorder::new(Duration::ZERO, ok);
        let config = config("http://127.0.0.1:3100", 4.0, 1.0, "pushes_per_tick: 3");
        let (watcher, _broadcaster) = logflood_signal::signal();

        let report = Runner::with_client(&config, Arc::clone(&recorder), watcher)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.ticks_emitted, 4);
        assert_eq!(report.pushes_dispatched, 12);
        assert_eq!(recorder.calls().len(), 12);
        assert_eq!(report.streams, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_stream_backs_off() {
        let recorder = Recorder::new(Duration::ZERO, unavailable);
        let mut config = config(
            "http://127.0.0.1:3100",
            1.0,
            4.0,
            "backoff:\n  initial_millis: 200\n  maximum_millis: 10000\n  max_level: 5",
        );
        config.label_cardinality_factor = 0.0;
        let (watcher, _broadcaster) = logflood_signal::signal();

        let report = Runner::with_client(&config, Arc::clone(&recorder), watcher)
            .unwrap()
            .run()
            .await
            .unwrap();

        let calls = recorder.calls();
        assert_eq!(calls.len(), 4);
        for (call, expected) in calls.iter().zip([0, 1_200, 2_400, 3_800]) {
            assert_near(call.at, expected);
        }
        assert_eq!(report.outcomes.server_error[&503], 4);
        assert_eq!(report.ticks_emitted, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_failures_still_back_off() {
        fn timed_out(_: usize, _: &LabelSet) -> PushOutcome {
            PushOutcome::ClientTimeout
        }
        // Each push takes three tick intervals to fail.
        let recorder = Recorder::new(Duration::from_millis(300), timed_out);
        let mut config = config(
            "http://127.0.0.1:3100",
            10.0,
            3.0,
            "backoff:\n  initial_millis: 200\n  maximum_millis: 10000\n  max_level: 5",
        );
        config.label_cardinality_factor = 0.0;
        let (watcher, _broadcaster) = logflood_signal::signal();

        let report = Runner::with_client(&config, Arc::clone(&recorder), watcher)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.ticks_emitted, 30);
        assert_eq!(report.outcomes.client_timeout, 30);
        let calls = recorder.calls();
        assert_eq!(calls.len(), 30);
        assert_near(calls[0].at, 0);
        // The last tick, at 2900 ms, waits out the top level: 200 ms * 2^4.
        let latest = calls.iter().map(|call| call.at).max().unwrap();
        assert!(
            latest >= Duration::from_millis(6_100),
            "latest push at {latest:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_endpoint_pushes_no_bytes() {
        fn refused(_: usize, _: &LabelSet) -> PushOutcome {
            PushOutcome::NetworkError
        }
        let recorder = Recorder::new(Duration::ZERO, refused);
        let config = config("http://127.0.0.1:3100", 2.0, 2.0, "");
        let (watcher, _broadcaster) = logflood_signal::signal();

        let report = Runner::with_client(&config, Arc::clone(&recorder), watcher)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.outcomes.network_error, 4);
        assert_eq!(report.outcomes.success, 0);
        assert_eq!(report.bytes_pushed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_backoff() {
        fn first_fails(n: usize, _: &LabelSet) -> PushOutcome {
            if n == 0 {
                PushOutcome::NetworkError
            } else {
                PushOutcome::Success
            }
        }
        let recorder = Recorder::new(Duration::ZERO, first_fails);
        let mut config = config(
            "http://127.0.0.1:3100",
            1.0,
            3.0,
            "backoff:\n  initial_millis: 200\n  maximum_millis: 10000\n  max_level: 5",
        );
        config.label_cardinality_factor = 0.0;
        let (watcher, _broadcaster) = logflood_signal::signal();

        let report = Runner::with_client(&config, Arc::clone(&recorder), watcher)
            .unwrap()
            .run()
            .await
            .unwrap();

        let calls = recorder.calls();
        assert_eq!(calls.len(), 3);
        assert_near(calls[0].at, 0);
        assert_near(calls[1].at, 1_200);
        assert_near(calls[2].at, 2_000);
        assert_eq!(report.outcomes.network_error, 1);
        assert_eq!(report.outcomes.success, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_streams_unaffected_by_backoff() {
        fn stream_zero_fails(_: usize, labels: &LabelSet) -> PushOutcome {
            if labels.get("stream") == Some("stream_0") {
                PushOutcome::ClientTimeout
            } else {
                PushOutcome::Success
            }
        }
        let recorder = Recorder::new(Duration::ZERO, stream_zero_fails);
        // Four requests per stream, two per tick: stream_0 owns ticks 0 and 1,
        // stream_1 owns ticks 2 and 3.
        let mut config = config(
            "http://127.0.0.1:3100",
            1.0,
            4.0,
            "pushes_per_tick: 2\nbackoff:\n  initial_millis: 300\n  maximum_millis: 10000\n  max_level: 5",
        );
        config.label_cardinality_factor = 0.25;
        let (watcher, _broadcaster) = logflood_signal::signal();

        let report = Runner::with_client(&config, Arc::clone(&recorder), watcher)
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(report.pushes_dispatched, 8);

        let mut calls = recorder.calls();
        calls.sort_by_key(|call| call.at);
        let at: Vec<(u128, &str)> = calls
            .iter()
            .map(|call| (call.at.as_millis(), call.labels.get("stream").unwrap_or("")))
            .collect();
        assert_eq!(
            at,
            vec![
                (0, "stream_0"),
                (0, "stream_0"),
                (1_300, "stream_0"),
                (1_300, "stream_0"),
                (2_000, "stream_1"),
                (2_000, "stream_1"),
                (3_000, "stream_1"),
                (3_000, "stream_1"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_in_flight_pushes_finish() {
        let recorder = Recorder::new(Duration::from_millis(300), ok);
        let config = config("http://127.0.0.1:3100", 10.0, 60.0, "");
        let (watcher, broadcaster) = logflood_signal::signal();

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(1_050)).await;
            broadcaster.signal();
            broadcaster
        });

        let start = Instant::now();
        let report = Runner::with_client(&config, Arc::clone(&recorder), watcher)
            .unwrap()
            .run()
            .await
            .unwrap();
        let _broadcaster = stopper.await.unwrap();

        // Ticks at 0, 100, .. 1000 ms.
        assert_eq!(report.ticks_emitted, 11);
        assert_eq!(report.outcomes.success, 11);
        assert_eq!(report.outcomes.abandoned, 0);
        assert_eq!(report.final_state, State::Stopped);
        for call in recorder.calls() {
            assert!(call.at <= Duration::from_millis(1_050));
        }
        // The last push started at 1000 ms and holds for 300 ms.
        assert!(start.elapsed() >= Duration::from_millis(1_300));
        assert!(start.elapsed() < Duration::from_millis(1_400));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_waiting_pushes() {
        let recorder = Recorder::new(Duration::from_secs(1), ok);
        let config = config("http://127.0.0.1:3100", 10.0, 60.0, "max_in_flight: 1");
        let (watcher, broadcaster) = logflood_signal::signal();

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_millis(550)).await;
            broadcaster.signal();
            broadcaster
        });

        let report = Runner::with_client(&config, Arc::clone(&recorder), watcher)
            .unwrap()
            .run()
            .await
            .unwrap();
        let _broadcaster = stopper.await.unwrap();

        // Six ticks, the first holds the only slot past the stop.
        assert_eq!(report.pushes_dispatched, 6);
        assert_eq!(report.outcomes.success, 1);
        assert_eq!(report.outcomes.abandoned, 5);
        assert_eq!(recorder.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_bound_does_not_slow_ticks() {
        let recorder = Recorder::new(Duration::from_secs(1), ok);
        let config = config("http://127.0.0.1:3100", 10.0, 2.0, "max_in_flight: 2");
        let (watcher, _broadcaster) = logflood_signal::signal();

        let report = Runner::with_client(&config, Arc::clone(&recorder), watcher)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.ticks_emitted, 20);
        assert_eq!(report.outcomes.success, 20);
        assert_eq!(recorder.peak_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_bounds_fail_before_traffic() {
        let recorder = Recorder::new(Duration::ZERO, ok);
        let mut config = config("http://127.0.0.1:3100", 1.0, 1.0, "");
        config.min_payload_bytes = byte_unit::Byte::from_u64(4_096);
        config.max_payload_bytes = byte_unit::Byte::from_u64(64);
        let (watcher, _broadcaster) = logflood_signal::signal();

        assert!(Runner::with_client(&config, Arc::clone(&recorder), watcher).is_err());
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn pushes_to_a_live_endpoint() {
        let received = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&received);
        let routes = warp::post()
            .and(warp::path!("loki" / "api" / "v1" / "push"))
            .map(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                warp::reply::with_status(warp::reply(), warp::http::StatusCode::NO_CONTENT)
            });
        let (addr, serve) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serve);

        let config = config(&format!("http://{addr}"), 10.0, 1.0, "");
        let (watcher, _broadcaster) = logflood_signal::signal();
        let report = Runner::new(&config, watcher).unwrap().run().await.unwrap();

        assert!((9..=11).contains(&report.ticks_emitted));
        assert_eq!(report.outcomes.success, report.pushes_dispatched);
        assert_eq!(received.load(Ordering::SeqCst), report.outcomes.success);
    }
}
