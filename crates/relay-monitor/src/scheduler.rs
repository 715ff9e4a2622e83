//! Per-endpoint measurement loops.
//!
//! Each monitored relay gets its own loop and its own timer; loops share
//! nothing but the thread-safe collaborators they were built with.
//!
//! ```text
//!   Idle ──start──► Armed ──tick──► Firing ──cycle done──► Armed
//!                                     │
//!                                     ├─ measure ──✗──► log, skip tick
//!                                     ├─ mirror timings
//!                                     ├─ compose + sign ──✗──► log, skip publish
//!                                     └─ publish to every destination
//! ```

use crate::composer::EventComposer;
use crate::identity::Endpoint;
use crate::mirror::MetricsMirror;
use crate::probe::{LatencyProbe, PROBE_MESSAGE};
use crate::publisher::{PublishOutcome, Publisher};
use crate::tags::TagSet;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tracing::{debug, error, info, warn};

/// What one tick did.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Probe failed; nothing was recorded or published
    MeasurementFailed,
    /// Timings mirrored, event could not be signed
    SigningFailed,
    /// Timings mirrored, metric publishing disabled
    Recorded,
    /// Timings mirrored and event fanned out
    Published(PublishOutcome),
}

/// The measurement loop of one endpoint.
pub struct EndpointLoop {
    endpoint: Endpoint,
    base_tags: TagSet,
    probe: Arc<dyn LatencyProbe>,
    headers: HeaderMap,
    /// `None` when metric events are not published
    composer: Option<EventComposer>,
    publisher: Publisher,
    mirror: MetricsMirror,
    frequency: Duration,
    geo_precision: usize,
}

impl EndpointLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Endpoint,
        base_tags: TagSet,
        probe: Arc<dyn LatencyProbe>,
        composer: Option<EventComposer>,
        publisher: Publisher,
        mirror: MetricsMirror,
        frequency: Duration,
        geo_precision: usize,
    ) -> Self {
        Self {
            endpoint,
            base_tags,
            probe,
            headers: HeaderMap::new(),
            composer,
            publisher,
            mirror,
            frequency,
            geo_precision,
        }
    }

    /// Extra headers sent with the probe's upgrade request.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Tick forever. The first tick fires one period after the call; ticks
    /// missed while a cycle overran are skipped, not replayed.
    pub async fn run(&self) {
        let mut ticker = interval_at(Instant::now() + self.frequency, self.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(relay = %self.endpoint, every = ?self.frequency, "Measurement loop armed");
        loop {
            ticker.tick().await;
            let outcome = self.run_cycle(Utc::now()).await;
            debug!(relay = %self.endpoint, ?outcome, "Cycle finished");
        }
    }

    /// One measure, mirror, compose and publish pass.
    pub async fn run_cycle(&self, at: DateTime<Utc>) -> CycleOutcome {
        let probe = match self
            .probe
            .measure(self.endpoint.url(), PROBE_MESSAGE, &self.headers)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(relay = %self.endpoint, "Skipping tick: {}", e);
                return CycleOutcome::MeasurementFailed;
            }
        };
        let timings = probe.timings;
        info!(
            relay = %self.endpoint,
            rtt_open = timings.open_latency_ms(),
            rtt_read = timings.round_trip_ms(),
            "Measured"
        );

        self.mirror.record(&self.endpoint, &timings, at);

        let Some(composer) = &self.composer else {
            return CycleOutcome::Recorded;
        };

        let event = match composer.relay_metrics(
            &self.endpoint,
            &self.base_tags,
            &timings,
            at,
            self.geo_precision,
        ) {
            Ok(event) => event,
            Err(e) => {
                error!(relay = %self.endpoint, "Discarding metric event: {}", e);
                return CycleOutcome::SigningFailed;
            }
        };

        let outcome = self.publisher.publish(&event).await;
        if !outcome.succeeded() {
            warn!(
                relay = %self.endpoint,
                accepted = outcome.accepted().count(),
                attempted = outcome.results().len(),
                "Metric event not accepted everywhere"
            );
        }
        CycleOutcome::Published(outcome)
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keep `endpoint_loop` running in its own task, restarting it if it panics.
/// Dropping the returned future stops the loop.
pub async fn supervise(endpoint_loop: Arc<EndpointLoop>) {
    loop {
        let worker = Arc::clone(&endpoint_loop);
        let task = tokio::spawn(async move { worker.run().await });
        let _guard = AbortOnDrop(task.abort_handle());
        match task.await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                error!(relay = %endpoint_loop.endpoint(), "Measurement loop panicked, restarting");
            }
            Err(_) => return,
        }
    }
}

/// Owner of every endpoint loop.
pub struct Scheduler {
    loops: Vec<Arc<EndpointLoop>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(loops: Vec<EndpointLoop>) -> Self {
        Self {
            loops: loops.into_iter().map(Arc::new).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Start one supervised task per endpoint and wait on all of them.
    /// Dropping the future stops every loop.
    pub async fn run(self) {
        if self.is_empty() {
            warn!("No measurement loops to run");
            return;
        }

        let mut tasks = JoinSet::new();
        for endpoint_loop in self.loops {
            tasks.spawn(supervise(endpoint_loop));
        }
        info!(loops = tasks.len(), "Scheduler started");
        while tasks.join_next().await.is_some() {}
    }
}
