//! In-memory collaborators shared by the unit tests.

use crate::capabilities::{CapabilityFetcher, RelayInformation};
use crate::error::{MonitorError, Result};
use crate::event::{Event, EventSigner, UnsignedEvent};
use crate::mirror::{MetricPoint, MetricsSink};
use crate::probe::{LatencyProbe, PhaseTimings, ProbeResult};
use crate::publisher::{RelayConnector, RelaySession};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use url::Url;

/// BIP-340 test vector 0 secret key.
pub const TEST_SECRET: &str = "0000000000000000000000000000000000000000000000000000000000000003";

/// Fetcher returning a fixed document, or failing.
pub struct StaticFetcher {
    info: Option<RelayInformation>,
}

impl StaticFetcher {
    pub fn failing() -> Self {
        Self { info: None }
    }

    pub fn with(info: RelayInformation) -> Self {
        Self { info: Some(info) }
    }
}

#[async_trait]
impl CapabilityFetcher for StaticFetcher {
    async fn fetch(&self, url: &Url) -> Result<RelayInformation> {
        self.info
            .clone()
            .ok_or_else(|| MonitorError::capability(url.as_str(), "HTTP 404 Not Found"))
    }
}

enum Step {
    Measure(PhaseTimings),
    Stall(Duration, PhaseTimings),
    Fail,
    Panic,
}

/// Probe replaying a script of outcomes, then repeating a fallback.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<Step>>,
    repeat: Option<PhaseTimings>,
    calls: AtomicUsize,
    last_headers: Mutex<Option<HeaderMap>>,
}

impl ScriptedProbe {
    fn new(script: Vec<Step>, repeat: Option<PhaseTimings>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat,
            calls: AtomicUsize::new(0),
            last_headers: Mutex::new(None),
        }
    }

    /// Always measures `timings`.
    pub fn succeeding(timings: PhaseTimings) -> Self {
        Self::new(Vec::new(), Some(timings))
    }

    /// Always fails.
    pub fn failing() -> Self {
        Self::new(Vec::new(), None)
    }

    /// `Some` measures, `None` fails; fails once the script runs out.
    pub fn sequence(steps: Vec<Option<PhaseTimings>>) -> Self {
        let script = steps
            .into_iter()
            .map(|s| s.map_or(Step::Fail, Step::Measure))
            .collect();
        Self::new(script, None)
    }

    /// Panics on the first call, then always measures `timings`.
    pub fn panicking_once(timings: PhaseTimings) -> Self {
        Self::new(vec![Step::Panic], Some(timings))
    }

    /// Takes `delay` on the first call, then always measures `timings`.
    pub fn slow_once(delay: Duration, timings: PhaseTimings) -> Self {
        Self::new(vec![Step::Stall(delay, timings)], Some(timings))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Headers passed on the most recent call.
    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.last_headers.lock().unwrap().clone()
    }
}

#[async_trait]
impl LatencyProbe for ScriptedProbe {
    async fn measure(&self, url: &Url, _message: &str, headers: &HeaderMap) -> Result<ProbeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_headers.lock().unwrap() = Some(headers.clone());
        let step = {
            let mut script = self.script.lock().unwrap();
            script.pop_front()
        };
        let step = step.unwrap_or(match self.repeat {
            Some(timings) => Step::Measure(timings),
            None => Step::Fail,
        });

        match step {
            Step::Measure(timings) => Ok(ProbeResult {
                timings,
                response: r#"["EOSE","1234abcdping"]"#.to_string(),
            }),
            Step::Stall(delay, timings) => {
                tokio::time::sleep(delay).await;
                Ok(ProbeResult {
                    timings,
                    response: r#"["EOSE","1234abcdping"]"#.to_string(),
                })
            }
            Step::Fail => Err(MonitorError::measurement(url.as_str(), "connection refused")),
            Step::Panic => panic!("scripted probe panic"),
        }
    }
}

/// Signer that always fails.
#[derive(Debug, Default)]
pub struct FailingSigner;

impl EventSigner for FailingSigner {
    fn public_key(&self) -> &str {
        "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
    }

    fn sign(&self, _event: UnsignedEvent) -> Result<Event> {
        Err(MonitorError::SigningFailed("signer unavailable".to_string()))
    }
}

#[derive(Default)]
struct ConnectorLog {
    attempts: Vec<String>,
    published: Vec<(String, Event)>,
    closed: Vec<String>,
}

/// Connector recording every attempt, with per-destination failures.
#[derive(Default)]
pub struct RecordingConnector {
    unreachable: HashSet<String>,
    rejecting: HashSet<String>,
    log: Arc<Mutex<ConnectorLog>>,
}

impl RecordingConnector {
    /// Fail to connect to `url`.
    pub fn unreachable(mut self, url: &str) -> Self {
        self.unreachable.insert(url.to_string());
        self
    }

    /// Connect to `url`, but reject every event.
    pub fn rejecting(mut self, url: &str) -> Self {
        self.rejecting.insert(url.to_string());
        self
    }

    /// Destinations connected to, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.log.lock().unwrap().attempts.clone()
    }

    /// `(destination, event id)` of every accepted event.
    pub fn published_ids(&self) -> Vec<(String, String)> {
        self.log
            .lock()
            .unwrap()
            .published
            .iter()
            .map(|(d, e)| (d.clone(), e.id.clone()))
            .collect()
    }

    pub fn published_events(&self) -> Vec<(String, Event)> {
        self.log.lock().unwrap().published.clone()
    }

    /// Destinations whose session was closed.
    pub fn closed(&self) -> Vec<String> {
        self.log.lock().unwrap().closed.clone()
    }
}

#[async_trait]
impl RelayConnector for RecordingConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn RelaySession>> {
        self.log.lock().unwrap().attempts.push(url.to_string());
        if self.unreachable.contains(url) {
            return Err(MonitorError::unreachable(url, "connection refused"));
        }
        Ok(Box::new(RecordingSession {
            url: url.to_string(),
            reject: self.rejecting.contains(url),
            log: Arc::clone(&self.log),
        }))
    }
}

struct RecordingSession {
    url: String,
    reject: bool,
    log: Arc<Mutex<ConnectorLog>>,
}

#[async_trait]
impl RelaySession for RecordingSession {
    async fn publish(&mut self, event: &Event) -> Result<()> {
        if self.reject {
            return Err(MonitorError::rejected(&self.url, "blocked: not on allow list"));
        }
        self.log
            .lock()
            .unwrap()
            .published
            .push((self.url.clone(), event.clone()));
        Ok(())
    }

    async fn close(&mut self) {
        self.log.lock().unwrap().closed.push(self.url.clone());
    }
}

/// Sink keeping every point in memory.
#[derive(Default)]
pub struct RecordingSink {
    points: Mutex<Vec<MetricPoint>>,
}

impl RecordingSink {
    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingSink {
    fn write_point(&self, point: MetricPoint) {
        self.points.lock().unwrap().push(point);
    }
}
