//! Monitor assembly: endpoint preparation, startup announcements and the
//! measurement loops.
//!
//! ```text
//!   MonitorConfig ──► prepare endpoints ──► capability scan (per endpoint)
//!                                                  │
//!                          startup announcements ◄─┘ (profile, relay list, registration)
//!                                                  │
//!                                                  ▼
//!                                    Scheduler: one supervised loop per endpoint
//! ```

use crate::capabilities::{self, CapabilityFetcher};
use crate::composer::{EventComposer, RegistrationParams};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::event::EventSigner;
use crate::identity::Endpoint;
use crate::mirror::{MetricsMirror, MetricsSink};
use crate::probe::LatencyProbe;
use crate::publisher::{Publisher, RelayConnector};
use crate::scheduler::{EndpointLoop, Scheduler};
use crate::startup::{self, StartupPlan};
use crate::tags::TagSet;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::http::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{error, info, warn};

/// Measurement name used when the sink does not configure one.
pub const DEFAULT_MEASUREMENT: &str = "relay_latency";

/// User agent sent with every probe's upgrade request.
pub const PROBE_USER_AGENT: &str = concat!("saorsa-relay-monitor/", env!("CARGO_PKG_VERSION"));

fn probe_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(PROBE_USER_AGENT));
    headers
}

/// External capabilities the monitor is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn CapabilityFetcher>,
    pub probe: Arc<dyn LatencyProbe>,
    pub connector: Arc<dyn RelayConnector>,
    /// Required when anything is published
    pub signer: Option<Arc<dyn EventSigner>>,
    pub sink: Option<Arc<dyn MetricsSink>>,
}

/// A configured, not yet running, monitor.
pub struct Monitor {
    config: MonitorConfig,
    deps: Collaborators,
}

impl Monitor {
    /// Validate `config` against the available collaborators.
    pub fn new(config: MonitorConfig, deps: Collaborators) -> Result<Self> {
        config.validate()?;
        if config.publishing_enabled() && deps.signer.is_none() {
            return Err(MonitorError::InvalidConfig(
                "publishing enabled without a signing key".to_string(),
            ));
        }
        Ok(Self { config, deps })
    }

    /// Parse and normalize the configured endpoints.
    ///
    /// Malformed addresses are logged and skipped, as are addresses that
    /// normalize to an endpoint already in the list. Fails only if nothing
    /// usable remains.
    pub fn prepare_endpoints(&self) -> Result<Vec<Endpoint>> {
        let mut seen = HashSet::new();
        let mut endpoints = Vec::new();

        for raw in &self.config.endpoints {
            match Endpoint::parse(raw, self.config.relay_location) {
                Ok(endpoint) => {
                    if seen.insert(endpoint.normalized().to_string()) {
                        endpoints.push(endpoint);
                    } else {
                        warn!(
                            relay = %endpoint.raw(),
                            normalized = %endpoint.normalized(),
                            "Duplicate relay ignored"
                        );
                    }
                }
                Err(e) => error!("Skipping relay: {}", e),
            }
        }

        if endpoints.is_empty() {
            return Err(MonitorError::InvalidConfig(
                "no valid relay endpoint configured".to_string(),
            ));
        }
        Ok(endpoints)
    }

    fn composer(&self) -> Option<EventComposer> {
        self.deps.signer.clone().map(EventComposer::new)
    }

    fn publisher(&self) -> Publisher {
        Publisher::new(
            Arc::clone(&self.deps.connector),
            self.config.destinations.clone(),
        )
    }

    fn mirror(&self) -> MetricsMirror {
        match &self.deps.sink {
            Some(sink) => {
                let measurement = self
                    .config
                    .influx
                    .as_ref()
                    .map_or(DEFAULT_MEASUREMENT, |i| i.measurement.as_str());
                MetricsMirror::new(Arc::clone(sink), measurement, &self.config.profile.name)
            }
            None => MetricsMirror::disabled(),
        }
    }

    fn startup_plan(&self) -> StartupPlan {
        StartupPlan {
            publish_profile: self.config.publish_profile,
            publish_registration: self.config.publish_registration,
            profile: self.config.profile.clone(),
            registration: RegistrationParams {
                frequency: self.config.frequency,
                timeouts: self.config.timeouts,
                write_timeout: self.config.write_timeout,
                country_code: self.config.country_code.clone(),
                location: self.config.monitor_location,
                geo_precision: self.config.geo_precision,
            },
        }
    }

    /// Prepare endpoints, scan capabilities, publish the startup
    /// announcements and build, but do not start, the scheduler.
    pub async fn start(self) -> Result<Scheduler> {
        let endpoints = self.prepare_endpoints()?;

        let mut scanned: Vec<(Endpoint, TagSet)> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let tags = capabilities::scan(self.deps.fetcher.as_ref(), &endpoint).await;
            scanned.push((endpoint, tags));
        }

        let composer = self.composer();
        let publisher = self.publisher();

        let plan = self.startup_plan();
        if let Some(composer) = composer.as_ref().filter(|_| !plan.is_empty()) {
            startup::announce(composer, &publisher, &plan, Utc::now()).await;
        }

        let metric_composer = composer.filter(|_| self.config.publish_metrics);
        let mirror = self.mirror();
        info!(
            relays = scanned.len(),
            destinations = publisher.destinations().len(),
            publish_metrics = metric_composer.is_some(),
            mirror = mirror.is_enabled(),
            "Monitor starting"
        );

        let loops = scanned
            .into_iter()
            .map(|(endpoint, base_tags)| {
                EndpointLoop::new(
                    endpoint,
                    base_tags,
                    Arc::clone(&self.deps.probe),
                    metric_composer.clone(),
                    publisher.clone(),
                    mirror.clone(),
                    self.config.frequency,
                    self.config.geo_precision,
                )
                .with_headers(probe_headers())
            })
            .collect();

        Ok(Scheduler::new(loops))
    }

    /// Start and run until every loop ends, which in practice is never.
    pub async fn run(self) -> Result<()> {
        let scheduler = self.start().await?;
        scheduler.run().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::RelayInformation;
    use crate::config::InfluxConfig;
    use crate::event::KeypairSigner;
    use crate::probe::PhaseTimings;
    use crate::test_support::{
        RecordingConnector, RecordingSink, ScriptedProbe, StaticFetcher, TEST_SECRET,
    };
    use std::time::Duration;

    struct Fakes {
        probe: Arc<ScriptedProbe>,
        connector: Arc<RecordingConnector>,
        sink: Arc<RecordingSink>,
        deps: Collaborators,
    }

    fn fakes(fetcher: StaticFetcher, with_signer: bool) -> Fakes {
        let connector = Arc::new(RecordingConnector::default());
        let sink = Arc::new(RecordingSink::default());
        let signer: Option<Arc<dyn EventSigner>> = if with_signer {
            Some(Arc::new(KeypairSigner::from_hex(TEST_SECRET).unwrap()))
        } else {
            None
        };
        let probe = Arc::new(ScriptedProbe::succeeding(PhaseTimings::from_millis(
            5, 10, 0, 20, 15,
        )));
        let deps = Collaborators {
            fetcher: Arc::new(fetcher),
            probe: probe.clone(),
            connector: connector.clone(),
            signer,
            sink: Some(sink.clone()),
        };
        Fakes {
            probe,
            connector,
            sink,
            deps,
        }
    }

    fn publishing_config(endpoints: &[&str]) -> MonitorConfig {
        MonitorConfig {
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            destinations: vec!["wss://dest.example/".to_string()],
            private_key: Some(TEST_SECRET.to_string()),
            publish_profile: true,
            publish_registration: true,
            publish_metrics: true,
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn test_prepare_skips_malformed_and_duplicates() {
        let fakes = fakes(StaticFetcher::failing(), true);
        let config = publishing_config(&[
            "wss://relay.example",
            "https://not-a-relay.example",
            "WSS://Relay.Example:443/",
            "ws://other.example:7777",
        ]);
        let monitor = Monitor::new(config, fakes.deps).unwrap();

        let endpoints = monitor.prepare_endpoints().unwrap();
        let normalized: Vec<&str> = endpoints.iter().map(Endpoint::normalized).collect();
        assert_eq!(normalized, vec!["wss://relay.example/", "ws://other.example:7777/"]);
    }

    #[test]
    fn test_no_valid_endpoint_is_rejected() {
        let fakes = fakes(StaticFetcher::failing(), false);
        let config = MonitorConfig {
            endpoints: vec!["not a url".to_string()],
            ..MonitorConfig::default()
        };
        let monitor = Monitor::new(config, fakes.deps).unwrap();
        let err = monitor.prepare_endpoints().unwrap_err();
        assert!(matches!(err, MonitorError::InvalidConfig(_)));
    }

    #[test]
    fn test_publishing_requires_signer() {
        let fakes = fakes(StaticFetcher::failing(), false);
        let result = Monitor::new(publishing_config(&["wss://relay.example"]), fakes.deps);
        assert!(matches!(result, Err(MonitorError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_start_announces_before_measuring() {
        let fakes = fakes(StaticFetcher::failing(), true);
        let monitor = Monitor::new(publishing_config(&["wss://relay.example"]), fakes.deps).unwrap();

        let scheduler = monitor.start().await.unwrap();

        assert_eq!(scheduler.len(), 1);
        let kinds: Vec<u16> = fakes
            .connector
            .published_events()
            .iter()
            .map(|(_, e)| e.kind)
            .collect();
        assert_eq!(kinds, vec![0, 10002, 10166]);
        assert!(fakes.sink.points().is_empty());
    }

    #[tokio::test]
    async fn test_measure_only_monitor_publishes_nothing() {
        let fakes = fakes(StaticFetcher::failing(), false);
        let config = MonitorConfig {
            endpoints: vec!["wss://relay.example".to_string()],
            ..MonitorConfig::default()
        };
        let monitor = Monitor::new(config, fakes.deps).unwrap();

        let scheduler = monitor.start().await.unwrap();

        assert_eq!(scheduler.len(), 1);
        assert!(fakes.connector.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metric_events_carry_capabilities() {
        let info: RelayInformation =
            serde_json::from_str(r#"{"supported_nips": [1, 11], "relay_countries": ["NL"]}"#)
                .unwrap();
        let fakes = fakes(StaticFetcher::with(info), true);
        let config = MonitorConfig {
            publish_profile: false,
            publish_registration: false,
            influx: Some(InfluxConfig {
                url: "http://influx.invalid".to_string(),
                token: "t".to_string(),
                org: "o".to_string(),
                bucket: "b".to_string(),
                measurement: "relay_rtt".to_string(),
            }),
            ..publishing_config(&["wss://relay.example"])
        };
        let frequency = config.frequency;
        let monitor = Monitor::new(config, fakes.deps).unwrap();

        let handle = tokio::spawn(monitor.run());
        tokio::time::sleep(frequency + Duration::from_millis(500)).await;

        let events = fakes.connector.published_events();
        assert_eq!(events.len(), 1);
        let event = &events[0].1;
        assert_eq!(event.kind, 30166);
        assert_eq!(event.identifier(), Some("wss://relay.example/"));
        assert!(event.tags.contains("N", "11"));
        assert!(event.tags.contains("R", "!payment"));
        assert!(event.tags.contains("G", "NL"));

        let points = fakes.sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement(), "relay_rtt");

        let headers = fakes.probe.last_headers().unwrap();
        assert_eq!(headers[USER_AGENT], PROBE_USER_AGENT);
        handle.abort();
    }
}
