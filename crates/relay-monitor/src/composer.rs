//! Event composition for the four kinds the monitor publishes.
//!
//! Tag construction is kept in free functions so the event shape can be
//! checked without a key; `EventComposer` wraps them with the issuer identity
//! and the signing step.

use crate::error::Result;
use crate::event::{Event, EventKind, EventSigner, UnsignedEvent};
use crate::geo::{self, GeoPoint};
use crate::identity::Endpoint;
use crate::probe::{PhaseTimings, ProbeTimeouts, millis};
use crate::tags::{Tag, TagSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Profile metadata published as kind 0 content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    pub name: String,
    pub about: String,
    pub picture: String,
}

/// Observation parameters announced in the registration event.
#[derive(Debug, Clone)]
pub struct RegistrationParams {
    /// Tick period of every endpoint loop
    pub frequency: Duration,
    /// Probe budgets announced as `timeout` tags
    pub timeouts: ProbeTimeouts,
    /// Publish budget announced as the `write` timeout
    pub write_timeout: Duration,
    /// ISO country code of the monitor
    pub country_code: Option<String>,
    /// Monitor location
    pub location: GeoPoint,
    /// Height of the `g` ladder
    pub geo_precision: usize,
}

/// `r` tags for the relay-list event.
#[must_use]
pub fn relay_list_tags(destinations: &[String]) -> TagSet {
    destinations
        .iter()
        .map(|url| Tag::new("r", [url.as_str(), "write"]))
        .collect()
}

/// Tags of the monitor registration event.
#[must_use]
pub fn registration_tags(pubkey: &str, params: &RegistrationParams) -> TagSet {
    let mut tags = TagSet::new();
    tags.append(Tag::new("frequency", [params.frequency.as_secs().to_string()]));
    tags.append(Tag::new("o", [pubkey]));
    tags.append(Tag::new(
        "k",
        [EventKind::RelayMetrics.number().to_string()],
    ));
    tags.append(Tag::new("c", ["open"]));
    tags.append(Tag::new("c", ["read"]));
    tags.append(Tag::new(
        "timeout",
        ["open".to_string(), millis(params.timeouts.open).to_string()],
    ));
    tags.append(Tag::new(
        "timeout",
        ["read".to_string(), millis(params.timeouts.read).to_string()],
    ));
    tags.append(Tag::new(
        "timeout",
        ["write".to_string(), millis(params.write_timeout).to_string()],
    ));
    if let Some(country) = params.country_code.as_deref().filter(|c| !c.is_empty()) {
        tags.append(Tag::new("G", [country, "countryCode"]));
    }
    geo::append_ladder(&mut tags, params.location, params.geo_precision);
    tags
}

/// Tags of a per-tick metric event.
///
/// Starts from a snapshot of `base` (the endpoint's capability tags) and
/// adds the identity, location, latency and network-class tags.
#[must_use]
pub fn metric_tags(
    endpoint: &Endpoint,
    base: &TagSet,
    timings: &PhaseTimings,
    geo_precision: usize,
) -> TagSet {
    let mut tags = base.clone();
    tags.append(Tag::new("d", [endpoint.normalized()]));
    geo::append_ladder(&mut tags, endpoint.location(), geo_precision);
    tags.append(Tag::new("rtt-open", [timings.open_latency_ms().to_string()]));
    tags.append(Tag::new("rtt-read", [timings.round_trip_ms().to_string()]));
    tags.append(Tag::new(
        "other",
        ["network", endpoint.network_class().as_str()],
    ));
    tags
}

/// Builds and signs events under the monitor's identity.
#[derive(Clone)]
pub struct EventComposer {
    signer: Arc<dyn EventSigner>,
}

impl EventComposer {
    pub fn new(signer: Arc<dyn EventSigner>) -> Self {
        Self { signer }
    }

    /// Issuer public key.
    #[must_use]
    pub fn public_key(&self) -> &str {
        self.signer.public_key()
    }

    /// Kind 0 profile.
    pub fn profile(&self, profile: &ProfileMetadata, created_at: DateTime<Utc>) -> Result<Event> {
        let content = serde_json::to_string(profile)?;
        self.sign(EventKind::Profile, TagSet::new(), content, created_at)
    }

    /// Kind 10002 relay list.
    pub fn relay_list(&self, destinations: &[String], created_at: DateTime<Utc>) -> Result<Event> {
        self.sign(
            EventKind::RelayList,
            relay_list_tags(destinations),
            String::new(),
            created_at,
        )
    }

    /// Kind 10166 monitor registration.
    pub fn registration(
        &self,
        params: &RegistrationParams,
        created_at: DateTime<Utc>,
    ) -> Result<Event> {
        let tags = registration_tags(self.public_key(), params);
        self.sign(EventKind::MonitorRegistration, tags, String::new(), created_at)
    }

    /// Kind 30166 relay metrics for one measurement.
    pub fn relay_metrics(
        &self,
        endpoint: &Endpoint,
        base: &TagSet,
        timings: &PhaseTimings,
        created_at: DateTime<Utc>,
        geo_precision: usize,
    ) -> Result<Event> {
        let tags = metric_tags(endpoint, base, timings, geo_precision);
        self.sign(EventKind::RelayMetrics, tags, String::new(), created_at)
    }

    fn sign(
        &self,
        kind: EventKind,
        tags: TagSet,
        content: String,
        created_at: DateTime<Utc>,
    ) -> Result<Event> {
        let unsigned = UnsignedEvent::new(self.public_key(), created_at, kind, tags, content);
        self.signer.sign(unsigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::capability_tags;
    use crate::error::MonitorError;
    use crate::event::KeypairSigner;
    use crate::test_support::{FailingSigner, TEST_SECRET};

    fn composer() -> EventComposer {
        EventComposer::new(Arc::new(KeypairSigner::from_hex(TEST_SECRET).unwrap()))
    }

    fn fields(tags: &TagSet) -> Vec<Vec<String>> {
        tags.iter().map(|t| t.as_slice().to_vec()).collect()
    }

    #[test]
    fn test_metric_tags_for_scenario() {
        let endpoint = Endpoint::parse("ws://Relay.Test:80/sub", GeoPoint::new(57.64911, 10.40744))
            .unwrap();
        let timings = PhaseTimings::from_millis(5, 10, 0, 20, 15);
        let tags = metric_tags(&endpoint, &TagSet::new(), &timings, 9);

        assert_eq!(tags.get("d").unwrap().value(), Some("ws://relay.test/sub"));
        assert_eq!(tags.get("rtt-open").unwrap().value(), Some("35"));
        assert_eq!(tags.get("rtt-read").unwrap().value(), Some("15"));
        assert_eq!(tags.get("other").unwrap().values(), &["network", "clearnet"]);
        assert_eq!(tags.values("g").count(), 9);
        assert_eq!(tags.values("g").last(), Some("u4pruydqq"));
    }

    #[test]
    fn test_metric_tags_keep_base_first_and_untouched() {
        let endpoint = Endpoint::parse("wss://relay.example", GeoPoint::default()).unwrap();
        let mut base = TagSet::new();
        base.append(Tag::new("N", ["11"]));
        base.append(Tag::new("R", ["!auth"]));

        let tags = metric_tags(&endpoint, &base, &PhaseTimings::default(), 2);

        assert_eq!(base.len(), 2);
        let rendered = fields(&tags);
        assert_eq!(rendered[0], vec!["N", "11"]);
        assert_eq!(rendered[1], vec!["R", "!auth"]);
        assert_eq!(rendered[2], vec!["d", "wss://relay.example/"]);
    }

    #[test]
    fn test_metric_tags_without_capabilities() {
        let endpoint = Endpoint::parse("wss://relay.example", GeoPoint::default()).unwrap();
        let base = capability_tags(None);
        let tags = metric_tags(&endpoint, &base, &PhaseTimings::default(), 3);
        assert!(tags.get("N").is_none());
        assert!(tags.get("R").is_none());
        // d + 3 g + rtt-open + rtt-read + other
        assert_eq!(tags.len(), 7);
    }

    #[test]
    fn test_relay_list_tags() {
        let tags = relay_list_tags(&[
            "wss://a.example/".to_string(),
            "wss://b.example/".to_string(),
            "wss://a.example/".to_string(),
        ]);
        assert_eq!(
            fields(&tags),
            vec![
                vec!["r", "wss://a.example/", "write"],
                vec!["r", "wss://b.example/", "write"],
            ]
        );
    }

    #[test]
    fn test_registration_tags() {
        let params = RegistrationParams {
            frequency: Duration::from_secs(10),
            timeouts: ProbeTimeouts::default(),
            write_timeout: Duration::from_secs(15),
            country_code: Some("NL".to_string()),
            location: GeoPoint::new(52.37, 4.89),
            geo_precision: 4,
        };
        let tags = registration_tags("pubkeyhex", &params);
        let rendered = fields(&tags);
        assert_eq!(
            &rendered[..9],
            &[
                vec!["frequency", "10"],
                vec!["o", "pubkeyhex"],
                vec!["k", "30166"],
                vec!["c", "open"],
                vec!["c", "read"],
                vec!["timeout", "open", "5000"],
                vec!["timeout", "read", "15000"],
                vec!["timeout", "write", "15000"],
                vec!["G", "NL", "countryCode"],
            ]
        );
        assert_eq!(tags.values("g").count(), 4);
    }

    #[test]
    fn test_registration_without_country() {
        let params = RegistrationParams {
            frequency: Duration::from_secs(60),
            timeouts: ProbeTimeouts::default(),
            write_timeout: Duration::from_secs(15),
            country_code: Some(String::new()),
            location: GeoPoint::default(),
            geo_precision: 1,
        };
        let tags = registration_tags("pk", &params);
        assert!(tags.get("G").is_none());
        assert_eq!(tags.get("frequency").unwrap().value(), Some("60"));
    }

    #[test]
    fn test_profile_event() {
        let composer = composer();
        let profile = ProfileMetadata {
            name: "monitor-ams".to_string(),
            about: "Relay latency monitor".to_string(),
            picture: "https://example.com/p.png".to_string(),
        };
        let event = composer.profile(&profile, Utc::now()).unwrap();
        assert_eq!(event.kind, 0);
        assert!(event.tags.is_empty());
        let content: ProfileMetadata = serde_json::from_str(&event.content).unwrap();
        assert_eq!(content, profile);
        assert_eq!(event.pubkey, composer.public_key());
    }

    #[test]
    fn test_relay_metrics_event() {
        let composer = composer();
        let endpoint = Endpoint::parse("WSS://Relay.Example:443", GeoPoint::default()).unwrap();
        let event = composer
            .relay_metrics(
                &endpoint,
                &TagSet::new(),
                &PhaseTimings::from_millis(1, 2, 3, 4, 5),
                Utc::now(),
                9,
            )
            .unwrap();
        assert_eq!(event.kind, 30166);
        assert_eq!(event.identifier(), Some("wss://relay.example/"));
        assert_eq!(event.tags.get("rtt-open").unwrap().value(), Some("10"));
    }

    #[test]
    fn test_signing_failure_is_reported() {
        let composer = EventComposer::new(Arc::new(FailingSigner::default()));
        let err = composer.relay_list(&["wss://a/".to_string()], Utc::now()).unwrap_err();
        assert!(matches!(err, MonitorError::SigningFailed(_)));
    }
}
