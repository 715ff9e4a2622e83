//! Relay information documents (NIP-11) and the tags derived from them.
//!
//! The document is fetched once per endpoint at scan time. A missing or
//! undecodable document is not an error for the monitor: the endpoint is
//! still measured and published, just with fewer tags.

use crate::error::{MonitorError, Result};
use crate::identity::Endpoint;
use crate::tags::{Tag, TagSet};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Media type relays answer NIP-11 requests with.
pub const NOSTR_JSON: &str = "application/nostr+json";

/// Relay information document.
///
/// Every field is optional and unknown fields are ignored; relays in the wild
/// publish wildly inconsistent documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayInformation {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pubkey: Option<String>,
    pub contact: Option<String>,
    pub software: Option<String>,
    pub version: Option<String>,
    /// NIP numbers; some relays send floats or strings
    pub supported_nips: Option<Vec<Value>>,
    pub limitation: Option<RelayLimitation>,
    pub relay_countries: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

/// The `limitation` block of a relay information document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayLimitation {
    pub payment_required: Option<bool>,
    pub auth_required: Option<bool>,
    pub restricted_writes: Option<bool>,
}

impl RelayInformation {
    /// Supported NIP numbers, skipping entries that are not whole numbers.
    #[must_use]
    pub fn nip_numbers(&self) -> Vec<u64> {
        self.supported_nips
            .iter()
            .flatten()
            .filter_map(nip_number)
            .collect()
    }

    #[must_use]
    pub fn payment_required(&self) -> bool {
        self.limitation
            .as_ref()
            .and_then(|l| l.payment_required)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn auth_required(&self) -> bool {
        self.limitation
            .as_ref()
            .and_then(|l| l.auth_required)
            .unwrap_or(false)
    }
}

fn nip_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Translate a relay information document into tags.
///
/// Emits, in order: one `N` tag per supported NIP, `R payment|!payment`,
/// `R auth|!auth`, one `G` tag per declared country and one `t` tag per
/// declared label. An absent document contributes nothing.
#[must_use]
pub fn capability_tags(info: Option<&RelayInformation>) -> TagSet {
    let mut tags = TagSet::new();
    let Some(info) = info else {
        return tags;
    };

    for nip in info.nip_numbers() {
        tags.append(Tag::new("N", [nip.to_string()]));
    }

    let payment = if info.payment_required() {
        "payment"
    } else {
        "!payment"
    };
    tags.append(Tag::new("R", [payment]));

    let auth = if info.auth_required() { "auth" } else { "!auth" };
    tags.append(Tag::new("R", [auth]));

    for country in info.relay_countries.iter().flatten() {
        tags.append(Tag::new("G", [country.as_str()]));
    }

    for label in info.tags.iter().flatten() {
        tags.append(Tag::new("t", [label.as_str()]));
    }

    tags
}

/// Source of relay information documents.
#[async_trait]
pub trait CapabilityFetcher: Send + Sync {
    /// Fetch the document for the relay at `url`.
    async fn fetch(&self, url: &Url) -> Result<RelayInformation>;
}

/// Fetch the document for `endpoint` and turn it into tags, degrading to an
/// empty set on failure.
pub async fn scan(fetcher: &dyn CapabilityFetcher, endpoint: &Endpoint) -> TagSet {
    match fetcher.fetch(endpoint.url()).await {
        Ok(info) => {
            let tags = capability_tags(Some(&info));
            debug!(relay = %endpoint, tags = tags.len(), "Relay information collected");
            tags
        }
        Err(e) => {
            warn!(relay = %endpoint, "Continuing without relay information: {}", e);
            capability_tags(None)
        }
    }
}

/// NIP-11 fetcher over HTTP(S).
pub struct HttpCapabilityFetcher {
    client: reqwest::Client,
}

impl HttpCapabilityFetcher {
    /// Create a fetcher with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MonitorError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// HTTP address serving the document for a WebSocket relay address.
    pub fn information_url(url: &Url) -> Result<Url> {
        let scheme = match url.scheme() {
            "ws" => "http",
            "wss" => "https",
            other => {
                return Err(MonitorError::capability(
                    url.as_str(),
                    format!("unsupported scheme '{}'", other),
                ));
            }
        };
        let mut info_url = url.clone();
        info_url
            .set_scheme(scheme)
            .map_err(|_| MonitorError::capability(url.as_str(), "cannot map scheme"))?;
        Ok(info_url)
    }
}

#[async_trait]
impl CapabilityFetcher for HttpCapabilityFetcher {
    async fn fetch(&self, url: &Url) -> Result<RelayInformation> {
        let info_url = Self::information_url(url)?;

        let resp = self
            .client
            .get(info_url)
            .header(ACCEPT, NOSTR_JSON)
            .send()
            .await
            .map_err(|e| MonitorError::capability(url.as_str(), e))?;

        if !resp.status().is_success() {
            return Err(MonitorError::capability(
                url.as_str(),
                format!("HTTP {}", resp.status()),
            ));
        }

        resp.json::<RelayInformation>()
            .await
            .map_err(|e| MonitorError::capability(url.as_str(), e))
    }
}
