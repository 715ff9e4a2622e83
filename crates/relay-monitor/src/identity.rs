//! Endpoint identity normalization.
//!
//! Every metric event for a relay is addressable by its `d` tag, so the value
//! placed there must be stable across case, default-port and trailing-slash
//! variations of the same address. `normalize_url` produces that canonical
//! form and `Endpoint` carries it alongside the raw input.

use crate::error::{MonitorError, Result};
use crate::geo::GeoPoint;
use std::fmt;
use url::Url;

/// Canonicalize a relay address.
///
/// Lower-cases scheme and host, strips `:80` on `ws` and `:443` on `wss`, and
/// substitutes `/` for an empty path. Query, fragment and credentials are left
/// untouched.
pub fn normalize_url(raw: &str) -> Result<String> {
    parse_normalized(raw).map(|url| url.to_string())
}

fn parse_normalized(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    let mut url = Url::parse(trimmed).map_err(|e| MonitorError::malformed(raw, e))?;

    // Url::parse already lower-cases the scheme.
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(MonitorError::malformed(
            raw,
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }

    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h.to_ascii_lowercase(),
        _ => return Err(MonitorError::malformed(raw, "missing host")),
    };
    if url.host_str() != Some(host.as_str()) {
        url.set_host(Some(&host))
            .map_err(|e| MonitorError::malformed(raw, e))?;
    }

    if matches!((url.scheme(), url.port()), ("ws", Some(80)) | ("wss", Some(443))) {
        url.set_port(None)
            .map_err(|_| MonitorError::malformed(raw, "cannot strip default port"))?;
    }

    if url.path().is_empty() {
        url.set_path("/");
    }

    Ok(url)
}

/// Network class label attached to metric events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClass {
    Clearnet,
    Tor,
    I2p,
}

impl NetworkClass {
    /// Classify a relay by its host name.
    #[must_use]
    pub fn of_host(host: &str) -> Self {
        if host.ends_with(".onion") {
            Self::Tor
        } else if host.ends_with(".i2p") {
            Self::I2p
        } else {
            Self::Clearnet
        }
    }

    /// Wire label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clearnet => "clearnet",
            Self::Tor => "tor",
            Self::I2p => "i2p",
        }
    }
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitored relay.
///
/// Created once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    raw: String,
    normalized: String,
    url: Url,
    location: GeoPoint,
}

impl Endpoint {
    /// Parse and normalize a configured relay address.
    pub fn parse(raw: &str, location: GeoPoint) -> Result<Self> {
        let url = parse_normalized(raw)?;
        Ok(Self {
            raw: raw.trim().to_string(),
            normalized: url.to_string(),
            url,
            location,
        })
    }

    /// Address as configured.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Canonical address, used as the `d` tag.
    #[must_use]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Parsed canonical address.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Relay location used for the `g` ladder.
    #[must_use]
    pub fn location(&self) -> GeoPoint {
        self.location
    }

    #[must_use]
    pub fn network_class(&self) -> NetworkClass {
        NetworkClass::of_host(self.url.host_str().unwrap_or_default())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}
