//! Monitor configuration.
//!
//! Options come from the command line or the environment (the variable names
//! are the ones monitor deployments already use), with an optional env file
//! loaded into the environment before parsing.

use crate::composer::ProfileMetadata;
use crate::error::{MonitorError, Result};
use crate::geo::{DEFAULT_PRECISION, GeoPoint, MAX_PRECISION};
use crate::probe::ProbeTimeouts;
use crate::publisher::WRITE_TIMEOUT;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env files tried, in order, when none is given explicitly.
pub const DEFAULT_ENV_FILES: &[&str] = &["./.monitorlizard.env", "/usr/local/etc/.monitorlizard.env"];

/// Default measurement period in seconds.
pub const DEFAULT_FREQUENCY_SECS: u64 = 10;

/// InfluxDB v2 mirror settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
}

impl InfluxConfig {
    /// Settings, if and only if every part is present and non-empty.
    #[must_use]
    pub fn from_parts(
        url: Option<String>,
        token: Option<String>,
        org: Option<String>,
        bucket: Option<String>,
        measurement: Option<String>,
    ) -> Option<Self> {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Some(Self {
            url: present(url)?,
            token: present(token)?,
            org: present(org)?,
            bucket: present(bucket)?,
            measurement: present(measurement)?,
        })
    }
}

/// Immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Relays to measure, as configured
    pub endpoints: Vec<String>,
    /// Relays events are published to
    pub destinations: Vec<String>,
    /// Hex secret key; required when anything is published
    pub private_key: Option<String>,
    /// Tick period of every endpoint loop
    pub frequency: Duration,
    /// Height of the `g` ladders
    pub geo_precision: usize,
    pub monitor_location: GeoPoint,
    /// Location attached to every measured relay
    pub relay_location: GeoPoint,
    pub country_code: Option<String>,
    pub profile: ProfileMetadata,
    /// Publish profile and relay list at startup
    pub publish_profile: bool,
    /// Publish the monitor registration at startup
    pub publish_registration: bool,
    /// Publish a metric event on every tick
    pub publish_metrics: bool,
    pub influx: Option<InfluxConfig>,
    pub timeouts: ProbeTimeouts,
    pub write_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            destinations: Vec::new(),
            private_key: None,
            frequency: Duration::from_secs(DEFAULT_FREQUENCY_SECS),
            geo_precision: DEFAULT_PRECISION,
            monitor_location: GeoPoint::default(),
            relay_location: GeoPoint::default(),
            country_code: None,
            profile: ProfileMetadata::default(),
            publish_profile: false,
            publish_registration: false,
            publish_metrics: false,
            influx: None,
            timeouts: ProbeTimeouts::default(),
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

impl MonitorConfig {
    /// Whether any event is ever published.
    #[must_use]
    pub fn publishing_enabled(&self) -> bool {
        self.publish_profile || self.publish_registration || self.publish_metrics
    }

    /// Reject configurations the monitor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(MonitorError::InvalidConfig(
                "no relays to monitor (set RELAY_URLS or pass URLs as arguments)".to_string(),
            ));
        }
        if self.frequency.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "MONITOR_FREQUENCY must be at least one second".to_string(),
            ));
        }
        if !(1..=MAX_PRECISION).contains(&self.geo_precision) {
            return Err(MonitorError::InvalidConfig(format!(
                "geohash precision must be between 1 and {}",
                MAX_PRECISION
            )));
        }
        for (name, point) in [
            ("monitor", self.monitor_location),
            ("relay", self.relay_location),
        ] {
            if !point.is_valid() {
                return Err(MonitorError::InvalidConfig(format!(
                    "{} location out of range: {}, {}",
                    name, point.latitude, point.longitude
                )));
            }
        }
        if self.publishing_enabled() {
            if self.destinations.is_empty() {
                return Err(MonitorError::InvalidConfig(
                    "publishing enabled but NOSTR_PUBLISH_RELAY_METRICS is empty".to_string(),
                ));
            }
            if self.private_key.as_deref().is_none_or(str::is_empty) {
                return Err(MonitorError::InvalidConfig(
                    "publishing enabled but NOSTR_PRIVATE_KEY is not set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Monitor options, from flags or environment variables.
#[derive(Debug, Clone, Args)]
pub struct MonitorArgs {
    /// Relays to monitor, in addition to RELAY_URLS
    #[arg(value_name = "URL")]
    pub relays: Vec<String>,

    /// Comma-separated relays to monitor
    #[arg(long, env = "RELAY_URLS")]
    pub relay_urls: Option<String>,

    /// Comma-separated relays events are published to
    #[arg(long, env = "NOSTR_PUBLISH_RELAY_METRICS")]
    pub publish_relays: Option<String>,

    /// Hex-encoded secret key events are signed with
    #[arg(long, env = "NOSTR_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Publish a metric event on every measurement
    #[arg(long, env = "NOSTR_PUBLISH", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = false, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub publish: bool,

    /// Publish profile and relay list at startup
    #[arg(long, env = "NOSTR_PUBLISH_MONITOR_PROFILE", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = false, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub publish_profile: bool,

    /// Publish the monitor registration at startup [default: same as --publish-profile]
    #[arg(long, env = "NOSTR_PUBLISH_MONITOR_REGISTRATION", num_args = 0..=1,
          default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub publish_registration: Option<bool>,

    /// Seconds between measurements
    #[arg(long, env = "MONITOR_FREQUENCY", default_value_t = DEFAULT_FREQUENCY_SECS)]
    pub frequency: u64,

    /// Longest geohash in the `g` tag ladders
    #[arg(long, env = "MONITOR_GEOHASH_PRECISION", default_value_t = DEFAULT_PRECISION)]
    pub geo_precision: usize,

    /// Monitor display name [default: host name]
    #[arg(long, env = "MONITOR_NAME")]
    pub monitor_name: Option<String>,

    #[arg(long, env = "MONITOR_ABOUT", default_value = "")]
    pub monitor_about: String,

    #[arg(long, env = "MONITOR_PICTURE", default_value = "")]
    pub monitor_picture: String,

    /// ISO 3166 country code of the monitor
    #[arg(long, env = "MONITOR_COUNTRY_CODE")]
    pub monitor_country_code: Option<String>,

    #[arg(long, env = "MONITOR_LATITUDE", default_value_t = 0.0, allow_negative_numbers = true)]
    pub monitor_latitude: f64,

    #[arg(long, env = "MONITOR_LONGITUDE", default_value_t = 0.0, allow_negative_numbers = true)]
    pub monitor_longitude: f64,

    #[arg(long, env = "RELAY_LATITUDE", default_value_t = 0.0, allow_negative_numbers = true)]
    pub relay_latitude: f64,

    #[arg(long, env = "RELAY_LONGITUDE", default_value_t = 0.0, allow_negative_numbers = true)]
    pub relay_longitude: f64,

    #[arg(long, env = "INFLUXDB_URL")]
    pub influx_url: Option<String>,

    #[arg(long, env = "INFLUXDB_TOKEN", hide_env_values = true)]
    pub influx_token: Option<String>,

    #[arg(long, env = "INFLUXDB_ORG")]
    pub influx_org: Option<String>,

    #[arg(long, env = "INFLUXDB_BUCKET")]
    pub influx_bucket: Option<String>,

    #[arg(long, env = "INFLUXDB_MEASUREMENT")]
    pub influx_measurement: Option<String>,
}

impl MonitorArgs {
    /// Build the runtime configuration. Does not validate.
    #[must_use]
    pub fn into_config(self) -> MonitorConfig {
        let mut endpoints: Vec<String> = self
            .relays
            .iter()
            .flat_map(|r| split_list(r))
            .collect();
        endpoints.extend(self.relay_urls.as_deref().map(split_list).unwrap_or_default());

        let name = self
            .monitor_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(default_monitor_name);

        MonitorConfig {
            endpoints,
            destinations: self
                .publish_relays
                .as_deref()
                .map(split_list)
                .unwrap_or_default(),
            private_key: self.private_key.filter(|k| !k.trim().is_empty()),
            frequency: Duration::from_secs(self.frequency),
            geo_precision: self.geo_precision,
            monitor_location: GeoPoint::new(self.monitor_latitude, self.monitor_longitude),
            relay_location: GeoPoint::new(self.relay_latitude, self.relay_longitude),
            country_code: self.monitor_country_code.filter(|c| !c.trim().is_empty()),
            profile: ProfileMetadata {
                name,
                about: self.monitor_about,
                picture: self.monitor_picture,
            },
            publish_profile: self.publish_profile,
            publish_registration: self.publish_registration.unwrap_or(self.publish_profile),
            publish_metrics: self.publish,
            influx: InfluxConfig::from_parts(
                self.influx_url,
                self.influx_token,
                self.influx_org,
                self.influx_bucket,
                self.influx_measurement,
            ),
            ..MonitorConfig::default()
        }
    }
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
#[must_use]
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn default_monitor_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "relay-monitor".to_string())
}

/// First existing file among `candidates`.
#[must_use]
pub fn locate_env_file<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|p| p.as_ref())
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
}

/// Value of `--env-file` in raw process arguments.
///
/// Needed before the parser runs, since the file feeds the environment the
/// parser reads.
#[must_use]
pub fn env_file_arg<I, S>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let arg = arg.as_ref();
        if arg == "--env-file" {
            return args.next().map(|p| PathBuf::from(p.as_ref()));
        }
        if let Some(path) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}
