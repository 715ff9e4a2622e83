//! Saorsa Relay Monitor
//!
//! Periodically probes Nostr relays, measures connection-open and round-trip
//! latency phase by phase, and publishes each measurement as a signed,
//! addressable event (kind 30166) to a set of destination relays. Raw phase
//! timings can additionally be mirrored to InfluxDB.
//!
//! - **Per-relay loops**: one independent, supervised timer per monitored relay
//! - **Stable identity**: metric events are addressed by the normalized relay URL
//! - **Best-effort fan-out**: a failing destination never blocks the others
//! - **Startup announcements**: profile, relay list and monitor registration
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              Scheduler                                   │
//! │   ┌────────────────┐   ┌────────────────┐          ┌────────────────┐    │
//! │   │ EndpointLoop A │   │ EndpointLoop B │   ...    │ EndpointLoop N │    │
//! │   └───────┬────────┘   └────────────────┘          └────────────────┘    │
//! └───────────┼──────────────────────────────────────────────────────────────┘
//!             │ tick
//!             ▼
//!      LatencyProbe ──► PhaseTimings ──┬──► MetricsMirror ──► InfluxWriter
//!                                      │
//!                                      ▼
//!   base TagSet (capabilities) ──► EventComposer ──► EventSigner
//!                                      │
//!                                      ▼
//!                                  Publisher ──► destination relays
//! ```
//!
//! Every external effect sits behind a trait (`LatencyProbe`,
//! `CapabilityFetcher`, `EventSigner`, `RelayConnector`, `MetricsSink`), so the
//! pipeline can be driven entirely in memory.

pub mod capabilities;
pub mod composer;
pub mod config;
pub mod error;
pub mod event;
pub mod geo;
pub mod identity;
pub mod logging;
pub mod mirror;
pub mod monitor;
pub mod probe;
pub mod publisher;
pub mod scheduler;
pub mod startup;
pub mod tags;

#[cfg(test)]
mod test_support;

pub use capabilities::{CapabilityFetcher, HttpCapabilityFetcher, RelayInformation, capability_tags};
pub use composer::{EventComposer, ProfileMetadata, RegistrationParams};
pub use config::{InfluxConfig, MonitorArgs, MonitorConfig};
pub use error::{MonitorError, Result};
pub use event::{Event, EventKind, EventSigner, KeypairSigner, UnsignedEvent};
pub use geo::GeoPoint;
pub use identity::{Endpoint, NetworkClass, normalize_url};
pub use mirror::{InfluxWriter, MetricPoint, MetricsMirror, MetricsSink};
pub use monitor::{Collaborators, Monitor};
pub use probe::{LatencyProbe, PhaseTimings, ProbeTimeouts, WebSocketProbe};
pub use publisher::{PublishOutcome, Publisher, RelayConnector, RelaySession, WebSocketConnector};
pub use scheduler::{CycleOutcome, EndpointLoop, Scheduler};
pub use tags::{Tag, TagSet};
