//! Error types for the relay monitor.

use thiserror::Error;

/// Errors raised by the measurement-tagging-publish pipeline.
///
/// Only `MalformedAddress` and `InvalidConfig` are fatal, and only at startup.
/// Everything else is scoped to a single tick, event or destination.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Endpoint address could not be parsed or normalized
    #[error("Malformed address '{address}': {reason}")]
    MalformedAddress { address: String, reason: String },

    /// Relay information document could not be fetched or decoded
    #[error("Capability fetch failed for {url}: {reason}")]
    CapabilityFetchFailed { url: String, reason: String },

    /// Latency probe did not complete
    #[error("Measurement failed for {url}: {reason}")]
    MeasurementFailed { url: String, reason: String },

    /// Event could not be signed
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// Destination relay could not be reached
    #[error("Destination unreachable {url}: {reason}")]
    DestinationUnreachable { url: String, reason: String },

    /// Destination relay refused the event
    #[error("Publish rejected by {url}: {reason}")]
    PublishRejected { url: String, reason: String },

    /// Configuration is missing or inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MonitorError {
    /// Build a `MalformedAddress` error.
    pub fn malformed(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedAddress {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a `MeasurementFailed` error.
    pub fn measurement(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::MeasurementFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a `DestinationUnreachable` error.
    pub fn unreachable(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::DestinationUnreachable {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a `PublishRejected` error.
    pub fn rejected(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::PublishRejected {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a `CapabilityFetchFailed` error.
    pub fn capability(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::CapabilityFetchFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        MonitorError::SigningFailed(format!("event serialization: {}", err))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, MonitorError>;
