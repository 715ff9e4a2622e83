//! One-time announcements made before any measurement loop starts.
//!
//! Failures here are logged and reported but never stop the monitor.

use crate::composer::{EventComposer, ProfileMetadata, RegistrationParams};
use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::publisher::Publisher;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Which announcements to make, and their content.
#[derive(Debug, Clone)]
pub struct StartupPlan {
    /// Profile and relay list
    pub publish_profile: bool,
    pub publish_registration: bool,
    pub profile: ProfileMetadata,
    pub registration: RegistrationParams,
}

impl StartupPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.publish_profile && !self.publish_registration
    }
}

/// Publish the announcements in `plan`, in order: profile, relay list,
/// registration.
///
/// Returns one result per attempted announcement.
pub async fn announce(
    composer: &EventComposer,
    publisher: &Publisher,
    plan: &StartupPlan,
    at: DateTime<Utc>,
) -> Vec<(EventKind, Result<()>)> {
    let mut results = Vec::new();

    if plan.publish_profile {
        let profile = composer.profile(&plan.profile, at);
        results.push((EventKind::Profile, send(publisher, EventKind::Profile, profile).await));

        let relay_list = composer.relay_list(publisher.destinations(), at);
        results.push((
            EventKind::RelayList,
            send(publisher, EventKind::RelayList, relay_list).await,
        ));
    }

    if plan.publish_registration {
        let registration = composer.registration(&plan.registration, at);
        results.push((
            EventKind::MonitorRegistration,
            send(publisher, EventKind::MonitorRegistration, registration).await,
        ));
    }

    results
}

async fn send(publisher: &Publisher, kind: EventKind, event: Result<Event>) -> Result<()> {
    let event = match event {
        Ok(event) => event,
        Err(e) => {
            warn!(kind = kind.number(), "Could not build announcement: {}", e);
            return Err(e);
        }
    };

    let result = publisher.publish(&event).await.into_result();
    match &result {
        Ok(()) => info!(kind = kind.number(), id = %event.id, "Announcement published"),
        Err(e) => warn!(kind = kind.number(), "Announcement not accepted everywhere: {}", e),
    }
    result
}
