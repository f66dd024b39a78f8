//! Backend service ordering.
//!
//! `select_order` is a pure function of the selector configuration, the
//! resolved descriptor and the set of services currently considered
//! unavailable. `ServiceHealth` is where workers report those signals.

use super::models::{ServiceName, TrackDescriptor};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Inputs of the fallback policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorConfig {
    pub default_service: ServiceName,
    pub allow_fallback: bool,
    /// Static priority list the fallback candidates are taken from.
    pub fallback_order: Vec<ServiceName>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            default_service: ServiceName::Tidal,
            allow_fallback: true,
            fallback_order: ServiceName::ALL.to_vec(),
        }
    }
}

/// Computes the ordered list of services to attempt for one item.
///
/// The default service always comes first. With fallback enabled the
/// remaining services follow in `fallback_order`, minus those marked
/// unavailable and those the descriptor says do not carry the track.
pub fn select_order(
    config: &SelectorConfig,
    descriptor: &TrackDescriptor,
    unavailable: &HashSet<ServiceName>,
) -> Vec<ServiceName> {
    let mut order = vec![config.default_service];
    if !config.allow_fallback {
        return order;
    }

    for service in &config.fallback_order {
        if order.contains(service) || unavailable.contains(service) {
            continue;
        }
        if !descriptor.service_ids.is_empty() && !descriptor.service_ids.contains_key(service) {
            continue;
        }
        order.push(*service);
    }
    order
}

/// Time-bounded availability marks per service.
pub struct ServiceHealth {
    cooldown: Duration,
    unavailable_until: RwLock<HashMap<ServiceName, Instant>>,
}

impl ServiceHealth {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            unavailable_until: RwLock::new(HashMap::new()),
        }
    }

    pub fn mark_unavailable(&self, service: ServiceName) {
        if self.cooldown.is_zero() {
            return;
        }
        let until = Instant::now() + self.cooldown;
        let previous = self.unavailable_until.write().unwrap().insert(service, until);
        if previous.is_none() {
            info!(
                "Service {} marked unavailable for {}s",
                service,
                self.cooldown.as_secs()
            );
        }
    }

    pub fn mark_available(&self, service: ServiceName) {
        if self.unavailable_until.write().unwrap().remove(&service).is_some() {
            debug!("Service {} available again", service);
        }
    }

    /// Services whose unavailability mark has not expired yet.
    pub fn unavailable(&self) -> HashSet<ServiceName> {
        let now = Instant::now();
        self.unavailable_until
            .read()
            .unwrap()
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(service, _)| *service)
            .collect()
    }
}
