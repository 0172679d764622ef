//! Standard health-checking service, `grpc.health.v1.Health`, served by
//! `tonic-health`.
//!
//! The reporter keeps its own copy of every status so the current state can
//! be read synchronously; updates are forwarded to the served reporter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tonic_health::pb::health_server::{Health, HealthServer};

pub use tonic_health::ServingStatus;

/// Fully qualified name of the health service.
pub const SERVICE: &str = "grpc.health.v1.Health";

/// Handle for updating the statuses reported by the health service.
///
/// The empty service name stands for the server as a whole.
#[derive(Clone)]
pub struct HealthReporter {
    reporter: tonic_health::server::HealthReporter,
    statuses: Arc<Mutex<HashMap<String, ServingStatus>>>,
}

impl HealthReporter {
    /// A reporter and the service answering `Check` and `Watch` from it.
    ///
    /// The server as a whole is recorded `NOT_SERVING` until [`publish`]
    /// pushes that to the service.
    ///
    /// [`publish`]: HealthReporter::publish
    pub fn new() -> (Self, HealthServer<impl Health>) {
        let (reporter, service) = tonic_health::server::health_reporter();
        let statuses = HashMap::from([(String::new(), ServingStatus::NotServing)]);
        let health = Self {
            reporter,
            statuses: Arc::new(Mutex::new(statuses)),
        };
        (health, service)
    }

    fn statuses(&self) -> MutexGuard<'_, HashMap<String, ServingStatus>> {
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn set_status(&self, service: &str, status: ServingStatus) {
        self.statuses().insert(service.to_string(), status);
        self.reporter.set_service_status(service, status).await;
    }

    pub async fn set_serving(&self, service: &str) {
        self.set_status(service, ServingStatus::Serving).await;
    }

    pub async fn set_not_serving(&self, service: &str) {
        self.set_status(service, ServingStatus::NotServing).await;
    }

    /// Current status of `service`, `None` if it was never registered.
    pub fn status(&self, service: &str) -> Option<ServingStatus> {
        self.statuses().get(service).copied()
    }

    /// Push every recorded status to the service.
    pub async fn publish(&self) {
        let snapshot: Vec<(String, ServingStatus)> = self
            .statuses()
            .iter()
            .map(|(name, status)| (name.clone(), *status))
            .collect();
        for (name, status) in snapshot {
            self.reporter.set_service_status(&name, status).await;
        }
    }

    /// Mark every service `NOT_SERVING` and end all open watches.
    ///
    /// Watches end because their status channels are replaced; later checks
    /// still answer `NOT_SERVING`.
    pub async fn shutdown(&self) {
        let names: Vec<String> = {
            let mut statuses = self.statuses();
            for status in statuses.values_mut() {
                *status = ServingStatus::NotServing;
            }
            statuses.keys().cloned().collect()
        };
        let mut reporter = self.reporter.clone();
        for name in &names {
            reporter.clear_service_status(name).await;
            reporter
                .set_service_status(name, ServingStatus::NotServing)
                .await;
        }
    }
}

impl std::fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthReporter")
            .field("statuses", &*self.statuses())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_starts_not_serving() {
        let (health, _service) = HealthReporter::new();
        assert_eq!(health.status(""), Some(ServingStatus::NotServing));
        health.publish().await;
        health.set_serving("store").await;
        assert_eq!(health.status("store"), Some(ServingStatus::Serving));
        assert_eq!(health.status("missing"), None);
    }

    #[tokio::test]
    async fn shutdown_marks_everything_not_serving() {
        let (health, _service) = HealthReporter::new();
        health.set_serving("").await;
        health.set_serving("store").await;

        health.shutdown().await;
        assert_eq!(health.status(""), Some(ServingStatus::NotServing));
        assert_eq!(health.status("store"), Some(ServingStatus::NotServing));
    }
}
