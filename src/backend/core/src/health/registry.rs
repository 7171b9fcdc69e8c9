//! Per-service serving status shared by a server tree.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tonic::transport::server::Routes;
use tonic_health::server::HealthReporter;
use tracing::{debug, info};

/// Name of the overall entry; probes that name no service read this one.
pub const DEFAULT_SERVICE: &str = "";

/// Serving status of one named service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    NotServing,
    Serving,
}

impl ServingStatus {
    fn to_grpc(self) -> tonic_health::ServingStatus {
        match self {
            Self::NotServing => tonic_health::ServingStatus::NotServing,
            Self::Serving => tonic_health::ServingStatus::Serving,
        }
    }
}

impl fmt::Display for ServingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotServing => f.write_str("NOT_SERVING"),
            Self::Serving => f.write_str("SERVING"),
        }
    }
}

/// Every write holds `reporter` for its whole duration, covering the map,
/// the shutdown flag and the gRPC mirror. `statuses` and `shutting_down`
/// are only locked separately so reads stay synchronous.
struct Inner {
    statuses: RwLock<BTreeMap<String, ServingStatus>>,
    shutting_down: AtomicBool,
    reporter: tokio::sync::Mutex<HealthReporter>,
    routes: Mutex<Routes>,
    started_at: Instant,
}

/// Health registry for a server tree.
///
/// Local reads are synchronous; every write is mirrored into the
/// `grpc.health.v1.Health` service returned by [`HealthRegistry::grpc_routes`].
/// Entries only move from `NOT_SERVING` to `SERVING`; the single way back is
/// [`HealthRegistry::shutdown`].
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<Inner>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        let (reporter, service) = tonic_health::server::health_reporter();
        Self {
            inner: Arc::new(Inner {
                statuses: RwLock::new(BTreeMap::new()),
                shutting_down: AtomicBool::new(false),
                reporter: tokio::sync::Mutex::new(reporter),
                routes: Mutex::new(Routes::new(service)),
                started_at: Instant::now(),
            }),
        }
    }

    /// Set up the overall entry at startup. With `wait_for_ready` it stays
    /// `NOT_SERVING` until [`HealthRegistry::mark_ready`].
    pub async fn prepare(&self, wait_for_ready: bool) {
        let status = if wait_for_ready {
            ServingStatus::NotServing
        } else {
            ServingStatus::Serving
        };
        self.write(DEFAULT_SERVICE, status).await;
    }

    /// Add a service as `NOT_SERVING` unless it is already known.
    pub async fn register(&self, service: &str) {
        let mut reporter = self.inner.reporter.lock().await;
        {
            let mut statuses = self.inner.statuses.write();
            if statuses.contains_key(service) {
                return;
            }
            statuses.insert(service.to_string(), ServingStatus::NotServing);
        }
        reporter
            .set_service_status(service, ServingStatus::NotServing.to_grpc())
            .await;
        debug!(service, "Health entry registered");
    }

    /// Mark a service `SERVING`. Ignored once shutdown has begun.
    pub async fn set_serving(&self, service: &str) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.write(service, ServingStatus::Serving).await
    }

    /// Mark the overall entry `SERVING`.
    pub async fn mark_ready(&self) -> bool {
        let ready = self.set_serving(DEFAULT_SERVICE).await;
        if ready {
            info!("Server ready");
        }
        ready
    }

    /// Flip every entry to `NOT_SERVING` and refuse further upgrades.
    pub async fn shutdown(&self) {
        let mut reporter = self.inner.reporter.lock().await;
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let services: Vec<String> = {
            let mut statuses = self.inner.statuses.write();
            statuses.entry(DEFAULT_SERVICE.to_string()).or_insert(ServingStatus::NotServing);
            for status in statuses.values_mut() {
                *status = ServingStatus::NotServing;
            }
            statuses.keys().cloned().collect()
        };
        for service in services {
            reporter
                .set_service_status(&service, ServingStatus::NotServing.to_grpc())
                .await;
        }
        info!("Health registry shutting down");
    }

    async fn write(&self, service: &str, status: ServingStatus) -> bool {
        let mut reporter = self.inner.reporter.lock().await;
        // re-checked under the writer lock so a racing shutdown wins
        if status == ServingStatus::Serving && self.is_shutting_down() {
            return false;
        }
        self.inner
            .statuses
            .write()
            .insert(service.to_string(), status);
        reporter.set_service_status(service, status.to_grpc()).await;
        debug!(service, %status, "Health entry updated");
        true
    }

    pub fn status(&self, service: &str) -> Option<ServingStatus> {
        self.inner.statuses.read().get(service).copied()
    }

    /// Whether the overall entry is `SERVING`.
    pub fn is_ready(&self) -> bool {
        self.status(DEFAULT_SERVICE) == Some(ServingStatus::Serving)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BTreeMap<String, ServingStatus> {
        self.inner.statuses.read().clone()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.inner.started_at.elapsed()
    }

    /// Routes serving `grpc.health.v1.Health` from this registry.
    pub fn grpc_routes(&self) -> Routes {
        self.inner.routes.lock().clone()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("statuses", &self.snapshot())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
