//! Health reporting
//!
//! One [`HealthRegistry`] per server tree tracks the serving status of every
//! named service plus the overall `""` entry. It is exposed two ways: the
//! standard `grpc.health.v1.Health` service on the gRPC listener, and
//! Kubernetes-style probes (`/healthz`, `/readyz`, `/livez`) on the HTTP one.

mod registry;
mod routes;

pub use registry::{HealthRegistry, ServingStatus, DEFAULT_SERVICE};
pub use routes::*;
