#![allow(clippy::result_large_err)]
//! # Keel Core
//!
//! Process lifecycle and leader-gated cron for replicated services.
//!
//! ## Architecture
//!
//! - **Jobs**: parsed schedules and a cron engine that batches jobs due at the same tick
//! - **Election**: leader elector client over a unix socket, a mock, and a
//!   scheduler that runs leader-only jobs while this replica leads
//! - **Health**: per-service serving status over gRPC health and HTTP probes
//! - **Server**: builder, server tree, init/cleanup groups and graceful shutdown
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **Config**: layered configuration from files and `KEEL__*` environment variables

pub mod config;
pub mod election;
pub mod error;
pub mod health;
pub mod jobs;
pub mod server;
pub mod telemetry;

pub use error::{ErrorCode, LifecycleError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::election::{
        LeaderElectionClient, LeaderStatus, LeadershipGatedScheduler, LeadershipTracker,
        MockElector,
    };
    pub use crate::error::{ErrorCode, LifecycleError, Result};
    pub use crate::health::{HealthRegistry, ServingStatus};
    pub use crate::jobs::{CronEngine, Job, JobContext, Schedule, ScheduleSpec};
    pub use crate::server::{ServerBuilder, ServerNode, ShutdownTrigger};
}
