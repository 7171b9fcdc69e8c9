//! Leader election for replicated services.
//!
//! Leadership itself is decided by an external elector reached over a local
//! unix socket. This module holds the client contract, the gRPC client, a mock
//! for development, the leadership tracker, and the scheduler that runs
//! leader-only jobs while this replica leads.
//!
//! The one rule every piece follows: when in doubt, this replica is **not**
//! the leader. Any error from the elector reads as "not leader".

mod client;
mod gated;
mod mock;
mod tracker;

pub use client::{GrpcElector, LeaderRequest, LeaderResponse, GET_LEADER_PATH};
pub use gated::LeadershipGatedScheduler;
pub use mock::MockElector;
pub use tracker::{LeaderElectionState, LeadershipTracker, Transition};

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{is_production_like, ElectionConfig};
use crate::error::{LifecycleError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors talking to, or configuring, a leader elector.
#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("failed to connect to leader elector at {socket}: {source}")]
    Connect {
        socket: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("timed out after {timeout:?} connecting to leader elector at {socket}")]
    ConnectTimeout { socket: PathBuf, timeout: Duration },

    #[error("leader election RPC failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("leader election RPC timed out after {0:?}")]
    Timeout(Duration),

    #[error("leader elector is closed")]
    Closed,

    #[error("invalid mock elector spec {0:?}: expected a boolean or a duration")]
    InvalidMockSpec(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Answer from the elector.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LeaderStatus {
    /// Identity of the current leader, as reported by the elector.
    pub id: String,
    /// Whether this replica is the leader.
    pub is_lead: bool,
}

/// Client for an external leader elector.
#[async_trait]
pub trait LeaderElectionClient: Send + Sync + 'static {
    /// Ask the elector who leads. Errors are returned as-is.
    async fn get_lead(&self) -> std::result::Result<LeaderStatus, ElectionError>;

    /// Whether this replica leads. Any error is reported as `false`.
    async fn is_lead(&self) -> bool {
        match self.get_lead().await {
            Ok(status) => status.is_lead,
            Err(e) => {
                debug!(error = %e, "Leader election query failed, assuming follower");
                false
            }
        }
    }

    /// Release the underlying connection or background task.
    async fn close(&self) -> std::result::Result<(), ElectionError>;
}

/// Resolve the elector configured for this process.
///
/// A mock spec wins over a socket path but is refused in production-like
/// environments. With neither configured, `leader_jobs > 0` is a setup error.
pub async fn elector_from_config(
    config: &ElectionConfig,
    environment: &str,
    leader_jobs: usize,
) -> Result<Option<Arc<dyn LeaderElectionClient>>> {
    if let Some(spec) = &config.mock {
        if is_production_like(environment) {
            return Err(LifecycleError::MockElectorForbidden {
                environment: environment.to_string(),
            });
        }
        info!(spec = %spec, "Using mock leader elector");
        return Ok(Some(Arc::new(MockElector::from_spec(spec)?)));
    }

    if let Some(socket) = &config.socket_path {
        let elector =
            GrpcElector::connect(socket, config.connect_timeout, config.request_timeout).await?;
        return Ok(Some(Arc::new(elector)));
    }

    if leader_jobs > 0 {
        return Err(LifecycleError::MissingElector { jobs: leader_jobs });
    }

    Ok(None)
}
