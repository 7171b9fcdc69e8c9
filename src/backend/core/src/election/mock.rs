//! Mock elector for local development.
//!
//! Configured with a single string: a boolean literal gives fixed leadership,
//! a duration (`"30s"`, `"2m"`) gives leadership that starts held and flips
//! every period, which exercises hand-off paths without a real elector.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ElectionError, LeaderElectionClient, LeaderStatus};

const MOCK_LEADER_ID: &str = "mock";

/// Leader elector that never talks to anything.
pub struct MockElector {
    lead: Arc<RwLock<bool>>,
    period: Option<Duration>,
    stop: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl MockElector {
    /// Leadership that never changes.
    pub fn fixed(lead: bool) -> Self {
        Self {
            lead: Arc::new(RwLock::new(lead)),
            period: None,
            stop: CancellationToken::new(),
            ticker: Mutex::new(None),
        }
    }

    /// Leadership that starts held and flips every `period`.
    ///
    /// Spawns the ticker task, so it must be called inside a Tokio runtime.
    pub fn toggling(period: Duration) -> Result<Self, ElectionError> {
        if period.is_zero() {
            return Err(ElectionError::InvalidMockSpec(
                humantime::format_duration(period).to_string(),
            ));
        }

        let lead = Arc::new(RwLock::new(true));
        let stop = CancellationToken::new();

        let state = lead.clone();
        let cancelled = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut lead = state.write();
                        *lead = !*lead;
                        debug!(lead = *lead, "Mock leadership flipped");
                    }
                }
            }
        });

        Ok(Self {
            lead,
            period: Some(period),
            stop,
            ticker: Mutex::new(Some(handle)),
        })
    }

    /// Build from a config string: a boolean literal or a duration.
    pub fn from_spec(spec: &str) -> Result<Self, ElectionError> {
        let spec = spec.trim();
        if let Some(lead) = parse_bool(spec) {
            info!(lead, "Mock elector with fixed leadership");
            return Ok(Self::fixed(lead));
        }

        let period = humantime::parse_duration(spec)
            .map_err(|_| ElectionError::InvalidMockSpec(spec.to_string()))?;
        info!(period = %humantime::format_duration(period), "Mock elector with toggling leadership");
        Self::toggling(period)
    }

    /// Flip period; `None` for fixed leadership.
    pub fn period(&self) -> Option<Duration> {
        self.period
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl LeaderElectionClient for MockElector {
    async fn get_lead(&self) -> Result<LeaderStatus, ElectionError> {
        Ok(LeaderStatus {
            id: MOCK_LEADER_ID.to_string(),
            is_lead: *self.lead.read(),
        })
    }

    async fn close(&self) -> Result<(), ElectionError> {
        self.stop.cancel();
        let handle = self.ticker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            debug!("Mock elector ticker stopped");
        }
        Ok(())
    }
}

impl Drop for MockElector {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
