//! Leader-only jobs.
//!
//! Polls the elector on a fixed interval and keeps at most one cron engine
//! running the leader-only job set while this replica leads. Each stretch of
//! leadership is an epoch: gaining leadership starts one engine under a child
//! token, losing it cancels that engine and waits for it to drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::election::{LeaderElectionClient, LeadershipTracker};
use crate::error::{LifecycleError, Result};
use crate::health::HealthRegistry;
use crate::jobs::{CronEngine, Job, JobTable};
use crate::telemetry::LifecycleMetrics;

/// Default elector poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Name under which leader-only engines report.
const LEADER_ENGINE: &str = "leader";

struct Epoch {
    id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

enum Gate {
    /// Not leading, no engine.
    Idle,
    /// Leading, engine running.
    Leading(Epoch),
    /// Leading, engine finished on its own; nothing restarts until the next epoch.
    Exhausted,
}

/// Runs a job set only while the elector says this replica leads.
pub struct LeadershipGatedScheduler {
    elector: Arc<dyn LeaderElectionClient>,
    jobs: Vec<Job>,
    poll_interval: Duration,
    tracker: LeadershipTracker,
    health: HealthRegistry,
    table: Option<JobTable>,
    epochs: AtomicU64,
}

impl LeadershipGatedScheduler {
    pub fn new(elector: Arc<dyn LeaderElectionClient>, jobs: Vec<Job>) -> Self {
        Self {
            elector,
            jobs,
            poll_interval: DEFAULT_POLL_INTERVAL,
            tracker: LeadershipTracker::new(),
            health: HealthRegistry::new(),
            table: None,
            epochs: AtomicU64::new(0),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Share a tracker with readers outside the scheduler.
    pub fn with_tracker(mut self, tracker: LeadershipTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_table(mut self, table: JobTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn tracker(&self) -> &LeadershipTracker {
        &self.tracker
    }

    /// Number of engines started so far.
    pub fn epochs_started(&self) -> u64 {
        self.epochs.load(Ordering::SeqCst)
    }

    /// Poll until `cancel` fires.
    ///
    /// Returns `Ok(())` after stopping any running engine once canceled. An
    /// engine that stops with anything other than a cancellation is fatal.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gate = Gate::Idle;

        info!(
            poll_interval = ?self.poll_interval,
            jobs = self.jobs.len(),
            "Leadership-gated scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.step_down(&mut gate).await?;
                    info!("Leadership-gated scheduler stopped");
                    return Ok(());
                }

                joined = engine_finished(&mut gate) => {
                    if let Gate::Leading(epoch) = std::mem::replace(&mut gate, Gate::Exhausted) {
                        match settle(joined) {
                            Ok(()) => info!(epoch = %epoch.id, "Leader-only jobs all retired"),
                            Err(e) => {
                                error!(epoch = %epoch.id, error = %e, "Leader-only engine failed");
                                return Err(e);
                            }
                        }
                    }
                }

                _ = ticker.tick() => {
                    let is_lead = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => continue,
                        lead = self.elector.is_lead() => lead,
                    };
                    self.tracker.observe(is_lead);

                    match (&gate, is_lead) {
                        (Gate::Idle, true) => gate = Gate::Leading(self.start_epoch(&cancel)),
                        (Gate::Leading(_) | Gate::Exhausted, false) => self.step_down(&mut gate).await?,
                        _ => {}
                    }
                }
            }
        }
    }

    fn start_epoch(&self, parent: &CancellationToken) -> Epoch {
        let id = Uuid::new_v4();
        let cancel = parent.child_token();

        let mut engine = CronEngine::new(LEADER_ENGINE, self.jobs.clone())
            .with_health(self.health.clone())
            .with_leadership(self.tracker.clone());
        if let Some(table) = &self.table {
            engine = engine.with_table(table.clone());
        }

        self.epochs.fetch_add(1, Ordering::SeqCst);
        LifecycleMetrics::epoch_started();
        info!(epoch = %id, jobs = self.jobs.len(), "Leadership acquired, starting leader-only jobs");

        let handle = tokio::spawn(
            engine
                .run(cancel.clone())
                .instrument(info_span!("leader_epoch", epoch = %id)),
        );

        Epoch { id, cancel, handle }
    }

    /// Cancel the running engine, if any, and wait for it to drain.
    async fn step_down(&self, gate: &mut Gate) -> Result<()> {
        match std::mem::replace(gate, Gate::Idle) {
            Gate::Leading(epoch) => {
                info!(epoch = %epoch.id, "Stopping leader-only jobs");
                epoch.cancel.cancel();
                settle(epoch.handle.await)
            }
            Gate::Idle | Gate::Exhausted => Ok(()),
        }
    }
}

/// Completes when the current epoch's engine exits; pending otherwise.
async fn engine_finished(gate: &mut Gate) -> std::result::Result<Result<()>, JoinError> {
    match gate {
        Gate::Leading(epoch) => (&mut epoch.handle).await,
        Gate::Idle | Gate::Exhausted => std::future::pending().await,
    }
}

/// Cancellation and deadline outcomes count as a clean stop.
fn settle(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.is_cancellation() => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(e) if e.is_panic() => Err(LifecycleError::from_panic("leader-only engine", e.into_panic())),
        Err(e) => Err(LifecycleError::Join(e)),
    }
}
