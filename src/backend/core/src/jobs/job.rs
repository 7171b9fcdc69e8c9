//! Job definitions and the context handed to each invocation.
//!
//! - **Job**: a named, parsed [`Schedule`] plus an async function
//! - **JobContext**: immutable per-invocation context (tick time, cancellation,
//!   readiness reporting, leadership view)
//! - **JobTable**: shared snapshot of every engine's upcoming fire times

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::election::LeadershipTracker;
use crate::health::HealthRegistry;
use crate::jobs::Schedule;

/// Boxed job body.
pub type JobFn = Arc<dyn Fn(JobContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A named unit of periodic work. Cheap to clone; the body is shared.
#[derive(Clone)]
pub struct Job {
    name: String,
    schedule: Schedule,
    func: JobFn,
}

impl Job {
    /// Create a job from an async closure.
    ///
    /// ```rust
    /// use keel_core::jobs::{Job, ScheduleSpec};
    /// use std::time::Duration;
    ///
    /// let schedule = ScheduleSpec::fixed_interval(Duration::from_secs(30)).parse().unwrap();
    /// let job = Job::new("heartbeat", schedule, |ctx| async move {
    ///     tracing::info!(tick = %ctx.tick(), "beat");
    ///     Ok(())
    /// });
    /// assert_eq!(job.name(), "heartbeat");
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, schedule: Schedule, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_fn(name, schedule, Arc::new(move |ctx| f(ctx).boxed()))
    }

    /// Create a job from an already boxed body.
    pub fn from_fn(name: impl Into<String>, schedule: Schedule, func: JobFn) -> Self {
        Self {
            name: name.into(),
            schedule,
            func,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub(crate) fn invoke(&self, ctx: JobContext) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.func)(ctx)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("schedule", &self.schedule.to_string())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a job invocation.
#[derive(Clone)]
pub struct JobContext {
    job: Arc<str>,
    engine: Arc<str>,
    tick: DateTime<Utc>,
    cancel: CancellationToken,
    health: HealthRegistry,
    leadership: Option<LeadershipTracker>,
}

impl JobContext {
    pub(crate) fn new(
        job: Arc<str>,
        engine: Arc<str>,
        tick: DateTime<Utc>,
        cancel: CancellationToken,
        health: HealthRegistry,
        leadership: Option<LeadershipTracker>,
    ) -> Self {
        Self {
            job,
            engine,
            tick,
            cancel,
            health,
            leadership,
        }
    }

    /// Name of the job being run.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Name of the engine that launched this invocation.
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Scheduled time of the tick that fired this invocation.
    pub fn tick(&self) -> DateTime<Utc> {
        self.tick
    }

    /// Canceled when the engine running this job stops.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Readiness reporting for the server tree this job belongs to.
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Leadership view; `None` for engines that are not leadership-gated.
    pub fn leadership(&self) -> Option<&LeadershipTracker> {
        self.leadership.as_ref()
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.job)
            .field("engine", &self.engine)
            .field("tick", &self.tick)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Table
// ═══════════════════════════════════════════════════════════════════════════════

/// One row of the job table.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobInfo {
    pub name: String,
    pub schedule: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub runs: u64,
}

/// Upcoming fire times per engine, written by engines and read by the debug endpoint.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    engines: Arc<RwLock<BTreeMap<String, Vec<JobInfo>>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, engine: &str, jobs: Vec<JobInfo>) {
        self.engines.write().insert(engine.to_string(), jobs);
    }

    pub(crate) fn remove(&self, engine: &str) {
        self.engines.write().remove(engine);
    }

    pub fn engine(&self, engine: &str) -> Option<Vec<JobInfo>> {
        self.engines.read().get(engine).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<JobInfo>> {
        self.engines.read().clone()
    }
}
