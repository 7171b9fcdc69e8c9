//! Job requests collected at build time and turned into parsed jobs.
//!
//! Interval requests are grouped by their exact duration so each distinct
//! interval is parsed once and shared by every job that asked for it. A zero
//! or negative interval means "run once at startup". Every schedule is parsed
//! before any listener is opened; the first invalid one aborts the build.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;

use crate::jobs::{Job, JobContext, JobFn, Schedule, ScheduleError, ScheduleSpec};

/// How often a requested job should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    Interval(chrono::Duration),
    Cron(String),
}

#[derive(Clone)]
struct JobRequest {
    name: String,
    cadence: Cadence,
    func: JobFn,
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("name", &self.name)
            .field("cadence", &self.cadence)
            .finish()
    }
}

/// An ordered set of job requests awaiting validation.
#[derive(Debug, Clone, Default)]
pub struct JobPlan {
    requests: Vec<JobRequest>,
}

impl JobPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a job every `interval`. Zero or negative runs once at startup.
    pub fn every<F, Fut>(&mut self, interval: chrono::Duration, name: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(name, Cadence::Interval(interval), boxed(f));
    }

    /// Request a job on a cron expression.
    pub fn cron<F, Fut>(&mut self, expression: impl Into<String>, name: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(name, Cadence::Cron(expression.into()), boxed(f));
    }

    pub fn push(&mut self, name: impl Into<String>, cadence: Cadence, func: JobFn) {
        self.requests.push(JobRequest {
            name: name.into(),
            cadence,
            func,
        });
    }

    /// Move every request of `other` to the end of this plan.
    pub fn absorb(&mut self, other: &mut JobPlan) {
        self.requests.append(&mut other.requests);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Parse every schedule and produce jobs in request order.
    pub fn build(&self) -> Result<Vec<Job>, ScheduleError> {
        let mut intervals: HashMap<chrono::Duration, Schedule> = HashMap::new();
        let mut jobs = Vec::with_capacity(self.requests.len());

        for request in &self.requests {
            let schedule = match &request.cadence {
                Cadence::Interval(interval) if *interval <= chrono::Duration::zero() => {
                    Schedule::once()
                }
                Cadence::Interval(interval) => match intervals.get(interval) {
                    Some(schedule) => schedule.clone(),
                    None => {
                        // positive, so the conversion cannot fail
                        let std_interval = interval.to_std().unwrap_or_default();
                        let schedule = ScheduleSpec::fixed_interval(std_interval).parse()?;
                        intervals.insert(*interval, schedule.clone());
                        schedule
                    }
                },
                Cadence::Cron(expression) => ScheduleSpec::cron(expression.as_str()).parse()?,
            };
            jobs.push(Job::from_fn(request.name.clone(), schedule, request.func.clone()));
        }

        Ok(jobs)
    }
}

fn boxed<F, Fut>(f: F) -> JobFn
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}
