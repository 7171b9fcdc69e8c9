//! Cron engine: runs a fixed set of jobs against a clock.
//!
//! A single scheduling loop owns every job's next fire time. It sleeps until
//! the earliest one, launches every job that is due at that tick as its own
//! task, reschedules them, and goes back to sleep. Job bodies never block the
//! loop and a failing job never stops its siblings.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::election::LeadershipTracker;
use crate::error::{LifecycleError, Result};
use crate::health::HealthRegistry;
use crate::jobs::{Clock, Job, JobContext, JobInfo, JobTable};
use crate::telemetry::LifecycleMetrics;

/// Reschedule a job that fired at `tick`.
///
/// `None` retires the job. A next fire time that is not strictly after the
/// tick is pushed to one second past it, so no job fires more than once per
/// second whatever its schedule says.
pub(crate) fn advance(next: Option<DateTime<Utc>>, tick: DateTime<Utc>) -> Option<DateTime<Utc>> {
    next.map(|at| {
        if at <= tick {
            tick + chrono::Duration::seconds(1)
        } else {
            at
        }
    })
}

struct Entry {
    job: Job,
    name: Arc<str>,
    next: Option<DateTime<Utc>>,
    runs: u64,
}

impl Entry {
    fn info(&self) -> JobInfo {
        JobInfo {
            name: self.name.to_string(),
            schedule: self.job.schedule().to_string(),
            next_fire: self.next,
            runs: self.runs,
        }
    }
}

/// Runs a fixed set of named jobs until they all retire or it is canceled.
pub struct CronEngine {
    name: Arc<str>,
    jobs: Vec<Job>,
    clock: Option<Clock>,
    health: HealthRegistry,
    leadership: Option<LeadershipTracker>,
    table: Option<JobTable>,
}

impl CronEngine {
    pub fn new(name: impl Into<String>, jobs: Vec<Job>) -> Self {
        Self {
            name: Arc::from(name.into()),
            jobs,
            clock: None,
            health: HealthRegistry::new(),
            leadership: None,
            table: None,
        }
    }

    /// Use a specific clock instead of the system clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Health registry handed to jobs through their context.
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    /// Leadership view handed to jobs through their context.
    pub fn with_leadership(mut self, tracker: LeadershipTracker) -> Self {
        self.leadership = Some(tracker);
        self
    }

    /// Publish upcoming fire times into `table` after every tick.
    pub fn with_table(mut self, table: JobTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Run the scheduling loop.
    ///
    /// Returns `Ok(())` once every job has retired and all in-flight
    /// invocations finished, and [`LifecycleError::Cancelled`] after draining
    /// in-flight invocations when `cancel` fires. Any other error means a job
    /// task could not be joined.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let clock = self.clock.unwrap_or_else(Clock::system);
        let now = clock.now();

        let mut retired = Vec::new();
        let mut entries = Vec::with_capacity(self.jobs.len());
        for job in self.jobs {
            let entry = Entry {
                name: Arc::from(job.name()),
                next: job.schedule().first(now),
                job,
                runs: 0,
            };
            if entry.next.is_some() {
                entries.push(entry);
            } else {
                retire(&self.name, &entry);
                retired.push(entry.info());
            }
        }
        entries.sort_by_key(|entry| entry.next);

        info!(engine = %self.name, jobs = entries.len(), "Cron engine started");

        let sleep = tokio::time::sleep_until(clock.deadline(now));
        tokio::pin!(sleep);
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if let Some(table) = &self.table {
                let mut rows: Vec<JobInfo> = entries.iter().map(Entry::info).collect();
                rows.extend(retired.iter().cloned());
                table.publish(&self.name, rows);
            }

            let Some(earliest) = entries.first().and_then(|entry| entry.next) else {
                info!(engine = %self.name, "All jobs retired");
                let drained = drain(&self.name, &mut tasks).await;
                if let Some(table) = &self.table {
                    table.remove(&self.name);
                }
                return drained;
            };
            sleep.as_mut().reset(clock.deadline(earliest));

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(engine = %self.name, in_flight = tasks.len(), "Cron engine stopping");
                    let drained = drain(&self.name, &mut tasks).await;
                    if let Some(table) = &self.table {
                        table.remove(&self.name);
                    }
                    drained?;
                    return Err(LifecycleError::Cancelled);
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(engine = %self.name, error = %e, "Job task failed");
                        tasks.shutdown().await;
                        return Err(LifecycleError::Join(e));
                    }
                }

                _ = &mut sleep => {
                    let tick = clock.now();
                    let mut fired = 0usize;

                    for entry in entries.iter_mut() {
                        match entry.next {
                            Some(at) if at <= tick => {}
                            _ => break,
                        }

                        let ctx = JobContext::new(
                            entry.name.clone(),
                            self.name.clone(),
                            tick,
                            cancel.clone(),
                            self.health.clone(),
                            self.leadership.clone(),
                        );
                        launch(&mut tasks, self.name.clone(), entry.job.clone(), ctx);
                        entry.runs += 1;
                        fired += 1;

                        entry.next = advance(entry.job.schedule().next(tick), tick);
                    }

                    debug!(engine = %self.name, %tick, fired, "Cron tick");

                    entries.retain(|entry| {
                        if entry.next.is_none() {
                            retire(&self.name, entry);
                            retired.push(entry.info());
                            false
                        } else {
                            true
                        }
                    });
                    entries.sort_by_key(|entry| entry.next);
                }
            }
        }
    }
}

fn retire(engine: &str, entry: &Entry) {
    info!(engine, job = %entry.name, runs = entry.runs, "Job retired");
    LifecycleMetrics::job_retired(engine, &entry.name);
}

fn launch(tasks: &mut JoinSet<()>, engine: Arc<str>, job: Job, ctx: JobContext) {
    LifecycleMetrics::job_run(&engine, job.name());

    tasks.spawn(async move {
        let name = job.name().to_string();
        let outcome = AssertUnwindSafe(async move { job.invoke(ctx).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => debug!(engine = %engine, job = %name, "Job finished"),
            Ok(Err(e)) => {
                warn!(engine = %engine, job = %name, error = %e, "Job failed");
                LifecycleMetrics::job_failure(&engine, &name);
            }
            Err(panic) => {
                let err = LifecycleError::from_panic(format!("job {:?}", name), panic);
                error!(engine = %engine, job = %name, error = %err, "Job panicked");
                LifecycleMetrics::job_failure(&engine, &name);
            }
        }
    });
}

/// Wait for every in-flight invocation.
async fn drain(engine: &str, tasks: &mut JoinSet<()>) -> Result<()> {
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(engine, error = %e, "Job task failed");
            failure.get_or_insert(e);
        }
    }
    match failure {
        Some(e) => Err(LifecycleError::Join(e)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Schedule, ScheduleSpec};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn every(secs: u64) -> Schedule {
        ScheduleSpec::fixed_interval(Duration::from_secs(secs))
            .parse()
            .unwrap()
    }

    fn recording_job(
        name: &'static str,
        schedule: Schedule,
        tx: mpsc::UnboundedSender<(&'static str, DateTime<Utc>)>,
    ) -> Job {
        Job::new(name, schedule, move |ctx| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((name, ctx.tick()));
                Ok(())
            }
        })
    }

    #[test]
    fn test_advance_guards_against_tight_loops() {
        let tick = t0();
        assert_eq!(advance(Some(tick), tick), Some(tick + chrono::Duration::seconds(1)));
        assert_eq!(
            advance(Some(tick - chrono::Duration::hours(1)), tick),
            Some(tick + chrono::Duration::seconds(1))
        );
        let later = tick + chrono::Duration::seconds(30);
        assert_eq!(advance(Some(later), tick), Some(later));
        assert_eq!(advance(None, tick), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_with_same_next_fire_are_batched() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = CronEngine::new(
            "crontab",
            vec![
                recording_job("a", every(1), tx.clone()),
                recording_job("b", every(1), tx.clone()),
            ],
        )
        .with_clock(Clock::starting_at(t0()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(LifecycleError::Cancelled)));

        drop(tx);
        let mut fired = Vec::new();
        while let Some(event) = rx.recv().await {
            fired.push(event);
        }

        assert_eq!(fired.len(), 6);
        for pair in fired.chunks(2) {
            let mut names = [pair[0].0, pair[1].0];
            names.sort_unstable();
            assert_eq!(names, ["a", "b"]);
            assert_eq!(pair[0].1, pair[1].1);
        }
        assert_eq!(fired[0].1, t0() + chrono::Duration::seconds(1));
        assert_eq!(fired[4].1, t0() + chrono::Duration::seconds(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_jobs_retire_and_engine_returns() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = CronEngine::new(
            "persistent",
            vec![
                recording_job("warmup", Schedule::once(), tx.clone()),
                recording_job("migrate", Schedule::once(), tx.clone()),
            ],
        )
        .with_clock(Clock::starting_at(t0()));

        engine.run(CancellationToken::new()).await.unwrap();
        drop(tx);

        let mut fired = Vec::new();
        while let Some(event) = rx.recv().await {
            fired.push(event);
        }
        assert_eq!(fired, vec![("warmup", t0()), ("migrate", t0())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_panicking_jobs_do_not_stop_siblings() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let engine = CronEngine::new(
            "crontab",
            vec![
                Job::new("fails", every(1), |_| async { anyhow::bail!("boom") }),
                Job::new("panics", every(1), |_| async { panic!("job body panicked") }),
                Job::new("counts", every(1), move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            ],
        )
        .with_clock(Clock::starting_at(t0()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(5500)).await;
        cancel.cancel();

        assert!(matches!(handle.await.unwrap(), Err(LifecycleError::Cancelled)));
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_in_flight_jobs() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let engine = CronEngine::new(
            "crontab",
            vec![Job::new("slow", Schedule::once(), move |_| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })],
        )
        .with_clock(Clock::starting_at(t0()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        let _ = handle.await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_observe_engine_cancellation() {
        let engine = CronEngine::new(
            "crontab",
            vec![Job::new("waits", Schedule::once(), |ctx| async move {
                ctx.cancellation().cancelled().await;
                Ok(())
            })],
        )
        .with_clock(Clock::starting_at(t0()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        // the only job retired at startup, so the engine ends cleanly once it returns
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_table_tracks_next_fire() {
        let table = JobTable::new();
        let engine = CronEngine::new("crontab", vec![Job::new("tick", every(10), |_| async { Ok(()) })])
            .with_clock(Clock::starting_at(t0()))
            .with_table(table.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(15)).await;
        let rows = table.engine("crontab").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].runs, 1);
        assert_eq!(rows[0].next_fire, Some(t0() + chrono::Duration::seconds(20)));

        cancel.cancel();
        let _ = handle.await;
        assert!(table.engine("crontab").is_none());
    }
}
