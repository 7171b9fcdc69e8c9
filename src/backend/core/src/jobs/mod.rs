//! Periodic jobs for Keel Core.
//!
//! - **Schedule**: fixed interval, five-field cron, or run-once; parsed once
//! - **Job**: a named schedule plus an async body receiving a [`JobContext`]
//! - **CronEngine**: runs a fixed set of jobs, batching those due at the same tick
//! - **JobPlan**: job requests grouped and validated at build time
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  parse   ┌──────────────┐  build   ┌──────────────┐
//! │ ScheduleSpec │─────────▶│   Schedule   │─────────▶│     Job      │
//! └──────────────┘          └──────────────┘          └──────┬───────┘
//!                                                            │
//!                            ┌──────────────┐  run     ┌──────▼───────┐
//!                            │    Clock     │─────────▶│  CronEngine  │
//!                            └──────────────┘          └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use keel_core::jobs::{CronEngine, Job, ScheduleSpec};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> keel_core::error::Result<()> {
//! let schedule = ScheduleSpec::cron("*/5 * * * *").parse()?;
//! let job = Job::new("compact", schedule, |ctx| async move {
//!     tracing::info!(tick = %ctx.tick(), "compacting");
//!     Ok(())
//! });
//!
//! let cancel = CancellationToken::new();
//! CronEngine::new("crontab", vec![job]).run(cancel).await?;
//! # Ok(())
//! # }
//! ```

mod clock;
mod engine;
mod job;
mod plan;
mod schedule;

pub use clock::Clock;
pub use engine::CronEngine;
pub use job::{Job, JobContext, JobFn, JobInfo, JobTable};
pub use plan::{Cadence, JobPlan};
pub use schedule::{Schedule, ScheduleError, ScheduleSpec};
