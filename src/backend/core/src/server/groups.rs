//! Named init and cleanup function groups.
//!
//! Functions are grouped by the service they belong to. Every function of
//! every group runs concurrently; a group completes when all of its functions
//! do, under one timeout. Init is all-or-nothing: the first failure cancels
//! every sibling and fails startup. Cleanup runs every group to the end and
//! reports all failures together.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, Result};
use crate::health::HealthRegistry;
use crate::telemetry::LifecycleMetrics;

/// Boxed init or cleanup function. The token is canceled when the function
/// should give up: its group timed out, a sibling failed, or shutdown is
/// being forced.
pub type LifecycleFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
struct NamedFn {
    name: Arc<str>,
    func: LifecycleFn,
}

#[derive(Clone)]
struct Group {
    service: Arc<str>,
    functions: Vec<NamedFn>,
}

/// Which phase a group run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Cleanup,
}

impl Phase {
    fn function_error(self, service: &str, function: &str, source: anyhow::Error) -> LifecycleError {
        let (service, function) = (service.to_string(), function.to_string());
        match self {
            Self::Init => LifecycleError::Init { service, function, source },
            Self::Cleanup => LifecycleError::CleanupFunction { service, function, source },
        }
    }

    fn timeout_error(self, service: &str, timeout: Duration) -> LifecycleError {
        let service = service.to_string();
        match self {
            Self::Init => LifecycleError::InitTimeout { service, timeout },
            Self::Cleanup => LifecycleError::CleanupTimeout { service, timeout },
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// Functions grouped by service, in registration order.
#[derive(Clone, Default)]
pub struct FunctionGroups {
    groups: Vec<Group>,
}

impl FunctionGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `f` to the group of `service`, creating the group if needed.
    pub fn add<F, Fut>(&mut self, service: impl Into<String>, name: impl Into<String>, f: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let func: LifecycleFn = Arc::new(move |token| f(token).boxed());
        self.push(service.into(), NamedFn {
            name: Arc::from(name.into()),
            func,
        });
    }

    fn push(&mut self, service: String, function: NamedFn) {
        match self.groups.iter_mut().find(|group| *group.service == *service) {
            Some(group) => group.functions.push(function),
            None => self.groups.push(Group {
                service: Arc::from(service),
                functions: vec![function],
            }),
        }
    }

    /// Append every function of `other`, merging groups with the same service.
    pub fn extend(&mut self, other: &FunctionGroups) {
        for group in &other.groups {
            for function in &group.functions {
                self.push(group.service.to_string(), function.clone());
            }
        }
    }

    pub fn services(&self) -> Vec<String> {
        self.groups.iter().map(|group| group.service.to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Run every init group; each service turns `SERVING` as soon as its group succeeds.
    pub async fn run_init(
        &self,
        timeout: Duration,
        health: &HealthRegistry,
        parent: &CancellationToken,
    ) -> Result<()> {
        if self.groups.is_empty() {
            debug!("No init groups registered");
            return Ok(());
        }

        for group in &self.groups {
            health.register(&group.service).await;
        }

        let cancel = parent.child_token();
        let mut groups = JoinSet::new();
        for group in self.groups.iter().cloned() {
            let token = cancel.child_token();
            let health = health.clone();
            let aborted = cancel.clone();
            groups.spawn(async move {
                let started = Instant::now();
                run_group(Phase::Init, &group, timeout, token).await?;
                if aborted.is_cancelled() {
                    return Err(LifecycleError::Cancelled);
                }
                LifecycleMetrics::init_group_finished(&group.service, started.elapsed());
                info!(service = %group.service, elapsed = ?started.elapsed(), "Init group complete");
                health.set_serving(&group.service).await;
                Ok::<(), LifecycleError>(())
            });
        }

        let mut failure = None;
        while let Some(joined) = groups.join_next().await {
            let result = joined.map_err(LifecycleError::from).and_then(|r| r);
            if let Err(e) = result {
                if failure.is_none() {
                    // first failure decides; the rest are fallout from canceling
                    cancel.cancel();
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None if parent.is_cancelled() => Err(LifecycleError::Cancelled),
            None => Ok(()),
        }
    }

    /// Run every cleanup group to completion and aggregate their failures.
    pub async fn run_cleanup(&self, timeout: Duration, shutdown: &CancellationToken) -> Result<()> {
        let mut groups = JoinSet::new();
        for group in self.groups.iter().cloned() {
            let token = shutdown.child_token();
            groups.spawn(async move {
                let result = run_group(Phase::Cleanup, &group, timeout, token).await;
                if result.is_err() {
                    LifecycleMetrics::cleanup_failed(&group.service);
                } else {
                    info!(service = %group.service, "Cleanup group complete");
                }
                result
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = groups.join_next().await {
            if let Err(e) = joined.map_err(LifecycleError::from).and_then(|r| r) {
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Cleanup(failures))
        }
    }
}

impl fmt::Debug for FunctionGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for group in &self.groups {
            let names: Vec<&str> = group.functions.iter().map(|n| &*n.name).collect();
            map.entry(&group.service, &names);
        }
        map.finish()
    }
}

/// Run one group's functions concurrently under `timeout`.
async fn run_group(
    phase: Phase,
    group: &Group,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut functions = JoinSet::new();
    for function in group.functions.iter().cloned() {
        let token = cancel.clone();
        let service = group.service.clone();
        functions.spawn(async move {
            let outcome = AssertUnwindSafe(async { (function.func)(token).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(phase.function_error(&service, &function.name, source)),
                Err(panic) => Err(LifecycleError::from_panic(
                    format!("{} function {:?} of service {:?}", phase, function.name, service),
                    panic,
                )),
            }
        });
    }

    let all = async {
        let mut failure = None;
        while let Some(joined) = functions.join_next().await {
            if let Err(e) = joined.map_err(LifecycleError::from).and_then(|r| r) {
                warn!(phase = %phase, service = %group.service, error = %e, "Function failed");
                if failure.is_none() {
                    if phase == Phase::Init {
                        cancel.cancel();
                    }
                    failure = Some(e);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    };

    // init waits for its functions to honor cancellation; cleanup can be cut short
    let result = tokio::select! {
        biased;
        outcome = tokio::time::timeout(timeout, all) => match outcome {
            Ok(result) => result,
            Err(_) => Err(phase.timeout_error(&group.service, timeout)),
        },
        _ = cancel.cancelled(), if phase == Phase::Cleanup => Err(LifecycleError::Cancelled),
    };

    // abort whatever is still running
    cancel.cancel();
    functions.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ServingStatus, DEFAULT_SERVICE};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_groups_merge_by_service() {
        let mut groups = FunctionGroups::new();
        groups.add("db", "migrate", |_| async { Ok(()) });
        groups.add("cache", "warm", |_| async { Ok(()) });
        groups.add("db", "seed", |_| async { Ok(()) });
        assert_eq!(groups.services(), vec!["db", "cache"]);

        let mut other = FunctionGroups::new();
        other.add("cache", "connect", |_| async { Ok(()) });
        other.add("search", "index", |_| async { Ok(()) });
        groups.extend(&other);
        assert_eq!(groups.services(), vec!["db", "cache", "search"]);
        assert_eq!(format!("{:?}", groups).matches("connect").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_marks_each_group_serving() {
        let mut groups = FunctionGroups::new();
        groups.add("db", "connect", |_| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        });
        groups.add("db", "migrate", |_| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        });
        groups.add("cache", "warm", |_| async { Ok(()) });

        let health = HealthRegistry::new();
        groups
            .run_init(Duration::from_secs(5), &health, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(health.status("db"), Some(ServingStatus::Serving));
        assert_eq!(health.status("cache"), Some(ServingStatus::Serving));
        assert_eq!(health.status(DEFAULT_SERVICE), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_cancels_siblings() {
        let sibling_cancelled = Arc::new(AtomicBool::new(false));
        let flag = sibling_cancelled.clone();

        let mut groups = FunctionGroups::new();
        groups.add("db", "connect", |_| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        });
        groups.add("cache", "connect", |_| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            anyhow::bail!("connection refused")
        });
        groups.add("search", "index", move |token: CancellationToken| {
            let flag = flag.clone();
            async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        let health = HealthRegistry::new();
        let started = tokio::time::Instant::now();
        let err = groups
            .run_init(Duration::from_secs(5), &health, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(&err, LifecycleError::Init { service, .. } if service == "cache"));
        assert!(err.to_string().contains("connection refused"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sibling_cancelled.load(Ordering::SeqCst));
        assert_ne!(health.status("search"), Some(ServingStatus::Serving));
        assert!(!health.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_timeout() {
        let mut groups = FunctionGroups::new();
        groups.add("db", "connect", |_| std::future::pending::<anyhow::Result<()>>());

        let err = groups
            .run_init(Duration::from_secs(5), &HealthRegistry::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InitTimeout { .. }));
    }

    #[tokio::test]
    async fn test_init_panic_is_an_error() {
        let mut groups = FunctionGroups::new();
        groups.add("db", "connect", |_| async { panic!("driver exploded") });

        let err = groups
            .run_init(Duration::from_secs(5), &HealthRegistry::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Panicked { .. }));
        assert!(err.to_string().contains("driver exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_runs_every_group_and_aggregates() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut groups = FunctionGroups::new();
        for service in ["db", "cache", "queue"] {
            let ran = ran.clone();
            groups.add(service, "close", move |_| {
                let ran = ran.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        groups.add("cache", "flush", |_| async { anyhow::bail!("flush failed") });
        groups.add("queue", "drain", |_| std::future::pending::<anyhow::Result<()>>());

        let err = groups
            .run_cleanup(Duration::from_secs(3), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(ran.load(Ordering::SeqCst), 3);
        match err {
            LifecycleError::Cleanup(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures
                    .iter()
                    .any(|e| matches!(e, LifecycleError::CleanupTimeout { service, .. } if service == "queue")));
                assert!(failures
                    .iter()
                    .any(|e| matches!(e, LifecycleError::CleanupFunction { service, .. } if service == "cache")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_cut_short_by_shutdown_token() {
        let mut groups = FunctionGroups::new();
        groups.add("db", "close", |_| std::future::pending::<anyhow::Result<()>>());

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = groups
            .run_cleanup(Duration::from_secs(30), &shutdown)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.to_string().contains("cancelled"));
    }
}
