//! Server assembly.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tonic::codegen::http;
use tonic::server::NamedService;
use tonic::transport::server::Routes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::election::{elector_from_config, LeaderElectionClient};
use crate::error::Result;
use crate::jobs::{JobContext, JobPlan};

use super::groups::FunctionGroups;
use super::node::{ServerNode, SingletonDuties};

/// Deferred `Routes::add_service` for one gRPC service.
pub(crate) type GrpcRegistration = Box<dyn FnOnce(Routes) -> Routes + Send + Sync>;

/// Collects a server's traffic handlers, lifecycle functions and jobs.
///
/// Nothing is parsed or connected until [`ServerBuilder::build`]; nothing is
/// bound until [`ServerNode::start`].
///
/// ```rust,no_run
/// # async fn demo() -> keel_core::error::Result<()> {
/// use keel_core::config::Config;
/// use keel_core::server::ServerBuilder;
///
/// let node = ServerBuilder::new("api", &Config::default())
///     .init("db", "connect", |_token| async { Ok(()) })
///     .every(chrono::Duration::seconds(30), "heartbeat", |ctx| async move {
///         tracing::info!(tick = %ctx.tick(), "heartbeat");
///         Ok(())
///     })
///     .build()
///     .await?;
/// node.run().await
/// # }
/// ```
pub struct ServerBuilder {
    name: String,
    config: Config,
    router: Router,
    grpc: Vec<GrpcRegistration>,
    init: FunctionGroups,
    cleanup: FunctionGroups,
    crontab: JobPlan,
    leader_jobs: JobPlan,
    elector: Option<Arc<dyn LeaderElectionClient>>,
    sub_server: bool,
}

impl ServerBuilder {
    pub fn new(name: impl Into<String>, config: &Config) -> Self {
        Self {
            name: name.into(),
            config: config.clone(),
            router: Router::new(),
            grpc: Vec::new(),
            init: FunctionGroups::new(),
            cleanup: FunctionGroups::new(),
            crontab: JobPlan::new(),
            leader_jobs: JobPlan::new(),
            elector: None,
            sub_server: false,
        }
    }

    /// Merge HTTP routes into this server's router.
    pub fn router(mut self, router: Router) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// Serve a gRPC service next to the health service.
    pub fn grpc_service<S>(mut self, service: S) -> Self
    where
        S: tower::Service<
                http::Request<tonic::transport::Body>,
                Response = http::Response<tonic::body::BoxBody>,
                Error = Infallible,
            > + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        debug!(server = %self.name, service = S::NAME, "gRPC service registered");
        self.grpc.push(Box::new(move |routes: Routes| routes.add_service(service)));
        self
    }

    /// Add an init function to the group of `service`.
    pub fn init<F, Fut>(mut self, service: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.init.add(service, name, f);
        self
    }

    /// Add a cleanup function to the group of `service`.
    pub fn cleanup<F, Fut>(mut self, service: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.cleanup.add(service, name, f);
        self
    }

    /// Run a job on every replica at a fixed interval. A zero or negative
    /// interval runs it once at startup.
    pub fn every<F, Fut>(mut self, interval: chrono::Duration, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.crontab.every(interval, name, f);
        self
    }

    /// Run a job on every replica on a cron schedule.
    pub fn cron<F, Fut>(mut self, expression: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.crontab.cron(expression, name, f);
        self
    }

    /// Like [`ServerBuilder::every`], but only on the elected leader.
    pub fn leader_every<F, Fut>(mut self, interval: chrono::Duration, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.leader_jobs.every(interval, name, f);
        self
    }

    /// Like [`ServerBuilder::cron`], but only on the elected leader.
    pub fn leader_cron<F, Fut>(mut self, expression: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.leader_jobs.cron(expression, name, f);
        self
    }

    /// Use this elector instead of the one in the configuration.
    pub fn elector(mut self, elector: Arc<dyn LeaderElectionClient>) -> Self {
        self.elector = Some(elector);
        self
    }

    /// Build a server meant to be attached under another one. It never
    /// resolves an elector from configuration and does not lead on its own.
    pub fn sub_server(mut self) -> Self {
        self.sub_server = true;
        self
    }

    /// Parse every schedule and resolve the elector.
    ///
    /// # Errors
    ///
    /// Invalid schedules, a forbidden or unreachable elector, and leader-only
    /// jobs without an elector all fail here, before any listener exists.
    pub async fn build(self) -> Result<ServerNode> {
        let crontab = self.crontab.build()?;
        let leader_jobs = self.leader_jobs.build()?;

        let elector = match self.elector {
            Some(elector) => Some(elector),
            None if self.sub_server => None,
            None => {
                elector_from_config(
                    &self.config.election,
                    &self.config.environment,
                    leader_jobs.len(),
                )
                .await?
            }
        };

        info!(
            server = %self.name,
            crontab_jobs = crontab.len(),
            leader_jobs = leader_jobs.len(),
            init_services = ?self.init.services(),
            elector = elector.is_some(),
            "Server built"
        );

        let duties = SingletonDuties {
            crontab,
            leader_jobs,
            elector,
            debug_addr: self.config.server.debug_addr,
        };

        Ok(ServerNode::new(
            self.name,
            self.config,
            self.router,
            self.grpc,
            self.init,
            self.cleanup,
            duties,
            !self.sub_server,
        ))
    }
}
