//! Server tree lifecycle.
//!
//! A tree of [`ServerNode`]s has exactly one lead once it starts. The lead
//! owns the singleton duties of the whole tree: the per-replica crontab, the
//! leader-only jobs with their elector, the debug endpoint and the tree-wide
//! init phase. Every node serves its own HTTP and gRPC listeners and reports
//! into the lead's health registry.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Routes;
use tonic::transport::Server;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};

use crate::config::Config;
use crate::election::{LeaderElectionClient, LeadershipGatedScheduler, LeadershipTracker};
use crate::error::{LifecycleError, Result};
use crate::health::{health_routes, HealthRegistry};
use crate::jobs::{CronEngine, Job, JobTable};

use super::builder::GrpcRegistration;
use super::debug::{debug_routes, DebugState};
use super::groups::FunctionGroups;
use super::listener::{closable_incoming, serve_router};
use super::shutdown::{next_or_never, OsSignals, ShutdownTrigger};

/// Name under which per-replica jobs report.
const CRONTAB_ENGINE: &str = "crontab";

/// How long force-closed connections get to unwind before the task is aborted.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Work that runs once per tree, on the lead node.
#[derive(Default)]
pub(crate) struct SingletonDuties {
    pub crontab: Vec<Job>,
    pub leader_jobs: Vec<Job>,
    pub elector: Option<Arc<dyn LeaderElectionClient>>,
    pub debug_addr: Option<SocketAddr>,
}

impl SingletonDuties {
    /// Take over `other`'s jobs. Our own elector and debug address win.
    fn merge(&mut self, other: SingletonDuties) {
        self.crontab.extend(other.crontab);
        self.leader_jobs.extend(other.leader_jobs);
        if self.elector.is_none() {
            self.elector = other.elector;
        }
        if self.debug_addr.is_none() {
            self.debug_addr = other.debug_addr;
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.leader_jobs.is_empty() && self.elector.is_none() {
            return Err(LifecycleError::MissingElector {
                jobs: self.leader_jobs.len(),
            });
        }
        Ok(())
    }
}

/// State every node of a tree shares with its lead.
#[derive(Clone, Default)]
struct Shared {
    health: HealthRegistry,
    jobs: JobTable,
    tracker: LeadershipTracker,
}

struct Served {
    addr: SocketAddr,
    stop: CancellationToken,
    kill: CancellationToken,
    handle: JoinHandle<()>,
}

impl Served {
    /// Close whatever is still open and wait for the listener task to end.
    async fn force_close(&mut self) {
        self.kill.cancel();
        if self.handle.is_finished() {
            return;
        }
        if tokio::time::timeout(FORCE_CLOSE_GRACE, &mut self.handle).await.is_err() {
            self.handle.abort();
        }
    }
}

struct Running {
    root: CancellationToken,
    http: Served,
    grpc: Served,
    debug: Option<Served>,
    background: JoinSet<()>,
    /// Held by the tree root so [`ServerNode::wait`] only returns once stopped.
    keepalive: Option<mpsc::UnboundedSender<LifecycleError>>,
}

/// One server in a tree, built by [`super::ServerBuilder`].
pub struct ServerNode {
    name: String,
    config: Config,
    router: Option<Router>,
    grpc: Vec<GrpcRegistration>,
    init: FunctionGroups,
    cleanup: FunctionGroups,
    duties: SingletonDuties,
    is_lead: bool,
    shared: Shared,
    children: Vec<ServerNode>,
    started: bool,
    running: Option<Running>,
    fatal: Option<mpsc::UnboundedReceiver<LifecycleError>>,
}

impl ServerNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        config: Config,
        router: Router,
        grpc: Vec<GrpcRegistration>,
        init: FunctionGroups,
        cleanup: FunctionGroups,
        duties: SingletonDuties,
        is_lead: bool,
    ) -> Self {
        Self {
            name,
            config,
            router: Some(router),
            grpc,
            init,
            cleanup,
            duties,
            is_lead,
            shared: Shared::default(),
            children: Vec::new(),
            started: false,
            running: None,
            fatal: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this node carries the tree's singleton duties.
    pub fn is_lead(&self) -> bool {
        self.is_lead
    }

    /// The registry shared by the whole tree once attached.
    pub fn health(&self) -> &HealthRegistry {
        &self.shared.health
    }

    pub fn leadership(&self) -> &LeadershipTracker {
        &self.shared.tracker
    }

    pub fn job_table(&self) -> &JobTable {
        &self.shared.jobs
    }

    pub fn children(&self) -> &[ServerNode] {
        &self.children
    }

    /// Bound HTTP address while running.
    pub fn local_http_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.http.addr)
    }

    /// Bound gRPC address while running.
    pub fn local_grpc_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.grpc.addr)
    }

    /// Bound debug address while running, lead only.
    pub fn local_debug_addr(&self) -> Option<SocketAddr> {
        self.running
            .as_ref()
            .and_then(|running| running.debug.as_ref())
            .map(|debug| debug.addr)
    }

    fn has_lead(&self) -> bool {
        self.is_lead || self.children.iter().any(ServerNode::has_lead)
    }

    fn visit(&self, f: &mut dyn FnMut(&ServerNode)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }

    fn visit_mut(&mut self, f: &mut dyn FnMut(&mut ServerNode)) {
        f(self);
        for child in &mut self.children {
            child.visit_mut(f);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tree assembly
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach `child` below this node.
    ///
    /// A child sub-tree that carries a lead takes over the singleton duties
    /// of this tree's lead; otherwise this tree's lead absorbs the child's.
    /// Either way every node ends up reporting into the lead's registry.
    ///
    /// # Errors
    ///
    /// Fails when either side already started, or when the merged leader-only
    /// jobs have no elector.
    pub fn attach(&mut self, child: ServerNode) -> Result<()> {
        if self.started || child.started {
            return Err(LifecycleError::configuration(format!(
                "server {:?} must be attached to {:?} before either starts",
                child.name, self.name
            )));
        }

        if child.has_lead() {
            self.visit_mut(&mut |node| node.is_lead = false);
        }
        info!(parent = %self.name, child = %child.name, "Server attached");
        self.children.push(child);

        if self.has_lead() {
            self.consolidate()?;
        }
        Ok(())
    }

    /// Move every non-lead node's duties to the lead and share its state.
    fn consolidate(&mut self) -> Result<()> {
        let mut pooled = SingletonDuties::default();
        self.visit_mut(&mut |node| {
            if !node.is_lead {
                pooled.merge(std::mem::take(&mut node.duties));
            }
        });

        let mut outcome = Ok(());
        let mut shared = None;
        self.visit_mut(&mut |node| {
            if node.is_lead {
                node.duties.merge(std::mem::take(&mut pooled));
                outcome = node.duties.validate();
                shared = Some(node.shared.clone());
            }
        });
        outcome?;

        if let Some(shared) = shared {
            self.visit_mut(&mut |node| node.shared = shared.clone());
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Start
    // ─────────────────────────────────────────────────────────────────────────

    /// Bind and serve every node of the tree and launch the lead's duties.
    ///
    /// A tree without a lead promotes this node. If any node fails to start,
    /// everything already started is stopped again before returning.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(LifecycleError::configuration(format!(
                "server {:?} was already started",
                self.name
            )));
        }
        if !self.has_lead() {
            info!(server = %self.name, "No lead in server tree, promoting root");
            self.is_lead = true;
            self.consolidate()?;
        }

        let mut init = FunctionGroups::new();
        self.visit(&mut |node| init.extend(&node.init));
        let mut init = Some(init);

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        self.fatal = Some(fatal_rx);

        if let Err(e) = self.start_node(&fatal_tx, &mut init).await {
            e.log();
            if let Err(stop_error) = self.stop(CancellationToken::new()).await {
                stop_error.log();
            }
            return Err(e);
        }

        if let Some(running) = self.running.as_mut() {
            running.keepalive = Some(fatal_tx);
        }
        Ok(())
    }

    fn start_node<'a>(
        &'a mut self,
        fatal: &'a mpsc::UnboundedSender<LifecycleError>,
        init: &'a mut Option<FunctionGroups>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            self.started = true;

            let (http_listener, http_addr) = bind("HTTP", self.config.server.http_addr).await?;
            let (grpc_listener, grpc_addr) = bind("gRPC", self.config.server.grpc_addr).await?;
            let debug_listener = match self.duties.debug_addr {
                Some(addr) if self.is_lead => Some(bind("debug", addr).await?),
                _ => None,
            };

            let health = self.shared.health.clone();
            if self.is_lead {
                health.prepare(self.config.lifecycle.wait_for_ready).await;
            }

            let router = self
                .router
                .take()
                .unwrap_or_default()
                .merge(health_routes(health.clone()));
            let http = serve_http(&self.name, "http", http_listener, http_addr, router);

            let mut routes = health.grpc_routes();
            for register in self.grpc.drain(..) {
                routes = register(routes);
            }
            let grpc = serve_grpc(&self.name, grpc_listener, grpc_addr, routes, fatal);

            let debug = debug_listener.map(|(listener, addr)| {
                let state = DebugState {
                    health: health.clone(),
                    tracker: self.shared.tracker.clone(),
                    jobs: self.shared.jobs.clone(),
                    elector: self.duties.elector.clone(),
                };
                serve_http(&self.name, "debug", listener, addr, debug_routes(state))
            });

            let root = CancellationToken::new();
            let mut background = JoinSet::new();
            if self.is_lead {
                self.spawn_duties(&mut background, &root, fatal, init.take().unwrap_or_default());
            }

            info!(
                server = %self.name,
                http = %http_addr,
                grpc = %grpc_addr,
                lead = self.is_lead,
                "Server started"
            );
            self.running = Some(Running {
                root,
                http,
                grpc,
                debug,
                background,
                keepalive: None,
            });

            for child in &mut self.children {
                child.start_node(fatal, init).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Crontab, init and, once init succeeds, the leader-only jobs.
    fn spawn_duties(
        &self,
        background: &mut JoinSet<()>,
        root: &CancellationToken,
        fatal: &mpsc::UnboundedSender<LifecycleError>,
        init: FunctionGroups,
    ) {
        let shared = self.shared.clone();

        if !self.duties.crontab.is_empty() {
            let engine = CronEngine::new(CRONTAB_ENGINE, self.duties.crontab.clone())
                .with_health(shared.health.clone())
                .with_leadership(shared.tracker.clone())
                .with_table(shared.jobs.clone());
            let cancel = root.child_token();
            background.spawn(
                async move {
                    match engine.run(cancel).await {
                        Ok(()) => info!("Crontab jobs all retired"),
                        Err(e) if e.is_cancellation() => {}
                        Err(e) => e.log(),
                    }
                }
                .instrument(info_span!("crontab", server = %self.name)),
            );
        }

        let gated = match &self.duties.elector {
            Some(elector) if !self.duties.leader_jobs.is_empty() => Some(
                LeadershipGatedScheduler::new(elector.clone(), self.duties.leader_jobs.clone())
                    .with_poll_interval(self.config.election.poll_interval)
                    .with_tracker(shared.tracker.clone())
                    .with_health(shared.health.clone())
                    .with_table(shared.jobs.clone()),
            ),
            _ => None,
        };

        let timeout = self.config.lifecycle.init_timeout;
        let health = shared.health;
        let root = root.clone();
        let fatal = fatal.clone();
        background.spawn(
            async move {
                match init.run_init(timeout, &health, &root).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancellation() => return,
                    Err(e) => {
                        report(&fatal, e);
                        return;
                    }
                }

                health.mark_ready().await;
                if let Some(gated) = gated {
                    if let Err(e) = gated.run(root).await {
                        e.log();
                    }
                }
            }
            .instrument(info_span!("init", server = %self.name)),
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Run / wait / stop
    // ─────────────────────────────────────────────────────────────────────────

    /// First fatal error from anywhere in the tree; `Ok(())` once the tree
    /// has fully stopped without one.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(fatal) = self.fatal.as_mut() else {
            return Err(LifecycleError::configuration(format!(
                "server {:?} has not been started",
                self.name
            )));
        };
        match fatal.recv().await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Start, serve until SIGINT/SIGTERM or a fatal error, then stop.
    pub async fn run(self) -> Result<()> {
        let signals = OsSignals::new()?;
        self.run_until(signals).await
    }

    /// [`ServerNode::run`] with an injectable shutdown trigger.
    ///
    /// The first trigger begins a graceful stop bounded by the graceful
    /// shutdown timeout; a second trigger before that cuts it short. A fatal
    /// error takes precedence over any error from stopping.
    pub async fn run_until<T: ShutdownTrigger>(mut self, mut trigger: T) -> Result<()> {
        self.start().await?;

        let fatal = tokio::select! {
            signal = next_or_never(&mut trigger) => {
                info!(server = %self.name, signal, "Shutdown signal received");
                None
            }
            outcome = self.wait() => outcome.err(),
        };

        let shutdown = CancellationToken::new();
        let deadline = self.config.lifecycle.graceful_shutdown_timeout;
        let force = {
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    signal = next_or_never(&mut trigger) => {
                        warn!(signal, "Second signal received, forcing shutdown");
                    }
                    _ = tokio::time::sleep(deadline) => {
                        warn!(?deadline, "Graceful shutdown deadline exceeded, forcing shutdown");
                    }
                }
                shutdown.cancel();
            }
        };

        let mut stop = self.stop(shutdown.clone());
        let stopped = tokio::select! {
            stopped = &mut stop => stopped,
            _ = force => stop.await,
        };

        match fatal {
            Some(e) => {
                if let Err(stop_error) = stopped {
                    stop_error.log();
                }
                Err(e)
            }
            None => stopped,
        }
    }

    /// Stop the tree. Idempotent.
    ///
    /// Listeners drain first, bounded by the drain window, then sub-servers
    /// stop, background duties wind down and finally cleanup runs. Canceling
    /// `shutdown` cuts every remaining wait short.
    pub fn stop(&mut self, shutdown: CancellationToken) -> BoxFuture<'_, Result<()>> {
        async move {
            let Some(mut running) = self.running.take() else {
                return Ok(());
            };
            info!(server = %self.name, "Stopping server");

            running.root.cancel();
            self.shared.health.shutdown().await;

            running.grpc.stop.cancel();
            running.http.stop.cancel();
            if let Some(debug) = &running.debug {
                debug.stop.cancel();
            }

            let window = self.config.lifecycle.drain_window;
            let drained = {
                let listeners = async {
                    let _ = (&mut running.grpc.handle).await;
                    let _ = (&mut running.http.handle).await;
                    if let Some(debug) = running.debug.as_mut() {
                        let _ = (&mut debug.handle).await;
                    }
                };
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => false,
                    joined = tokio::time::timeout(window, listeners) => joined.is_ok(),
                }
            };
            if !drained {
                warn!(server = %self.name, ?window, "Listeners did not drain, closing them");
            }
            running.grpc.force_close().await;
            running.http.force_close().await;
            if let Some(debug) = running.debug.as_mut() {
                debug.force_close().await;
            }

            let mut errors: Vec<LifecycleError> = future::join_all(
                self.children
                    .iter_mut()
                    .map(|child| child.stop(shutdown.clone())),
            )
            .await
            .into_iter()
            .filter_map(|stopped| stopped.err())
            .collect();

            {
                let background = async {
                    while running.background.join_next().await.is_some() {}
                };
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        warn!(server = %self.name, "Shutdown forced before background tasks finished");
                    }
                    _ = background => {}
                }
            }
            running.background.shutdown().await;

            let cleanup = self
                .cleanup
                .run_cleanup(self.config.lifecycle.cleanup_timeout, &shutdown)
                .await;
            if let Err(e) = cleanup {
                errors.push(e);
            }

            if self.is_lead {
                if let Some(elector) = &self.duties.elector {
                    if let Err(e) = elector.close().await {
                        errors.push(e.into());
                    }
                }
            }

            drop(running);
            info!(server = %self.name, errors = errors.len(), "Server stopped");
            combine(errors)
        }
        .boxed()
    }
}

impl fmt::Debug for ServerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerNode")
            .field("name", &self.name)
            .field("is_lead", &self.is_lead)
            .field("running", &self.running.is_some())
            .field("children", &self.children)
            .finish()
    }
}

fn combine(errors: Vec<LifecycleError>) -> Result<()> {
    let mut flat = Vec::new();
    for error in errors {
        match error {
            LifecycleError::Cleanup(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    if flat.len() > 1 {
        return Err(LifecycleError::Cleanup(flat));
    }
    flat.pop().map_or(Ok(()), Err)
}

fn report(fatal: &mpsc::UnboundedSender<LifecycleError>, error: LifecycleError) {
    error.log();
    let _ = fatal.send(error);
}

async fn bind(what: &'static str, addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    let bind_error = |source| LifecycleError::Bind {
        what,
        addr: addr.to_string(),
        source,
    };
    let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
    let local = listener.local_addr().map_err(bind_error)?;
    Ok((listener, local))
}

fn serve_http(
    server: &str,
    kind: &'static str,
    listener: TcpListener,
    addr: SocketAddr,
    router: Router,
) -> Served {
    let stop = CancellationToken::new();
    let kill = CancellationToken::new();
    let span = info_span!("http_server", server = %server, kind, %addr);

    let router = router.layer(TraceLayer::new_for_http());
    let (shutdown, closing) = (stop.clone(), kill.clone());

    let handle = tokio::spawn(
        async move {
            info!("Listening");
            serve_router(listener, router, shutdown, closing).await;
            info!("Listener closed");
        }
        .instrument(span),
    );

    Served { addr, stop, kill, handle }
}

fn serve_grpc(
    server: &str,
    listener: TcpListener,
    addr: SocketAddr,
    routes: Routes,
    fatal: &mpsc::UnboundedSender<LifecycleError>,
) -> Served {
    let stop = CancellationToken::new();
    let kill = CancellationToken::new();
    let shutdown = stop.clone();
    let incoming = closable_incoming(listener, kill.clone());
    let fatal = fatal.clone();
    let span = info_span!("grpc_server", server = %server, %addr);

    let handle = tokio::spawn(
        async move {
            info!("Listening");
            let served = Server::builder()
                .add_routes(routes)
                .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                .await;
            match served {
                Ok(()) => info!("Listener closed"),
                Err(e) => report(&fatal, LifecycleError::Transport(e)),
            }
        }
        .instrument(span),
    );

    Served { addr, stop, kill, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::MockElector;
    use crate::server::ServerBuilder;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn loopback() -> Config {
        let mut config = Config::default();
        config.server.http_addr = "127.0.0.1:0".parse().unwrap();
        config.server.grpc_addr = "127.0.0.1:0".parse().unwrap();
        config.lifecycle.drain_window = Duration::from_secs(1);
        config
    }

    async fn noop(_ctx: crate::jobs::JobContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn wait_ready(health: &HealthRegistry) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !health.is_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server never became ready");
    }

    #[tokio::test]
    async fn test_child_lead_takes_over_duties() {
        let mut parent = ServerBuilder::new("parent", &loopback())
            .every(chrono::Duration::minutes(1), "parent-tick", noop)
            .build()
            .await
            .unwrap();
        let child = ServerBuilder::new("child", &loopback())
            .elector(Arc::new(MockElector::fixed(true)))
            .leader_every(chrono::Duration::minutes(5), "report", noop)
            .build()
            .await
            .unwrap();

        parent.attach(child).unwrap();

        assert!(!parent.is_lead());
        assert!(parent.duties.crontab.is_empty());
        let child = &parent.children()[0];
        assert!(child.is_lead());
        assert_eq!(child.duties.crontab.len(), 1);
        assert_eq!(child.duties.leader_jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_parent_lead_absorbs_sub_server() {
        let mut parent = ServerBuilder::new("parent", &loopback())
            .elector(Arc::new(MockElector::fixed(false)))
            .build()
            .await
            .unwrap();
        let child = ServerBuilder::new("worker", &loopback())
            .every(chrono::Duration::seconds(30), "sweep", noop)
            .leader_cron("0 * * * *", "rollup", noop)
            .sub_server()
            .build()
            .await
            .unwrap();

        parent.attach(child).unwrap();

        assert!(parent.is_lead());
        assert_eq!(parent.duties.crontab.len(), 1);
        assert_eq!(parent.duties.leader_jobs.len(), 1);
        assert!(parent.children()[0].duties.crontab.is_empty());
    }

    #[tokio::test]
    async fn test_attach_requires_elector_for_leader_jobs() {
        let mut parent = ServerBuilder::new("parent", &loopback()).build().await.unwrap();
        let child = ServerBuilder::new("worker", &loopback())
            .leader_every(chrono::Duration::minutes(1), "rollup", noop)
            .sub_server()
            .build()
            .await
            .unwrap();

        let attached = parent.attach(child);
        assert!(matches!(attached, Err(LifecycleError::MissingElector { jobs: 1 })));
    }

    #[tokio::test]
    async fn test_tree_shares_one_registry() {
        let mut parent = ServerBuilder::new("parent", &loopback()).build().await.unwrap();
        let child = ServerBuilder::new("worker", &loopback())
            .sub_server()
            .build()
            .await
            .unwrap();
        parent.attach(child).unwrap();

        parent.children()[0].health().set_serving("queue").await;
        assert!(parent.health().status("queue").is_some());
    }

    #[tokio::test]
    async fn test_start_and_stop_round() {
        let mut node = ServerBuilder::new("api", &loopback()).build().await.unwrap();
        node.start().await.unwrap();

        let http = node.local_http_addr().unwrap();
        assert_ne!(http.port(), 0);
        assert!(node.local_grpc_addr().is_some());
        assert!(node.local_debug_addr().is_none());
        wait_ready(node.health()).await;

        node.stop(CancellationToken::new()).await.unwrap();
        assert!(node.health().is_shutting_down());
        assert!(node.local_http_addr().is_none());

        node.stop(CancellationToken::new()).await.unwrap();
        assert!(node.wait().await.is_ok());
        assert!(node.start().await.is_err());
    }

    #[tokio::test]
    async fn test_start_promotes_root_of_leaderless_tree() {
        let mut node = ServerBuilder::new("worker", &loopback())
            .sub_server()
            .build()
            .await
            .unwrap();
        assert!(!node.is_lead());

        node.start().await.unwrap();
        assert!(node.is_lead());
        node.stop(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_start() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = loopback();
        config.server.http_addr = taken.local_addr().unwrap();

        let mut node = ServerBuilder::new("api", &config).build().await.unwrap();
        let started = node.start().await;
        assert!(matches!(started, Err(LifecycleError::Bind { what: "HTTP", .. })));
        assert!(node.local_grpc_addr().is_none());
    }

    #[tokio::test]
    async fn test_init_failure_is_fatal() {
        let mut node = ServerBuilder::new("api", &loopback())
            .init("db", "connect", |_token| async { anyhow::bail!("connection refused") })
            .build()
            .await
            .unwrap();
        node.start().await.unwrap();

        let fatal = node.wait().await;
        assert!(matches!(fatal, Err(LifecycleError::Init { ref service, .. }) if service == "db"));
        assert!(!node.health().is_ready());

        node.stop(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_shutdown_begins() {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let observed = shutting_down.clone();
        let mut node = ServerBuilder::new("api", &loopback())
            .build()
            .await
            .unwrap();
        node.cleanup = {
            let mut cleanup = FunctionGroups::new();
            let health = node.health().clone();
            cleanup.add("db", "close", move |_token| {
                let health = health.clone();
                let observed = observed.clone();
                async move {
                    observed.store(health.is_shutting_down(), Ordering::SeqCst);
                    anyhow::bail!("pool already closed")
                }
            });
            cleanup
        };

        node.start().await.unwrap();
        let stopped = node.stop(CancellationToken::new()).await;

        assert!(shutting_down.load(Ordering::SeqCst));
        assert!(matches!(
            stopped,
            Err(LifecycleError::CleanupFunction { ref service, .. }) if service == "db"
        ));
    }
}
