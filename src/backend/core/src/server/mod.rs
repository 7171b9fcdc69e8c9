//! Server lifecycle.
//!
//! A [`ServerBuilder`] collects HTTP routes, gRPC services, init and cleanup
//! functions and jobs; [`ServerBuilder::build`] validates all of it without
//! opening a socket. The resulting [`ServerNode`]s form a tree with a single
//! lead that owns the singleton duties.
//!
//! # Startup
//!
//! 1. Every node binds its HTTP and gRPC listeners and starts serving.
//! 2. The lead starts the per-replica crontab and, if configured, the debug
//!    endpoint.
//! 3. Init groups run concurrently; each service turns `SERVING` when its
//!    group succeeds. Any failure is fatal.
//! 4. Once every group succeeded the overall health entry turns `SERVING` and
//!    the leader-only jobs start polling the elector.
//!
//! # Shutdown
//!
//! ```text
//! signal ─▶ cancel duties ─▶ health NOT_SERVING ─▶ drain gRPC + HTTP (window)
//!        ─▶ force-close open connections ─▶ stop sub-servers
//!        ─▶ wait for duties ─▶ cleanup groups
//! second signal or deadline ─▶ every remaining wait is cut short
//! ```

mod builder;
mod debug;
mod groups;
mod listener;
mod node;
mod shutdown;

pub use builder::ServerBuilder;
pub use groups::{FunctionGroups, LifecycleFn, Phase};
pub use node::ServerNode;
pub use shutdown::{OsSignals, ShutdownTrigger};
