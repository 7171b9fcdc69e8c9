//! Shutdown triggers.
//!
//! The first trigger starts a graceful shutdown, a second one forces it. OS
//! signals are the usual source; channels let embedders and tests drive the
//! same path.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A source of shutdown requests.
#[async_trait]
pub trait ShutdownTrigger: Send + 'static {
    /// Wait for the next request. `None` means no further requests can arrive.
    async fn next_signal(&mut self) -> Option<&'static str>;
}

/// SIGINT and, where supported, SIGTERM. Both can fire repeatedly.
pub struct OsSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl OsSignals {
    /// Install the signal handlers.
    pub fn new() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }
}

#[async_trait]
impl ShutdownTrigger for OsSignals {
    async fn next_signal(&mut self) -> Option<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                received = self.interrupt.recv() => received.map(|_| "SIGINT"),
                received = self.terminate.recv() => received.map(|_| "SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok().map(|_| "CTRL_C")
        }
    }
}

#[async_trait]
impl ShutdownTrigger for mpsc::Receiver<()> {
    async fn next_signal(&mut self) -> Option<&'static str> {
        self.recv().await.map(|_| "channel")
    }
}

#[async_trait]
impl ShutdownTrigger for mpsc::UnboundedReceiver<()> {
    async fn next_signal(&mut self) -> Option<&'static str> {
        self.recv().await.map(|_| "channel")
    }
}

/// Next request, or never once the trigger is exhausted.
pub(crate) async fn next_or_never<T: ShutdownTrigger + ?Sized>(trigger: &mut T) -> &'static str {
    match trigger.next_signal().await {
        Some(signal) => signal,
        None => std::future::pending().await,
    }
}
