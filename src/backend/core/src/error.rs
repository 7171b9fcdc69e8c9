//! Error handling for Keel Core.
//!
//! This module provides:
//! - The crate-wide [`LifecycleError`] covering setup, init, cleanup and runtime failures
//! - Stable [`ErrorCode`]s used as structured logging fields
//! - Cancellation classification (the clean-stop outcomes of a canceled scope)
//! - Panic payload conversion for recovered job and lifecycle functions
//!
//! # Usage
//!
//! ```rust,ignore
//! use keel_core::error::{LifecycleError, Result};
//!
//! fn check(timeout: std::time::Duration) -> Result<()> {
//!     if timeout.is_zero() {
//!         return Err(LifecycleError::configuration("init timeout must be non-zero"));
//!     }
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::election::ElectionError;
use crate::jobs::ScheduleError;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and are emitted as the `code` field of error logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Setup Errors (1000-1099)
    InvalidSchedule,
    ConfigurationError,
    MissingElector,
    MockElectorForbidden,
    ElectorUnavailable,

    // Startup Errors (2000-2099)
    InitFailed,
    InitTimeout,
    BindFailed,

    // Runtime Errors (3000-3099)
    SchedulerFailed,
    ServerFailed,
    Panicked,

    // Shutdown Errors (4000-4099)
    CleanupFailed,
    CleanupTimeout,

    // Cancellation (5000-5099)
    Cancelled,
    DeadlineExceeded,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::InvalidSchedule => 1000,
            Self::ConfigurationError => 1001,
            Self::MissingElector => 1002,
            Self::MockElectorForbidden => 1003,
            Self::ElectorUnavailable => 1004,

            Self::InitFailed => 2000,
            Self::InitTimeout => 2001,
            Self::BindFailed => 2002,

            Self::SchedulerFailed => 3001,
            Self::ServerFailed => 3002,
            Self::Panicked => 3003,

            Self::CleanupFailed => 4000,
            Self::CleanupTimeout => 4001,

            Self::Cancelled => 5000,
            Self::DeadlineExceeded => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Get the category name for this error code.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "setup",
            2000..=2099 => "startup",
            3000..=3099 => "runtime",
            4000..=4099 => "shutdown",
            5000..=5099 => "cancellation",
            _ => "internal",
        }
    }

    /// Whether this code is fatal when it happens before serving starts.
    pub const fn is_setup(&self) -> bool {
        matches!(self.numeric_code(), 1000..=1099)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Keel Core.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// A schedule string or duration failed to parse.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Leader-only jobs were registered but no elector is configured.
    #[error("{jobs} leader-only job(s) registered but no leader elector is configured")]
    MissingElector { jobs: usize },

    /// The mock elector was requested in a production-like environment.
    #[error("mock leader elector is not allowed in the {environment:?} environment")]
    MockElectorForbidden { environment: String },

    /// The leader elector could not be reached or answered with an error.
    #[error(transparent)]
    Election(#[from] ElectionError),

    /// An init function failed.
    #[error("init of service {service:?} failed in {function:?}: {source}")]
    Init {
        service: String,
        function: String,
        #[source]
        source: anyhow::Error,
    },

    /// An init group did not complete within the init timeout.
    #[error("init of service {service:?} did not complete within {timeout:?}")]
    InitTimeout { service: String, timeout: Duration },

    /// A cleanup function failed.
    #[error("cleanup of service {service:?} failed in {function:?}: {source}")]
    CleanupFunction {
        service: String,
        function: String,
        #[source]
        source: anyhow::Error,
    },

    /// A cleanup group did not complete within the cleanup timeout.
    #[error("cleanup of service {service:?} did not complete within {timeout:?}")]
    CleanupTimeout { service: String, timeout: Duration },

    /// One or more cleanup groups failed.
    #[error("cleanup failed: {}", join_messages(.0))]
    Cleanup(Vec<LifecycleError>),

    /// A function panicked; the panic was recovered.
    #[error("{context} panicked: {message}")]
    Panicked {
        context: String,
        message: String,
        backtrace: String,
    },

    /// A listener could not be bound.
    #[error("failed to bind {what} listener on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The scope was canceled.
    #[error("operation cancelled")]
    Cancelled,

    /// The scope's deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A spawned task could not be joined.
    #[error("task join failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// gRPC transport failure.
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration source failure.
    #[error("failed to load configuration: {0}")]
    ConfigSource(#[from] config::ConfigError),
}

fn join_messages(errors: &[LifecycleError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl LifecycleError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Convert a recovered panic payload into an error.
    pub fn from_panic(context: impl Into<String>, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Self::Panicked {
            context: context.into(),
            message,
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Schedule(_) => ErrorCode::InvalidSchedule,
            Self::Configuration(_) | Self::ConfigSource(_) => ErrorCode::ConfigurationError,
            Self::MissingElector { .. } => ErrorCode::MissingElector,
            Self::MockElectorForbidden { .. } => ErrorCode::MockElectorForbidden,
            Self::Election(_) => ErrorCode::ElectorUnavailable,
            Self::Init { .. } => ErrorCode::InitFailed,
            Self::InitTimeout { .. } => ErrorCode::InitTimeout,
            Self::CleanupFunction { .. } | Self::Cleanup(_) => ErrorCode::CleanupFailed,
            Self::CleanupTimeout { .. } => ErrorCode::CleanupTimeout,
            Self::Panicked { .. } => ErrorCode::Panicked,
            Self::Bind { .. } => ErrorCode::BindFailed,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            Self::Join(_) => ErrorCode::SchedulerFailed,
            Self::Transport(_) => ErrorCode::ServerFailed,
            Self::Io(_) => ErrorCode::InternalError,
        }
    }

    /// True for the clean-stop outcomes of a canceled or expired scope.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Log this error at a level matching its category.
    pub fn log(&self) {
        let code = self.code();
        if self.is_cancellation() {
            warn!(code = %code, category = code.category(), error = %self, "Operation stopped");
        } else {
            error!(code = %code, category = code.category(), error = %self, "Lifecycle error");
        }
    }
}
