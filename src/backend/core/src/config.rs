//! Configuration management.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Deployment environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Init/cleanup/shutdown timing
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Leader election
    #[serde(default)]
    pub election: ElectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            election: ElectionConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// gRPC listen address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Debug endpoint address, served by the lead server only
    #[serde(default)]
    pub debug_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            grpc_addr: default_grpc_addr(),
            debug_addr: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Deadline for the whole graceful shutdown after the first signal
    #[serde(default = "default_graceful_shutdown_timeout", with = "humantime_serde")]
    pub graceful_shutdown_timeout: Duration,

    /// Bound for each init group
    #[serde(default = "default_init_timeout", with = "humantime_serde")]
    pub init_timeout: Duration,

    /// Bound for each cleanup group
    #[serde(default = "default_cleanup_timeout", with = "humantime_serde")]
    pub cleanup_timeout: Duration,

    /// How long in-flight gRPC/HTTP requests may drain before a hard stop
    #[serde(default = "default_drain_window", with = "humantime_serde")]
    pub drain_window: Duration,

    /// Report the default health entry as NOT_SERVING until init completes
    #[serde(default = "default_wait_for_ready")]
    pub wait_for_ready: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
            init_timeout: default_init_timeout(),
            cleanup_timeout: default_cleanup_timeout(),
            drain_window: default_drain_window(),
            wait_for_ready: default_wait_for_ready(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ElectionConfig {
    /// Unix socket of the external elector
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Mock elector spec: a boolean literal or a toggle period ("30s")
    #[serde(default)]
    pub mock: Option<String>,

    /// How often leadership is polled
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Bound for the initial elector connection
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Bound for each leadership query
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            mock: None,
            poll_interval: default_poll_interval(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

// Default value functions
fn default_environment() -> String { "development".to_string() }
fn default_http_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8080)) }
fn default_grpc_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 50051)) }
fn default_graceful_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_init_timeout() -> Duration { Duration::from_secs(60) }
fn default_cleanup_timeout() -> Duration { Duration::from_secs(30) }
fn default_drain_window() -> Duration { Duration::from_secs(15) }
fn default_wait_for_ready() -> bool { true }
fn default_poll_interval() -> Duration { Duration::from_secs(10) }
fn default_connect_timeout() -> Duration { Duration::from_secs(10) }
fn default_request_timeout() -> Duration { Duration::from_secs(5) }

impl Config {
    /// Load configuration from the environment (`KEEL__SECTION__KEY`).
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("KEEL").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("KEEL").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Production-like environments refuse development shortcuts such as the mock elector.
    pub fn is_production_like(&self) -> bool {
        is_production_like(&self.environment)
    }
}

pub(crate) fn is_production_like(environment: &str) -> bool {
    matches!(
        environment.to_ascii_lowercase().as_str(),
        "production" | "prod" | "staging"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.environment, "development");
        assert_eq!(config.lifecycle.drain_window, Duration::from_secs(15));
        assert_eq!(config.election.poll_interval, Duration::from_secs(10));
        assert_eq!(config.election.connect_timeout, Duration::from_secs(10));
        assert!(config.lifecycle.wait_for_ready);
        assert!(config.server.debug_addr.is_none());
        assert!(!config.is_production_like());
    }

    #[test]
    fn test_production_like_environments() {
        assert!(is_production_like("production"));
        assert!(is_production_like("PROD"));
        assert!(is_production_like("staging"));
        assert!(!is_production_like("development"));
        assert!(!is_production_like("test"));
    }

    #[test]
    fn test_from_file_with_humantime_durations() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
environment = "test"

[server]
http_addr = "127.0.0.1:9000"
debug_addr = "127.0.0.1:9001"

[lifecycle]
init_timeout = "5s"
graceful_shutdown_timeout = "1m"

[election]
mock = "2s"
poll_interval = "500ms"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.environment, "test");
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.server.debug_addr.unwrap().port(), 9001);
        assert_eq!(config.lifecycle.init_timeout, Duration::from_secs(5));
        assert_eq!(config.lifecycle.graceful_shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.lifecycle.cleanup_timeout, Duration::from_secs(30));
        assert_eq!(config.election.mock.as_deref(), Some("2s"));
        assert_eq!(config.election.poll_interval, Duration::from_millis(500));
    }
}
