//! Configuration management.
//!
//! Values come from an optional file and from `TOLLGATE__*` environment
//! variables (`TOLLGATE__WORKER__CONCURRENCY=8`). Every field has a default,
//! so an empty environment yields a runnable configuration.

use serde::Deserialize;
use std::time::Duration;

use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub admission: AdmissionSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Deployment environment (development enables pretty logs)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix applied to every key this service writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single job-store command
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Connection attempts made at startup before giving up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Base delay between startup connection attempts (multiplied by the attempt number)
    #[serde(default = "default_connect_backoff", with = "humantime_serde")]
    pub connect_backoff: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            command_timeout: default_command_timeout(),
            connect_retries: default_connect_retries(),
            connect_backoff: default_connect_backoff(),
        }
    }
}

/// A limit applied over a fixed window.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct WindowLimit {
    pub limit: u64,

    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// A throttle policy: requests beyond `limit` in `window` are delayed by
/// `unit_delay` per excess request.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ThrottleLimit {
    pub limit: u64,

    #[serde(with = "humantime_serde")]
    pub window: Duration,

    #[serde(with = "humantime_serde")]
    pub unit_delay: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSettings {
    /// Whether the HTTP admission layers are installed
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allow requests when the store is unreachable
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Upper bound on a single counter round-trip
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub store_timeout: Duration,

    /// Cap on any single throttle delay
    #[serde(default = "default_max_throttle_delay", with = "humantime_serde")]
    pub max_throttle_delay: Duration,

    /// Trust `X-Forwarded-For` / `X-Real-IP` for the client identity
    #[serde(default)]
    pub trust_proxy_headers: bool,

    #[serde(default = "default_rate_limit")]
    pub rate_limit: WindowLimit,

    #[serde(default = "default_throttle")]
    pub throttle: ThrottleLimit,

    #[serde(default = "default_lockout")]
    pub lockout: WindowLimit,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_open: true,
            store_timeout: default_store_timeout(),
            max_throttle_delay: default_max_throttle_delay(),
            trust_proxy_headers: false,
            rate_limit: default_rate_limit(),
            throttle: default_throttle(),
            lockout: default_lockout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Queue used by the demo email handler
    #[serde(default = "default_queue_name")]
    pub default_queue: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_queue: default_queue_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Worker identity prefix recorded in `locked_by`
    #[serde(default = "default_worker_name")]
    pub name: String,

    /// Concurrent poll loops per registered queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Visibility timeout for a claimed job
    #[serde(default = "default_lease_duration", with = "humantime_serde")]
    pub lease_duration: Duration,

    #[serde(default = "default_stall_check_interval", with = "humantime_serde")]
    pub stall_check_interval: Duration,

    /// Reclaims tolerated before a stalled job is failed
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    /// How long shutdown waits for in-flight jobs
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            lease_duration: default_lease_duration(),
            stall_check_interval: default_stall_check_interval(),
            max_stalled_count: default_max_stalled_count(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_environment() -> String { "production".to_string() }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "tollgate:".to_string() }
fn default_command_timeout() -> Duration { Duration::from_secs(2) }
fn default_connect_retries() -> u32 { 10 }
fn default_connect_backoff() -> Duration { Duration::from_secs(1) }
fn default_true() -> bool { true }
fn default_store_timeout() -> Duration { Duration::from_millis(500) }
fn default_max_throttle_delay() -> Duration { Duration::from_secs(10) }
fn default_rate_limit() -> WindowLimit { WindowLimit { limit: 5, window: Duration::from_secs(60) } }
fn default_throttle() -> ThrottleLimit {
    ThrottleLimit { limit: 20, window: Duration::from_secs(60), unit_delay: Duration::from_millis(200) }
}
fn default_lockout() -> WindowLimit { WindowLimit { limit: 5, window: Duration::from_secs(300) } }
fn default_queue_name() -> String { "email".to_string() }
fn default_worker_name() -> String { "tollgate-worker".to_string() }
fn default_concurrency() -> usize { 4 }
fn default_poll_interval() -> Duration { Duration::from_millis(500) }
fn default_lease_duration() -> Duration { Duration::from_secs(30) }
fn default_stall_check_interval() -> Duration { Duration::from_secs(15) }
fn default_max_stalled_count() -> u32 { 1 }
fn default_drain_timeout() -> Duration { Duration::from_secs(30) }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TOLLGATE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TOLLGATE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.worker.concurrency == 0 {
            anyhow::bail!("worker.concurrency must be at least 1");
        }
        if self.worker.lease_duration.is_zero() {
            anyhow::bail!("worker.lease_duration must be positive");
        }
        for (name, window) in [
            ("admission.rate_limit.window", self.admission.rate_limit.window),
            ("admission.throttle.window", self.admission.throttle.window),
            ("admission.lockout.window", self.admission.lockout.window),
        ] {
            if window.as_secs() == 0 {
                anyhow::bail!("{} must be at least one second", name);
            }
        }
        Ok(())
    }
}
