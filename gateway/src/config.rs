//! Configuration for the gateway.

use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Default config file name (without extension), looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "gateway";

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Inference backends known at startup.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One inference server, e.g. an Ollama instance at `hx-llm01-server:11434`.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Model names served by this backend, in preference order.
    pub models: Vec<String>,
}

impl BackendConfig {
    /// Backend identity (`host:port`).
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub keys: Vec<ApiKeyConfig>,
}

/// An accepted API key and its quota.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    /// Label used in logs instead of the key itself.
    pub name: String,
    /// Plain key, or `sha256:<hex digest>` of the key.
    pub key: String,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Token budget per rolling minute. Unlimited when unset.
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Total attempts per request, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Bound on waiting for the first byte (or first chunk) of one attempt.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    /// Bound on the whole request across retries.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Capacity of the per-stream relay channel.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl DispatchConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            stream_buffer: default_stream_buffer(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Shape of the delay between failover attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_backoff_initial")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl BackoffConfig {
    /// Delay before the retry that follows the `failures`-th failed attempt (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let n = failures.max(1);
        let ms = match self.strategy {
            BackoffStrategy::Constant => self.initial_ms as f64,
            BackoffStrategy::Linear => self.initial_ms as f64 * n as f64,
            BackoffStrategy::Exponential => {
                self.initial_ms as f64 * self.multiplier.powi(n as i32 - 1)
            }
        };
        Duration::from_millis(ms.min(self.max_ms as f64) as u64)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            initial_ms: default_backoff_initial(),
            max_ms: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

/// Thresholds for the passive health state machine.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures within `failure_window_secs` before HEALTHY -> DEGRADED.
    #[serde(default = "default_degrade_after")]
    pub degrade_after: u32,
    /// Further consecutive failures before DEGRADED -> UNREACHABLE.
    #[serde(default = "default_unreachable_after")]
    pub unreachable_after: u32,
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,
    /// How long an UNREACHABLE backend sits out before live traffic probes it again.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl HealthConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degrade_after: default_degrade_after(),
            unreachable_after: default_unreachable_after(),
            failure_window_secs: default_failure_window(),
            probe_interval_secs: default_probe_interval(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_scheme() -> String {
    "http".to_string()
}
fn default_requests_per_minute() -> u32 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_attempt_timeout() -> u64 {
    60
}
fn default_request_timeout() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_stream_buffer() -> usize {
    32
}
fn default_backoff_initial() -> u64 {
    100
}
fn default_backoff_max() -> u64 {
    2000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_degrade_after() -> u32 {
    3
}
fn default_unreachable_after() -> u32 {
    2
}
fn default_failure_window() -> u64 {
    30
}
fn default_probe_interval() -> u64 {
    15
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (GATEWAY__SECTION__KEY format)
    /// 2. The file named by `GATEWAY_CONFIG`, or `gateway.toml` (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("GATEWAY_CONFIG") {
            Ok(path) => File::with_name(&path).required(true),
            Err(_) => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Self::build(file)
    }

    /// Load configuration from an explicit file path, still honouring env overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::build(File::from(path.as_ref()).required(true))
    }

    fn build(
        file: File<config::FileSourceFile, config::FileFormat>,
    ) -> Result<Self, ConfigError> {
        let config: Config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("logging.level", default_log_level())?
            .add_source(file)
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::Message(
                "dispatch.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.dispatch.stream_buffer == 0 {
            return Err(ConfigError::Message(
                "dispatch.stream_buffer must be at least 1".to_string(),
            ));
        }
        if self.health.degrade_after == 0 {
            return Err(ConfigError::Message(
                "health.degrade_after must be at least 1".to_string(),
            ));
        }
        if self.health.failure_window_secs == 0 {
            return Err(ConfigError::Message(
                "health.failure_window_secs must be at least 1".to_string(),
            ));
        }
        for backend in &self.backends {
            if backend.models.is_empty() {
                return Err(ConfigError::Message(format!(
                    "backend {} serves no models",
                    backend.id()
                )));
            }
        }
        for key in &self.auth.keys {
            if key.requests_per_minute == 0 {
                return Err(ConfigError::Message(format!(
                    "api key '{}' has requests_per_minute = 0",
                    key.name
                )));
            }
        }
        Ok(())
    }
}
