use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::pool::{CircuitBreakerConfig, PoolConfig};
use crate::session::{Credentials, EndpointConfig};

/// Pool sizing and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Hard cap on live connections across all endpoints
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Connections opened at startup and kept by idle eviction
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Idle time in seconds before a connection may be evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Health probe interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Connect and session creation timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Transport reconnect attempts
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between transport reconnect attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_max_connections() -> usize {
    10
}

fn default_min_connections() -> usize {
    2
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1_000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            idle_timeout_secs: default_idle_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            connect_timeout_ms: default_connect_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Per-endpoint circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Failures within the monitoring period that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before allowing trial calls
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,

    /// Rolling window in seconds for counting failures
    #[serde(default = "default_monitoring_period")]
    pub monitoring_period_secs: u64,

    /// Successful trial calls needed to close a half-open circuit
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    60
}

fn default_monitoring_period() -> u64 {
    120
}

fn default_half_open_max_attempts() -> u32 {
    3
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout(),
            monitoring_period_secs: default_monitoring_period(),
            half_open_max_attempts: default_half_open_max_attempts(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Endpoints to pool, in warm-up order
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Pool settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Circuit breaker settings
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_config(&self) -> Result<PoolConfig> {
        let config = PoolConfig {
            max_connections: self.pool.max_connections,
            min_connections: self.pool.min_connections,
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            health_check_interval: Duration::from_secs(self.pool.health_check_interval_secs),
            connect_timeout: Duration::from_millis(self.pool.connect_timeout_ms),
            retry_attempts: self.pool.retry_attempts,
            retry_delay: Duration::from_millis(self.pool.retry_delay_ms),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn breaker_config(&self) -> Result<CircuitBreakerConfig> {
        let cb = &self.circuit_breaker;
        let config = CircuitBreakerConfig {
            failure_threshold: cb.failure_threshold,
            reset_timeout: Duration::from_secs(cb.reset_timeout_secs),
            monitoring_period: Duration::from_secs(cb.monitoring_period_secs),
            half_open_max_attempts: cb.half_open_max_attempts,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check everything the pool would reject, plus endpoint URLs
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("No endpoints configured");
        }
        for endpoint in &self.endpoints {
            url::Url::parse(&endpoint.url)
                .context(format!("Invalid endpoint URL: {}", endpoint.url))?;
        }
        self.pool_config().context("Invalid pool settings")?;
        self.breaker_config().context("Invalid circuit breaker settings")?;
        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

fn parse_env<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = env::var(name) {
        if let Ok(val) = value.parse() {
            *target = val;
        }
    }
}

/// Load configuration from environment variables
///
/// - OPCPOOL_ENDPOINTS (comma-separated list of endpoint URLs, required)
/// - OPCPOOL_USERNAME / OPCPOOL_PASSWORD (optional, applied to every endpoint)
/// - OPCPOOL_MAX_CONNECTIONS, OPCPOOL_MIN_CONNECTIONS
/// - OPCPOOL_IDLE_TIMEOUT, OPCPOOL_HEALTH_CHECK_INTERVAL (seconds)
/// - OPCPOOL_CONNECT_TIMEOUT_MS
/// - OPCPOOL_FAILURE_THRESHOLD, OPCPOOL_RESET_TIMEOUT (seconds)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    let endpoints_str =
        env::var("OPCPOOL_ENDPOINTS").context("OPCPOOL_ENDPOINTS environment variable not set")?;

    let urls: Vec<String> = endpoints_str
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if urls.is_empty() {
        anyhow::bail!("OPCPOOL_ENDPOINTS contains no valid endpoints");
    }

    let credentials = Credentials {
        username: env::var("OPCPOOL_USERNAME").ok(),
        password: env::var("OPCPOOL_PASSWORD").ok(),
    };

    config.endpoints = urls
        .into_iter()
        .map(|url| EndpointConfig::new(url).with_credentials(credentials.clone()))
        .collect();

    parse_env("OPCPOOL_MAX_CONNECTIONS", &mut config.pool.max_connections);
    parse_env("OPCPOOL_MIN_CONNECTIONS", &mut config.pool.min_connections);
    parse_env("OPCPOOL_IDLE_TIMEOUT", &mut config.pool.idle_timeout_secs);
    parse_env(
        "OPCPOOL_HEALTH_CHECK_INTERVAL",
        &mut config.pool.health_check_interval_secs,
    );
    parse_env("OPCPOOL_CONNECT_TIMEOUT_MS", &mut config.pool.connect_timeout_ms);
    parse_env(
        "OPCPOOL_FAILURE_THRESHOLD",
        &mut config.circuit_breaker.failure_threshold,
    );
    parse_env(
        "OPCPOOL_RESET_TIMEOUT",
        &mut config.circuit_breaker.reset_timeout_secs,
    );

    Ok(config)
}

/// Load configuration from a YAML file when a path is given, otherwise from
/// the environment
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}
