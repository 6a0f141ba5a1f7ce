//! Configuration management for the connection pool.
//!
//! Configuration is layered, lowest precedence first:
//! - Built-in defaults
//! - A configuration file (TOML, YAML or JSON, chosen by extension)
//! - Environment variables (`RUSTIBLE_POOL_*`)
//!
//! Every layer is followed by [`AdvancedPoolConfig::validate`]; an invalid
//! configuration is rejected as a whole and never partially applied.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use humantime_serde::re::humantime::format_duration;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};
use crate::pool::strategy::{AffinityMode, LoadBalancingMode, EVICTION_STRATEGY_NAMES};

// ============================================================================
// Basic pool configuration
// ============================================================================

/// What `get` does when every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Wait for a slot until the context deadline or `acquire_timeout`.
    #[default]
    Block,
    /// Return `PoolExhausted` immediately.
    FailFast,
}

impl FromStr for ExhaustionPolicy {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "fail_fast" | "failfast" => Ok(Self::FailFast),
            other => Err(PoolError::Configuration(format!(
                "unknown exhaustion policy '{}'",
                other
            ))),
        }
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live connections across all keys
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle time after which a connection is eligible for eviction
    #[serde(default = "default_max_idle_time")]
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,

    /// Per-connection health check interval (also the validity of a cached result)
    #[serde(default = "default_health_interval")]
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,

    /// Interval between cleanup cycles
    #[serde(default = "default_cleanup_interval")]
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Attempts per connection when pre-warming
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound on how long a blocking `get` waits for a slot
    #[serde(default = "default_acquire_timeout")]
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Behaviour at capacity
    #[serde(default)]
    pub exhaustion_policy: ExhaustionPolicy,
}

fn default_max_connections() -> usize {
    50
}

fn default_max_idle_time() -> Duration {
    Duration::from_secs(300)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_retries() -> u32 {
    3
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_idle_time: default_max_idle_time(),
            health_interval: default_health_interval(),
            cleanup_interval: default_cleanup_interval(),
            max_retries: default_max_retries(),
            acquire_timeout: default_acquire_timeout(),
            exhaustion_policy: ExhaustionPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the idle eviction threshold
    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    /// Set health check interval
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set pre-warm attempts
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the blocking acquire bound
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the behaviour at capacity
    pub fn exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion_policy = policy;
        self
    }

    /// Reject non-positive durations and counts.
    pub fn validate(&self) -> PoolResult<()> {
        positive_count("max_connections", self.max_connections)?;
        positive_count("max_retries", self.max_retries as usize)?;
        positive_duration("max_idle_time", self.max_idle_time)?;
        positive_duration("health_interval", self.health_interval)?;
        positive_duration("cleanup_interval", self.cleanup_interval)?;
        positive_duration("acquire_timeout", self.acquire_timeout)?;
        Ok(())
    }
}

// ============================================================================
// Sub-configurations
// ============================================================================

/// Health checking and recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Run one monitoring loop per connection.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Timeout for a single probe.
    #[serde(default = "default_check_timeout")]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Command used as the liveness probe.
    #[serde(default = "default_probe_command")]
    pub probe_command: String,

    /// Consecutive failures that trigger recovery.
    #[serde(default = "default_max_consecutive_fails")]
    pub max_consecutive_fails: u32,

    /// Whether failing connections are re-dialed automatically.
    #[serde(default = "default_true")]
    pub auto_recovery: bool,

    /// Recovery attempts before giving up.
    #[serde(default = "default_recovery_retries")]
    pub recovery_retries: u32,

    /// Base of the linear backoff between per-connection recovery attempts.
    #[serde(default = "default_recovery_backoff")]
    #[serde(with = "humantime_serde")]
    pub recovery_backoff: Duration,

    /// Tick of the pool-wide health integration loop.
    #[serde(default = "default_integration_interval")]
    #[serde(with = "humantime_serde")]
    pub integration_interval: Duration,

    /// Base of the linear backoff between pool-level replacement attempts.
    #[serde(default = "default_recovery_delay")]
    #[serde(with = "humantime_serde")]
    pub recovery_delay: Duration,
}

fn default_true() -> bool {
    true
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_command() -> String {
    "true".to_string()
}

fn default_max_consecutive_fails() -> u32 {
    3
}

fn default_recovery_retries() -> u32 {
    3
}

fn default_recovery_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_integration_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_recovery_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            timeout: default_check_timeout(),
            probe_command: default_probe_command(),
            max_consecutive_fails: default_max_consecutive_fails(),
            auto_recovery: default_true(),
            recovery_retries: default_recovery_retries(),
            recovery_backoff: default_recovery_backoff(),
            integration_interval: default_integration_interval(),
            recovery_delay: default_recovery_delay(),
        }
    }
}

impl HealthConfig {
    /// Set the probe timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the probe command.
    pub fn with_probe_command(mut self, command: impl Into<String>) -> Self {
        self.probe_command = command.into();
        self
    }

    /// Set the failure count that triggers recovery.
    pub fn with_max_consecutive_fails(mut self, fails: u32) -> Self {
        self.max_consecutive_fails = fails;
        self
    }

    /// Enable or disable auto-recovery.
    pub fn with_auto_recovery(mut self, enabled: bool) -> Self {
        self.auto_recovery = enabled;
        self
    }

    /// Set recovery attempts and the per-connection backoff base.
    pub fn with_recovery(mut self, retries: u32, backoff: Duration) -> Self {
        self.recovery_retries = retries;
        self.recovery_backoff = backoff;
        self
    }

    /// Set the integration loop tick and its replacement delay base.
    pub fn with_integration(mut self, interval: Duration, recovery_delay: Duration) -> Self {
        self.integration_interval = interval;
        self.recovery_delay = recovery_delay;
        self
    }

    /// Disable per-connection monitoring loops.
    pub fn disable_monitoring(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self) -> PoolResult<()> {
        positive_duration("health.timeout", self.timeout)?;
        positive_count(
            "health.max_consecutive_fails",
            self.max_consecutive_fails as usize,
        )?;
        positive_count("health.recovery_retries", self.recovery_retries as usize)?;
        positive_duration("health.recovery_backoff", self.recovery_backoff)?;
        positive_duration("health.integration_interval", self.integration_interval)?;
        positive_duration("health.recovery_delay", self.recovery_delay)?;
        if self.probe_command.trim().is_empty() {
            return Err(PoolError::Configuration(
                "health.probe_command must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Alert thresholds evaluated by the health integration loop.
///
/// `min_healthy_connections = 0` disables the low-healthy check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Whether alerts are evaluated at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Unhealthy results per tick above which an alert is raised.
    #[serde(default = "default_max_connection_failures")]
    pub max_connection_failures: usize,

    /// Healthy results per tick below which an alert is raised.
    #[serde(default)]
    pub min_healthy_connections: usize,

    /// Average probe latency above which an alert is raised.
    #[serde(default = "default_max_average_response_time")]
    #[serde(with = "humantime_serde")]
    pub max_average_response_time: Duration,
}

fn default_max_connection_failures() -> usize {
    5
}

fn default_max_average_response_time() -> Duration {
    Duration::from_secs(2)
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_connection_failures: default_max_connection_failures(),
            min_healthy_connections: 0,
            max_average_response_time: default_max_average_response_time(),
        }
    }
}

/// Cleanup settings not already covered by [`PoolConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSettings {
    /// Run the cleanup loop.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Connections older than this are retired once idle.
    #[serde(default = "default_max_connection_age")]
    #[serde(with = "humantime_serde")]
    pub max_connection_age: Duration,

    /// Per-key floor below which warmup is requested.
    #[serde(default)]
    pub min_connections: usize,
}

fn default_max_connection_age() -> Duration {
    Duration::from_secs(1800)
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_connection_age: default_max_connection_age(),
            min_connections: 0,
        }
    }
}

/// Leak detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakDetectionConfig {
    /// Run the leak detector loop.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between leak scans.
    #[serde(default = "default_leak_check_interval")]
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// Age at which a one-time warning is logged.
    #[serde(default = "default_warning_threshold")]
    #[serde(with = "humantime_serde")]
    pub warning_threshold: Duration,

    /// Age at which a connection is flagged as leaked.
    #[serde(default = "default_max_lifetime")]
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
}

fn default_leak_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_warning_threshold() -> Duration {
    Duration::from_secs(2700)
}

fn default_max_lifetime() -> Duration {
    Duration::from_secs(3600)
}

impl Default for LeakDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            check_interval: default_leak_check_interval(),
            warning_threshold: default_warning_threshold(),
            max_lifetime: default_max_lifetime(),
        }
    }
}

/// Acquire latency sampling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Record acquire latency samples.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of samples kept for the latency statistics.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

fn default_sample_size() -> usize {
    100
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            sample_size: default_sample_size(),
        }
    }
}

// ============================================================================
// Advanced configuration
// ============================================================================

/// Full pool configuration: the basic [`PoolConfig`] plus strategy, health,
/// alert, cleanup, leak and metrics settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvancedPoolConfig {
    /// Basic pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Eviction strategy name: `lru`, `fifo`, `lfu` or `custom`
    #[serde(default = "default_eviction_strategy")]
    pub eviction_strategy: String,

    /// Selection among several idle connections for one key
    #[serde(default)]
    pub load_balancing: LoadBalancingMode,

    /// Connection pinning per key
    #[serde(default)]
    pub affinity: AffinityMode,

    /// Health checking and recovery
    #[serde(default)]
    pub health: HealthConfig,

    /// Alert thresholds
    #[serde(default)]
    pub alerts: AlertThresholds,

    /// Cleanup settings
    #[serde(default)]
    pub cleanup: CleanupSettings,

    /// Leak detection
    #[serde(default)]
    pub leak_detection: LeakDetectionConfig,

    /// Metrics
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_eviction_strategy() -> String {
    "lru".to_string()
}

impl Default for AdvancedPoolConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            eviction_strategy: default_eviction_strategy(),
            load_balancing: LoadBalancingMode::default(),
            affinity: AffinityMode::default(),
            health: HealthConfig::default(),
            alerts: AlertThresholds::default(),
            cleanup: CleanupSettings::default(),
            leak_detection: LeakDetectionConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl From<PoolConfig> for AdvancedPoolConfig {
    fn from(pool: PoolConfig) -> Self {
        Self {
            pool,
            ..Self::default()
        }
    }
}

impl AdvancedPoolConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the basic pool settings
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the eviction strategy name
    pub fn with_eviction_strategy(mut self, name: impl Into<String>) -> Self {
        self.eviction_strategy = name.into();
        self
    }

    /// Set the load-balancing mode
    pub fn with_load_balancing(mut self, mode: LoadBalancingMode) -> Self {
        self.load_balancing = mode;
        self
    }

    /// Set the affinity mode
    pub fn with_affinity(mut self, affinity: AffinityMode) -> Self {
        self.affinity = affinity;
        self
    }

    /// Set the health settings
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Set the alert thresholds
    pub fn with_alerts(mut self, alerts: AlertThresholds) -> Self {
        self.alerts = alerts;
        self
    }

    /// Set the cleanup settings
    pub fn with_cleanup(mut self, cleanup: CleanupSettings) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Set the leak detection settings
    pub fn with_leak_detection(mut self, leak: LeakDetectionConfig) -> Self {
        self.leak_detection = leak;
        self
    }

    /// Set the metrics settings
    pub fn with_metrics(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = metrics;
        self
    }

    /// Check every layer. Called by the pool builder before anything starts.
    pub fn validate(&self) -> PoolResult<()> {
        self.pool.validate()?;

        let strategy = self.eviction_strategy.to_ascii_lowercase();
        if !EVICTION_STRATEGY_NAMES.contains(&strategy.as_str()) {
            return Err(PoolError::Configuration(format!(
                "unknown eviction strategy '{}' (expected one of: {})",
                self.eviction_strategy,
                EVICTION_STRATEGY_NAMES.join(", ")
            )));
        }

        self.health.validate()?;
        positive_duration(
            "alerts.max_average_response_time",
            self.alerts.max_average_response_time,
        )?;

        positive_duration(
            "cleanup.max_connection_age",
            self.cleanup.max_connection_age,
        )?;
        if self.cleanup.min_connections > self.pool.max_connections {
            return Err(PoolError::Configuration(format!(
                "cleanup.min_connections ({}) exceeds max_connections ({})",
                self.cleanup.min_connections, self.pool.max_connections
            )));
        }

        let leak = &self.leak_detection;
        positive_duration("leak_detection.check_interval", leak.check_interval)?;
        positive_duration("leak_detection.warning_threshold", leak.warning_threshold)?;
        positive_duration("leak_detection.max_lifetime", leak.max_lifetime)?;
        if leak.warning_threshold >= leak.max_lifetime {
            return Err(PoolError::Configuration(
                "leak_detection.warning_threshold must be below max_lifetime".into(),
            ));
        }
        // Aged-out connections must be recycled before they look leaked.
        if self.cleanup.enabled
            && leak.enabled
            && self.cleanup.max_connection_age >= leak.max_lifetime
        {
            return Err(PoolError::Configuration(format!(
                "cleanup.max_connection_age ({}) must be below leak_detection.max_lifetime ({})",
                format_duration(self.cleanup.max_connection_age),
                format_duration(leak.max_lifetime)
            )));
        }

        positive_count("metrics.sample_size", self.metrics.sample_size)?;
        Ok(())
    }

    /// Load configuration from all sources and validate it.
    pub fn load(config_path: Option<&Path>) -> PoolResult<Self> {
        let mut config = Self::default();

        for path in Self::config_paths(config_path) {
            if path.exists() {
                config = Self::from_file(&path)?;
                break;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Candidate configuration files, most specific first.
    fn config_paths(explicit_path: Option<&Path>) -> Vec<PathBuf> {
        if let Some(path) = explicit_path {
            return vec![path.to_path_buf()];
        }

        let mut paths = Vec::new();

        if let Ok(env_config) = std::env::var("RUSTIBLE_POOL_CONFIG") {
            paths.push(PathBuf::from(env_config));
        }

        // Project config (current directory)
        paths.push(PathBuf::from("rustible-pool.toml"));

        // User config
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".rustible/pool.toml"));
        }

        // System-wide config
        paths.push(PathBuf::from("/etc/rustible/pool.toml"));

        paths
    }

    /// Parse a configuration file; the format follows the extension.
    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PoolError::Configuration(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed = match extension {
            "yml" | "yaml" => serde_yaml::from_str(&content).map_err(|e| e.to_string()),
            "json" => serde_json::from_str(&content).map_err(|e| e.to_string()),
            _ => toml::from_str(&content).map_err(|e| e.to_string()),
        };

        parsed.map_err(|e| {
            PoolError::Configuration(format!(
                "failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Parse TOML content.
    pub fn from_toml(content: &str) -> PoolResult<Self> {
        toml::from_str(content)
            .map_err(|e| PoolError::Configuration(format!("failed to parse config: {}", e)))
    }

    /// Apply `RUSTIBLE_POOL_*` overrides. Unparsable values are errors.
    pub fn apply_env_overrides(&mut self) -> PoolResult<()> {
        if let Some(value) = env_var("RUSTIBLE_POOL_MAX_CONNECTIONS") {
            self.pool.max_connections = value.parse().map_err(|_| {
                PoolError::Configuration(format!(
                    "RUSTIBLE_POOL_MAX_CONNECTIONS: invalid count '{}'",
                    value
                ))
            })?;
        }
        if let Some(value) = env_var("RUSTIBLE_POOL_MAX_IDLE_TIME") {
            self.pool.max_idle_time = parse_env_duration("RUSTIBLE_POOL_MAX_IDLE_TIME", &value)?;
        }
        if let Some(value) = env_var("RUSTIBLE_POOL_HEALTH_INTERVAL") {
            self.pool.health_interval =
                parse_env_duration("RUSTIBLE_POOL_HEALTH_INTERVAL", &value)?;
        }
        if let Some(value) = env_var("RUSTIBLE_POOL_CLEANUP_INTERVAL") {
            self.pool.cleanup_interval =
                parse_env_duration("RUSTIBLE_POOL_CLEANUP_INTERVAL", &value)?;
        }
        if let Some(value) = env_var("RUSTIBLE_POOL_EXHAUSTION_POLICY") {
            self.pool.exhaustion_policy = value.parse()?;
        }
        if let Some(value) = env_var("RUSTIBLE_POOL_EVICTION_STRATEGY") {
            self.eviction_strategy = value;
        }
        if let Some(value) = env_var("RUSTIBLE_POOL_LOAD_BALANCING") {
            self.load_balancing = value.parse()?;
        }
        if let Some(value) = env_var("RUSTIBLE_POOL_AFFINITY") {
            self.affinity = value.parse()?;
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env_duration(name: &str, value: &str) -> PoolResult<Duration> {
    humantime_serde::re::humantime::parse_duration(value.trim()).map_err(|e| {
        PoolError::Configuration(format!("{}: invalid duration '{}': {}", name, value, e))
    })
}

fn positive_duration(name: &str, value: Duration) -> PoolResult<()> {
    if value.is_zero() {
        return Err(PoolError::Configuration(format!(
            "{} must be a positive duration",
            name
        )));
    }
    Ok(())
}

fn positive_count(name: &str, value: usize) -> PoolResult<()> {
    if value == 0 {
        return Err(PoolError::Configuration(format!(
            "{} must be greater than zero",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.max_idle_time, Duration::from_secs(300));
        assert_eq!(config.exhaustion_policy, ExhaustionPolicy::Block);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new()
            .max_connections(10)
            .max_idle_time(Duration::from_secs(600))
            .exhaustion_policy(ExhaustionPolicy::FailFast);

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_idle_time, Duration::from_secs(600));
        assert_eq!(config.exhaustion_policy, ExhaustionPolicy::FailFast);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(PoolConfig::new().max_connections(0).validate().is_err());
        assert!(PoolConfig::new()
            .cleanup_interval(Duration::ZERO)
            .validate()
            .is_err());

        let config = AdvancedPoolConfig::new()
            .with_health(HealthConfig::default().with_max_consecutive_fails(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_strategy() {
        let config = AdvancedPoolConfig::new().with_eviction_strategy("mru");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown eviction strategy 'mru'"));

        assert!(AdvancedPoolConfig::new()
            .with_eviction_strategy("LFU")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_validate_leak_thresholds() {
        let config = AdvancedPoolConfig::new().with_leak_detection(LeakDetectionConfig {
            warning_threshold: Duration::from_secs(3600),
            max_lifetime: Duration::from_secs(60),
            ..LeakDetectionConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_connection_age_below_leak_lifetime() {
        let leak = LeakDetectionConfig {
            warning_threshold: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1200),
            ..LeakDetectionConfig::default()
        };
        let config = AdvancedPoolConfig::new().with_leak_detection(leak.clone());
        let err = config.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("cleanup.max_connection_age (30m) must be below leak_detection.max_lifetime (20m)"));

        let aged = AdvancedPoolConfig::new()
            .with_leak_detection(leak.clone())
            .with_cleanup(CleanupSettings {
                max_connection_age: Duration::from_secs(900),
                ..CleanupSettings::default()
            });
        assert!(aged.validate().is_ok());

        let no_cleanup = AdvancedPoolConfig::new()
            .with_leak_detection(leak)
            .with_cleanup(CleanupSettings {
                enabled: false,
                ..CleanupSettings::default()
            });
        assert!(no_cleanup.validate().is_ok());
    }

    #[test]
    fn test_from_toml_layers_over_defaults() {
        let config = AdvancedPoolConfig::from_toml(
            r#"
            eviction_strategy = "fifo"
            load_balancing = "least_used"

            [pool]
            max_connections = 8
            max_idle_time = "2m"
            exhaustion_policy = "fail_fast"

            [health]
            max_consecutive_fails = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_connections, 8);
        assert_eq!(config.pool.max_idle_time, Duration::from_secs(120));
        assert_eq!(config.pool.exhaustion_policy, ExhaustionPolicy::FailFast);
        assert_eq!(config.eviction_strategy, "fifo");
        assert_eq!(config.load_balancing, LoadBalancingMode::LeastUsed);
        assert_eq!(config.health.max_consecutive_fails, 5);
        assert_eq!(config.health.recovery_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_rejects_unknown_mode() {
        let result = AdvancedPoolConfig::from_toml(r#"load_balancing = "fastest""#);
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[test]
    fn test_exhaustion_policy_from_str() {
        assert_eq!(
            "fail_fast".parse::<ExhaustionPolicy>().unwrap(),
            ExhaustionPolicy::FailFast
        );
        assert_eq!(
            "Block".parse::<ExhaustionPolicy>().unwrap(),
            ExhaustionPolicy::Block
        );
        assert!("wait".parse::<ExhaustionPolicy>().is_err());
    }
}
