//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Balancing, health checking and failover settings
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Statically configured backend servers
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Load balancer behaviour.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BalancerConfig {
    /// Selection strategy
    #[serde(default)]
    pub strategy: Algorithm,

    /// How often each server is probed
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Bound on a single probe
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// Retries after the first attempt of a call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts, multiplied by the attempt number
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Bound on all attempts of one call together (0 disables).
    ///
    /// This also bounds a single attempt: a call that legitimately takes
    /// longer than this fails with `FailoverTimeout` and is not retried.
    /// Raise it, or set 0, for slow methods.
    #[serde(default = "default_failover_timeout", with = "humantime_serde")]
    pub failover_timeout: Duration,

    /// Route calls carrying the same session key to the same server
    #[serde(default)]
    pub sticky_session: bool,

    /// Idle time after which a sticky binding expires
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Algorithm::default(),
            health_check_interval: default_health_interval(),
            health_check_timeout: default_health_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            failover_timeout: default_failover_timeout(),
            sticky_session: false,
            session_timeout: default_session_timeout(),
        }
    }
}

/// Server selection strategy.
///
/// Unrecognised names fall back to round robin.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    Random,
    Weighted,
    LeastConnections,
}

impl Algorithm {
    /// Parse a strategy name, defaulting to round robin for unknown names.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Algorithm::RoundRobin,
            "random" => Algorithm::Random,
            "weighted" => Algorithm::Weighted,
            "least_connections" => Algorithm::LeastConnections,
            other => {
                tracing::warn!(strategy = other, "unknown strategy, using round_robin");
                Algorithm::RoundRobin
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::Random => "random",
            Algorithm::Weighted => "weighted",
            Algorithm::LeastConnections => "least_connections",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Algorithm {
    fn from(name: String) -> Self {
        Algorithm::from_name(&name)
    }
}

impl From<Algorithm> for String {
    fn from(algorithm: Algorithm) -> Self {
        algorithm.as_str().to_string()
    }
}

/// Individual server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Unique server id
    pub id: String,

    /// Host name or IP address
    pub address: String,

    /// Port
    pub port: u16,

    /// Weight for weighted selection (default: 1, 0 = never picked by weight)
    #[serde(default = "default_weight")]
    pub weight: u32,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_failover_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_weight() -> u32 {
    1
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_balancer() {
        let config = BalancerConfig::default();
        assert_eq!(config.strategy, Algorithm::RoundRobin);
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.health_check_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert!(!config.sticky_session);
        assert_eq!(config.session_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_algorithm_serde() {
        let algo: Algorithm = serde_yaml::from_str("round_robin").unwrap();
        assert_eq!(algo, Algorithm::RoundRobin);

        let algo: Algorithm = serde_yaml::from_str("least_connections").unwrap();
        assert_eq!(algo, Algorithm::LeastConnections);

        let algo: Algorithm = serde_yaml::from_str("weighted").unwrap();
        assert_eq!(algo, Algorithm::Weighted);
    }

    #[test]
    fn test_unknown_algorithm_defaults_to_round_robin() {
        let algo: Algorithm = serde_yaml::from_str("fastest_first").unwrap();
        assert_eq!(algo, Algorithm::RoundRobin);
        assert_eq!(Algorithm::from_name(""), Algorithm::RoundRobin);
    }

    #[test]
    fn test_algorithm_serializes_as_name() {
        let yaml = serde_yaml::to_string(&Algorithm::Random).unwrap();
        assert_eq!(yaml.trim(), "random");
    }

    #[test]
    fn test_durations_parse() {
        let yaml = "health_check_interval: 250ms\nsession_timeout: 2m\n";
        let config: BalancerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.health_check_interval, Duration::from_millis(250));
        assert_eq!(config.session_timeout, Duration::from_secs(120));
        assert_eq!(config.health_check_timeout, Duration::from_secs(5));
    }
}
