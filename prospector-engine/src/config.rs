//! Engine configuration using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: PROSPECTOR_)
//! 2. Current working directory: ./prospector.toml
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Service-level settings
    #[serde(default)]
    pub service: ServiceSettings,

    /// Job queue settings
    #[serde(default)]
    pub queue: QueueSettings,

    /// Worker pool sizing
    #[serde(default)]
    pub pools: PoolSettings,

    /// DNS probing defaults
    #[serde(default)]
    pub dns: DnsSettings,

    /// HTTP probing defaults
    #[serde(default)]
    pub http: HttpSettings,

    /// Database configuration (optional)
    #[serde(default)]
    pub database: Option<DatabaseSettings>,

    /// NATS configuration (optional)
    #[serde(default)]
    pub nats: Option<NatsSettings>,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Instance name, used as the worker id prefix on job claims
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

/// Durable queue behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Ready-set size above which enqueues are rejected
    #[serde(default = "default_watermark")]
    pub watermark: usize,

    /// Bounded wait before an over-watermark enqueue gives up, in milliseconds
    #[serde(default = "default_enqueue_wait_ms")]
    pub enqueue_wait_ms: u64,

    /// Delivery attempts before a job is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay of the exponential retry backoff, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling, in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Lease granted on claim, in seconds
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,

    /// Worker poll interval when the queue is empty, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Reaper sweep interval for expired claims, in milliseconds
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            watermark: default_watermark(),
            enqueue_wait_ms: default_enqueue_wait_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            claim_lease_secs: default_claim_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
        }
    }
}

impl QueueSettings {
    /// Claim lease as a [`Duration`]
    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    /// Poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Worker pool sizing, fixed at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_generation_workers")]
    pub generation_workers: usize,

    #[serde(default = "default_dns_workers")]
    pub dns_workers: usize,

    #[serde(default = "default_http_workers")]
    pub http_workers: usize,

    #[serde(default = "default_analysis_workers")]
    pub analysis_workers: usize,

    /// Domains per enqueued batch job
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// In-flight resolves a single DNS worker may hold
    #[serde(default = "default_dns_fanout")]
    pub dns_fanout: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            generation_workers: default_generation_workers(),
            dns_workers: default_dns_workers(),
            http_workers: default_http_workers(),
            analysis_workers: default_analysis_workers(),
            batch_size: default_batch_size(),
            dns_fanout: default_dns_fanout(),
        }
    }
}

/// DNS probing defaults applied when a persona leaves them unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSettings {
    /// Per-resolve timeout, in milliseconds
    #[serde(default = "default_dns_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_dns_timeout_ms(),
        }
    }
}

/// HTTP probing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Response bodies are truncated past this many bytes
    #[serde(default = "default_body_cap_bytes")]
    pub body_cap_bytes: usize,

    /// Matches recorded per keyword rule before matching stops
    #[serde(default = "default_match_cap")]
    pub match_cap: usize,

    /// Hard request timeout applied when a persona leaves it unset, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            body_cap_bytes: default_body_cap_bytes(),
            match_cap: default_match_cap(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_connect_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsSettings {
    /// NATS server URL
    pub url: String,

    /// Connection name
    #[serde(default)]
    pub name: Option<String>,

    /// Maximum retry attempts for the initial connection
    #[serde(default = "default_connect_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_service_name() -> String {
    "prospector-engine".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_watermark() -> usize {
    100_000
}

fn default_enqueue_wait_ms() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_cap_ms() -> u64 {
    300_000
}

fn default_claim_lease_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_reaper_interval_ms() -> u64 {
    5_000
}

fn default_generation_workers() -> usize {
    4
}

fn default_dns_workers() -> usize {
    32
}

fn default_http_workers() -> usize {
    16
}

fn default_analysis_workers() -> usize {
    2
}

fn default_batch_size() -> usize {
    100
}

fn default_dns_fanout() -> usize {
    8
}

fn default_dns_timeout_ms() -> u64 {
    3_000
}

fn default_body_cap_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_match_cap() -> usize {
    100
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_max_connections() -> u32 {
    20
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_connect_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

impl EngineConfig {
    /// Load configuration from `./prospector.toml` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("prospector.toml")
    }

    /// Load configuration from an explicit TOML path and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PROSPECTOR_").split("__"))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_declared_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.queue.watermark, 100_000);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.backoff_base_ms, 2_000);
        assert_eq!(config.queue.backoff_cap_ms, 300_000);
        assert_eq!(config.queue.poll_interval_ms, 500);
        assert_eq!(config.pools.dns_workers, 32);
        assert_eq!(config.http.body_cap_bytes, 4 * 1024 * 1024);
        assert_eq!(config.http.match_cap, 100);
    }

    #[test]
    fn test_duration_helpers() {
        let queue = QueueSettings::default();
        assert_eq!(queue.claim_lease(), Duration::from_secs(60));
        assert_eq!(queue.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_toml_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "prospector.toml",
                r#"
                [service]
                name = "engine-a"

                [pools]
                dns_workers = 8
                "#,
            )?;
            let config = EngineConfig::load().expect("config should load");
            assert_eq!(config.service.name, "engine-a");
            assert_eq!(config.pools.dns_workers, 8);
            // Untouched sections keep their defaults.
            assert_eq!(config.pools.http_workers, 16);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "prospector.toml",
                r#"
                [queue]
                watermark = 10
                "#,
            )?;
            jail.set_env("PROSPECTOR_QUEUE__WATERMARK", "42");
            let config = EngineConfig::load().expect("config should load");
            assert_eq!(config.queue.watermark, 42);
            Ok(())
        });
    }
}
