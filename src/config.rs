//! Client configuration.
//!
//! All tuning enters through these structs; the engines read nothing from the
//! environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Intents;
use crate::rest::pool::LoadBalanceStrategy;

/// Top-level configuration for [`crate::Client`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bot token from the Discord Developer Portal. A leading `Bot ` prefix
    /// is stripped and re-added canonically.
    pub token: String,

    /// Application ID, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,

    /// Base URL for the REST API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Gateway URL override. When absent, `GET /gateway/bot` decides.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,

    /// Gateway intents bitmask.
    #[serde(default = "default_intents")]
    pub intents: u64,

    /// Shard tuple. Supplied externally; no discovery happens here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardConfig>,

    /// Initial presence sent with IDENTIFY.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<serde_json::Value>,

    /// User-Agent sent on every REST request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub rate_limit: RateLimitOptions,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_api_url() -> String {
    "https://discord.com/api/v10".into()
}

fn default_intents() -> u64 {
    Intents::DEFAULT.bits()
}

pub(crate) fn default_user_agent() -> String {
    format!(
        "Lanyard/{version} (https://github.com/joyshmitz/lanyard, {version}) Rust/{edition}",
        version = env!("CARGO_PKG_VERSION"),
        edition = "2021",
    )
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            application_id: None,
            api_url: default_api_url(),
            gateway_url: None,
            intents: default_intents(),
            shard: None,
            presence: None,
            user_agent: default_user_agent(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitOptions::default(),
            pool: PoolConfig::default(),
            circuit: CircuitConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Minimal config: a token and defaults for everything else.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }
}

/// Connect / read / total deadlines applied to every REST request unless the
/// request overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout", with = "duration_secs")]
    pub connect: Duration,

    #[serde(default = "default_read_timeout", with = "duration_secs")]
    pub read: Duration,

    #[serde(default = "default_total_timeout", with = "duration_secs")]
    pub total: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_total_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            read: default_read_timeout(),
            total: default_total_timeout(),
        }
    }
}

/// Default retry policy; individual requests may override it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum re-attempts after the first try. 429 re-queues do not count.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Multiply delays by `U(0.5, 1.5)`.
    #[serde(default = "default_retry_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_retry_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_retry_jitter(),
        }
    }
}

/// Bucket queueing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOptions {
    /// Emergency tokens per bucket window, consumable only by HIGH+ requests.
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u32,

    /// Total waiters a bucket will hold across all priorities.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// When the queue is full: drop the new request (`true`) or evict the
    /// lowest-priority tail (`false`).
    #[serde(default)]
    pub drop_on_limit: bool,

    /// Jitter factor applied to projected waits, `U(-1,1) * factor * wait`.
    #[serde(default = "default_wait_jitter")]
    pub jitter_factor: f64,
}

fn default_burst_capacity() -> u32 {
    2
}

fn default_max_queue_size() -> usize {
    256
}

fn default_wait_jitter() -> f64 {
    0.1
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            burst_capacity: default_burst_capacity(),
            max_queue_size: default_max_queue_size(),
            drop_on_limit: false,
            jitter_factor: default_wait_jitter(),
        }
    }
}

/// Connection-pool sizing and health policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Cap on non-emergency slots per endpoint.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle slots older than this are evicted by the sweep.
    #[serde(default = "default_max_idle", with = "duration_secs")]
    pub max_idle_time: Duration,

    /// A slot idle beyond this is considered dead even before the sweep.
    #[serde(default = "default_keepalive", with = "duration_secs")]
    pub keepalive_timeout: Duration,

    /// Cadence of the background health sweep.
    #[serde(default = "default_health_interval", with = "duration_secs")]
    pub health_check_interval: Duration,

    /// How to pick among idle slots.
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
}

fn default_max_connections() -> usize {
    16
}

fn default_max_idle() -> Duration {
    Duration::from_secs(60)
}

fn default_keepalive() -> Duration {
    Duration::from_secs(90)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_idle_time: default_max_idle(),
            keepalive_timeout: default_keepalive(),
            health_check_interval: default_health_interval(),
            strategy: LoadBalanceStrategy::default(),
        }
    }
}

/// Per-host circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_open_timeout", with = "duration_secs")]
    pub open_timeout: Duration,

    /// Probes admitted simultaneously while HALF_OPEN.
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_open_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_probes() -> u32 {
    1
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout: default_open_timeout(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

/// Gateway session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Member-list download threshold sent with IDENTIFY.
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u32,

    /// Deadline for HELLO after the socket opens.
    #[serde(default = "default_hello_timeout", with = "duration_secs")]
    pub hello_timeout: Duration,

    /// Reconnect ladder: first delay.
    #[serde(default = "default_reconnect_base", with = "duration_secs")]
    pub reconnect_base: Duration,

    /// Reconnect ladder: cap.
    #[serde(default = "default_reconnect_cap", with = "duration_secs")]
    pub reconnect_cap: Duration,

    /// Bound on the outbound command queue.
    #[serde(default = "default_command_queue")]
    pub command_queue_size: usize,
}

fn default_large_threshold() -> u32 {
    250
}

fn default_hello_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_reconnect_base() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_cap() -> Duration {
    Duration::from_secs(60)
}

fn default_command_queue() -> usize {
    128
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            large_threshold: default_large_threshold(),
            hello_timeout: default_hello_timeout(),
            reconnect_base: default_reconnect_base(),
            reconnect_cap: default_reconnect_cap(),
            command_queue_size: default_command_queue(),
        }
    }
}

/// Shard tuple: this connection handles guilds with `id % shard_count == shard_id`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShardConfig {
    pub shard_id: u32,
    pub shard_count: u32,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config: ClientConfig = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        assert_eq!(config.api_url, "https://discord.com/api/v10");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.timeouts.total, Duration::from_secs(60));
        assert!(config.shard.is_none());
    }

    #[test]
    fn default_intents_exclude_privileged() {
        let config = ClientConfig::new("t");
        let intents = Intents::from_bits(config.intents);
        assert!(!intents.contains(Intents::GUILD_MEMBERS));
        assert!(!intents.contains(Intents::GUILD_PRESENCES));
        assert!(!intents.contains(Intents::MESSAGE_CONTENT));
        assert!(intents.contains(Intents::GUILDS));
    }

    #[test]
    fn user_agent_has_library_prefix() {
        let ua = default_user_agent();
        assert!(ua.starts_with("Lanyard/"));
        assert!(ua.contains('('));
    }
}
