//! Hub configuration module
//! Handles dynamic configuration parameters for the message hub

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::*;
use crate::core::moderation::{FailurePolicy, ModerationConfig};
use crate::core::rate_limiter::{RatePolicy, RateRule};
use crate::error::{HubError, Result};

/// Hub configuration parameters
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    /// Process-wide connection cap
    pub max_connections: usize,
    /// Simultaneous connections allowed for a single user
    pub max_connections_per_user: usize,
    /// Outbound frames buffered per connection before it counts as a slow consumer
    pub outbound_queue_capacity: usize,
    /// Upper bound for a single socket write
    pub send_timeout: Duration,
    /// Upper bound for the authentication handshake
    pub auth_timeout: Duration,
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
    /// Evictions performed by a single reaper sweep
    pub reaper_max_evictions: usize,
    /// Delay before a user without connections is declared offline
    pub presence_grace: Duration,
    pub away_threshold: Duration,
    /// How long an offline user's presence record is kept before it is pruned
    pub presence_retention: Duration,
    /// Deliver routed events back to the originating connection
    pub echo_to_sender: bool,
    /// Create a public room when a join targets an unknown id
    pub auto_create_public_rooms: bool,
    pub permission_cache_ttl: Duration,
    pub permission_cache_capacity: usize,
    pub shard_id: u32,
    pub shard_count: u32,
    pub virtual_nodes_per_shard: usize,
    pub rate_policy: RatePolicy,
    pub moderation: ModerationConfig,
    /// JWT secret for handshake validation (only the binary requires it)
    pub jwt_secret: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ws_path: WS_PATH.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_user: DEFAULT_MAX_CONNECTIONS_PER_USER,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            reaper_max_evictions: DEFAULT_REAPER_MAX_EVICTIONS,
            presence_grace: Duration::from_millis(DEFAULT_PRESENCE_GRACE_MILLIS),
            away_threshold: Duration::from_secs(DEFAULT_AWAY_THRESHOLD_SECS),
            presence_retention: Duration::from_secs(DEFAULT_PRESENCE_RETENTION_SECS),
            echo_to_sender: false,
            auto_create_public_rooms: true,
            permission_cache_ttl: Duration::from_secs(DEFAULT_PERMISSION_CACHE_TTL_SECS),
            permission_cache_capacity: DEFAULT_PERMISSION_CACHE_CAPACITY,
            shard_id: 0,
            shard_count: 1,
            virtual_nodes_per_shard: DEFAULT_VIRTUAL_NODES_PER_SHARD,
            rate_policy: RatePolicy::default(),
            moderation: ModerationConfig::default(),
            jwt_secret: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|v| {
        v.split(',')
            .map(|item| item.trim().to_lowercase())
            .filter(|item| !item.is_empty())
            .collect()
    })
}

fn env_failure_policy(key: &str) -> Result<Option<FailurePolicy>> {
    match env::var(key) {
        Ok(value) => value.parse().map(Some),
        Err(_) => Ok(None),
    }
}

impl HubConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = env::var("RUSTY_HUB_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("RUSTY_HUB_PORT") {
            config.port = port;
        }
        if let Ok(path) = env::var("RUSTY_HUB_WS_PATH") {
            config.ws_path = path.trim_matches('/').to_string();
        }
        if let Some(max) = env_parse("RUSTY_HUB_MAX_CONN") {
            config.max_connections = max;
        }
        if let Some(max) = env_parse("RUSTY_HUB_MAX_CONN_PER_USER") {
            config.max_connections_per_user = max;
        }
        if let Some(capacity) = env_parse("RUSTY_HUB_OUTBOUND_QUEUE") {
            config.outbound_queue_capacity = capacity;
        }
        if let Some(ms) = env_parse("RUSTY_HUB_SEND_TIMEOUT_MS") {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("RUSTY_HUB_AUTH_TIMEOUT") {
            config.auth_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("RUSTY_HUB_IDLE_TIMEOUT") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("RUSTY_HUB_REAPER_INTERVAL") {
            config.reaper_interval = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse("RUSTY_HUB_REAPER_MAX_EVICTIONS") {
            config.reaper_max_evictions = max;
        }
        if let Some(ms) = env_parse("RUSTY_HUB_PRESENCE_GRACE_MS") {
            config.presence_grace = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("RUSTY_HUB_AWAY_THRESHOLD") {
            config.away_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("RUSTY_HUB_PRESENCE_RETENTION") {
            config.presence_retention = Duration::from_secs(secs);
        }
        if let Some(echo) = env_flag("RUSTY_HUB_ECHO_TO_SENDER") {
            config.echo_to_sender = echo;
        }
        if let Some(auto) = env_flag("RUSTY_HUB_AUTO_CREATE_ROOMS") {
            config.auto_create_public_rooms = auto;
        }
        if let Some(secs) = env_parse("RUSTY_HUB_PERMISSION_CACHE_TTL") {
            config.permission_cache_ttl = Duration::from_secs(secs);
        }
        if let Some(capacity) = env_parse("RUSTY_HUB_PERMISSION_CACHE_CAPACITY") {
            config.permission_cache_capacity = capacity;
        }
        if let Some(id) = env_parse("RUSTY_HUB_SHARD_ID") {
            config.shard_id = id;
        }
        if let Some(count) = env_parse("RUSTY_HUB_SHARD_COUNT") {
            config.shard_count = count;
        }
        if let Some(vnodes) = env_parse("RUSTY_HUB_VIRTUAL_NODES") {
            config.virtual_nodes_per_shard = vnodes;
        }

        config.rate_policy = Self::rate_policy_from_env(config.rate_policy)?;
        config.moderation = Self::moderation_from_env(config.moderation)?;

        config.jwt_secret = env::var("RUSTY_HUB_JWT_SECRET")
            .or_else(|_| env::var("JWT_SECRET"))
            .ok();

        config.validate()?;
        Ok(config)
    }

    /// Overrides the policy table from `RUSTY_HUB_RATE_<TYPE>=<limit>/<window_secs>`
    fn rate_policy_from_env(mut policy: RatePolicy) -> Result<RatePolicy> {
        for (key, value) in env::vars() {
            let Some(kind) = key.strip_prefix("RUSTY_HUB_RATE_") else {
                continue;
            };
            let rule: RateRule = value.parse()?;
            if kind == "DEFAULT" {
                policy.fallback = rule;
            } else {
                policy.set_rule(&kind.to_lowercase(), rule);
            }
        }
        Ok(policy)
    }

    fn moderation_from_env(mut moderation: ModerationConfig) -> Result<ModerationConfig> {
        if let Some(words) = env_list("RUSTY_HUB_BLOCKLIST") {
            moderation.blocklist = words;
        }
        if let Some(domains) = env_list("RUSTY_HUB_BLOCKED_DOMAINS") {
            moderation.blocked_domains = domains;
        }
        if let Some(secs) = env_parse("RUSTY_HUB_SPAM_WINDOW") {
            moderation.spam_window = Duration::from_secs(secs);
        }
        if let Some(threshold) = env_parse("RUSTY_HUB_SPAM_REPEAT_THRESHOLD") {
            moderation.spam_repeat_threshold = threshold;
        }
        if let Some(threshold) = env_parse("RUSTY_HUB_SPAM_BURST_THRESHOLD") {
            moderation.spam_burst_threshold = threshold;
        }
        if let Some(ms) = env_parse("RUSTY_HUB_LINK_CHECK_TIMEOUT_MS") {
            moderation.link_check_timeout = Duration::from_millis(ms);
        }
        if let Some(policy) = env_failure_policy("RUSTY_HUB_LINK_CHECK_FAILURE")? {
            moderation.link_failure_policy = policy;
        }
        Ok(moderation)
    }

    /// Reject settings the hub cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 || self.max_connections_per_user == 0 {
            return Err(HubError::Config(
                "connection caps must be greater than zero".to_string(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(HubError::Config(
                "outbound queue capacity must be greater than zero".to_string(),
            ));
        }
        if self.shard_count == 0 || self.shard_id >= self.shard_count {
            return Err(HubError::Config(format!(
                "shard id {} is outside 0..{}",
                self.shard_id, self.shard_count
            )));
        }
        if self.virtual_nodes_per_shard == 0 {
            return Err(HubError::Config(
                "virtual nodes per shard must be greater than zero".to_string(),
            ));
        }
        if self.reaper_interval.is_zero() || self.idle_timeout.is_zero() {
            return Err(HubError::Config(
                "reaper interval and idle timeout must be non-zero".to_string(),
            ));
        }
        if self.reaper_max_evictions == 0 {
            return Err(HubError::Config(
                "reaper max evictions must be greater than zero".to_string(),
            ));
        }
        self.rate_policy.validate()
    }
}
