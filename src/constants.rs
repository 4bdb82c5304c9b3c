// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3030;
pub const WS_PATH: &str = "ws";

// Connection admission
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_MAX_CONNECTIONS_PER_USER: usize = 5;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

// Timeouts (seconds unless stated otherwise)
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REAPER_MAX_EVICTIONS: usize = 500;

// Presence
pub const DEFAULT_PRESENCE_GRACE_MILLIS: u64 = 2_000;
pub const DEFAULT_AWAY_THRESHOLD_SECS: u64 = 300;
pub const DEFAULT_PRESENCE_RETENTION_SECS: u64 = 3_600;

// Authorization cache
pub const DEFAULT_PERMISSION_CACHE_TTL_SECS: u64 = 30;
pub const DEFAULT_PERMISSION_CACHE_CAPACITY: usize = 10_000;

// Sharding
pub const DEFAULT_VIRTUAL_NODES_PER_SHARD: usize = 64;

// Rate limits, as (limit, window seconds)
pub const RATE_MESSAGE: (u32, u64) = (30, 60);
pub const RATE_TYPING: (u32, u64) = (60, 60);
pub const RATE_REACTION: (u32, u64) = (100, 60);
pub const RATE_DEFAULT: (u32, u64) = (50, 60);

// Moderation
pub const DEFAULT_SPAM_WINDOW_SECS: u64 = 10;
pub const DEFAULT_SPAM_REPEAT_THRESHOLD: usize = 3;
pub const DEFAULT_SPAM_BURST_THRESHOLD: usize = 10;
pub const DEFAULT_LINK_CHECK_TIMEOUT_MILLIS: u64 = 500;
pub const MAX_CONTENT_LENGTH: usize = 4000;
