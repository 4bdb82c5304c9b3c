//! Core functionality of the message hub

pub mod connection;
pub mod ids;
pub mod message_types;
pub mod moderation;
pub mod presence;
pub mod rate_limiter;
pub mod reaper;
pub mod registry;
pub mod room;
pub mod router;
pub mod shard;

// Re-export main components for convenience
pub use connection::{Connection, ConnectionHandle, SendOutcome};
pub use ids::{ConnectionId, RoomId, RoomKey, ShardId, TenantId, UserId};
pub use message_types::{ClientFrame, ServerFrame};
pub use moderation::{ModerationGate, Verdict};
pub use presence::{PresenceChanged, PresenceStatus, PresenceTracker};
pub use rate_limiter::{RateDecision, RateLimiter, RatePolicy};
pub use reaper::IdleReaper;
pub use registry::ConnectionRegistry;
pub use room::{MemberRole, RoomRegistry, RoomSpec, RoomType};
pub use router::{MessageRouter, SharedRouter};
pub use shard::{InMemoryBus, ShardBus, ShardRouter};
