//! Rusty Hub - a real-time message hub implemented in Rust
//!
//! Accepts persistent WebSocket connections, organizes them into rooms and
//! fans routed events out to room members, with rate limiting, presence
//! tracking, moderation and room sharding.

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod storage;

// Re-export main components
pub use config::HubConfig;
pub use error::{HubError, Result};
