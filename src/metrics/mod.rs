//! Hub counters
//!
//! Lock-free counters bumped on the hot path and exported as a JSON
//! snapshot by the `/stats` route.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::HubError;

#[derive(Debug, Default)]
pub struct HubStats {
    connections_opened: AtomicU64,
    connections_active: AtomicU64,
    messages_routed: AtomicU64,
    rejected_rate_limited: AtomicU64,
    rejected_permission: AtomicU64,
    rejected_content: AtomicU64,
    rejected_other: AtomicU64,
    slow_consumer_evictions: AtomicU64,
    connections_reaped: AtomicU64,
    shard_forwards: AtomicU64,
    shard_deliveries: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub connections_opened: u64,
    pub connections_active: u64,
    pub messages_routed: u64,
    pub rejected_rate_limited: u64,
    pub rejected_permission: u64,
    pub rejected_content: u64,
    pub rejected_other: u64,
    pub slow_consumer_evictions: u64,
    pub connections_reaped: u64,
    pub shard_forwards: u64,
    pub shard_deliveries: u64,
    pub timestamp: DateTime<Utc>,
}

impl HubStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturate instead of wrapping if a close ever races an open
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn message_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejection(&self, error: &HubError) {
        let counter = match error {
            HubError::RateLimited(_) => &self.rejected_rate_limited,
            HubError::PermissionDenied(_) => &self.rejected_permission,
            HubError::ContentBlocked(_) => &self.rejected_content,
            _ => &self.rejected_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slow_consumer_evicted(&self) {
        self.slow_consumer_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_reaped(&self, count: usize) {
        self.connections_reaped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn shard_forwarded(&self) {
        self.shard_forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shard_delivered(&self) {
        self.shard_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_opened: load(&self.connections_opened),
            connections_active: load(&self.connections_active),
            messages_routed: load(&self.messages_routed),
            rejected_rate_limited: load(&self.rejected_rate_limited),
            rejected_permission: load(&self.rejected_permission),
            rejected_content: load(&self.rejected_content),
            rejected_other: load(&self.rejected_other),
            slow_consumer_evictions: load(&self.slow_consumer_evictions),
            connections_reaped: load(&self.connections_reaped),
            shard_forwards: load(&self.shard_forwards),
            shard_deliveries: load(&self.shard_deliveries),
            timestamp: Utc::now(),
        }
    }
}
