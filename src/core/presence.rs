//! Presence tracking derived from connection lifecycle
//!
//! A user is online while at least one connection is live. Going offline is
//! debounced by a grace period so reconnect flapping emits nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::core::ids::{RoomKey, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Broadcast-worthy presence transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChanged {
    pub user_id: UserId,
    pub status: PresenceStatus,
    /// Rooms interested in this user
    pub rooms: Vec<RoomKey>,
    pub last_seen: DateTime<Utc>,
}

/// Point-in-time view of a user's presence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub status: PresenceStatus,
    pub live_connections: usize,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug)]
struct PresenceRecord {
    status: PresenceStatus,
    live_connections: usize,
    last_seen: DateTime<Utc>,
    last_activity: Instant,
    /// Set when the user went offline; drives pruning
    offline_since: Option<Instant>,
    rooms: HashSet<RoomKey>,
    /// Bumped whenever a pending offline transition is scheduled or cancelled
    generation: u64,
    pending_offline: bool,
}

impl PresenceRecord {
    fn new() -> Self {
        Self {
            status: PresenceStatus::Offline,
            live_connections: 0,
            last_seen: Utc::now(),
            last_activity: Instant::now(),
            offline_since: None,
            rooms: HashSet::new(),
            generation: 0,
            pending_offline: false,
        }
    }

    fn event(&self, user_id: &UserId) -> PresenceChanged {
        let mut rooms: Vec<RoomKey> = self.rooms.iter().cloned().collect();
        rooms.sort();
        PresenceChanged {
            user_id: user_id.clone(),
            status: self.status,
            rooms,
            last_seen: self.last_seen,
        }
    }
}

struct PresenceInner {
    records: RwLock<HashMap<UserId, PresenceRecord>>,
    events: mpsc::UnboundedSender<PresenceChanged>,
    grace: Duration,
    away_threshold: Duration,
}

impl PresenceInner {
    fn emit(&self, event: PresenceChanged) {
        log::debug!("Presence of {} is now {:?}", event.user_id, event.status);
        if self.events.send(event).is_err() {
            log::trace!("Presence event dropped: no consumer");
        }
    }
}

/// Reference-counted presence per user
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

impl PresenceTracker {
    /// Create a tracker and the receiving end of its event stream
    pub fn new(
        grace: Duration,
        away_threshold: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PresenceChanged>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let tracker = Self {
            inner: Arc::new(PresenceInner {
                records: RwLock::new(HashMap::new()),
                events,
                grace,
                away_threshold,
            }),
        };
        (tracker, receiver)
    }

    /// A connection of `user_id` went live
    pub async fn on_connect(&self, user_id: &UserId) {
        let mut records = self.inner.records.write().await;
        let record = records
            .entry(user_id.clone())
            .or_insert_with(PresenceRecord::new);
        record.live_connections += 1;
        record.last_activity = Instant::now();
        record.offline_since = None;
        record.last_seen = Utc::now();

        if record.live_connections > 1 {
            return;
        }
        if record.pending_offline {
            // Reconnected inside the grace period: nobody saw the user leave
            record.pending_offline = false;
            record.generation += 1;
            if record.status == PresenceStatus::Online {
                return;
            }
        }
        if record.status != PresenceStatus::Online {
            record.status = PresenceStatus::Online;
            self.inner.emit(record.event(user_id));
        }
    }

    /// A connection of `user_id` was destroyed; `rooms` are the rooms it had joined
    pub async fn on_disconnect(&self, user_id: &UserId, rooms: impl IntoIterator<Item = RoomKey>) {
        let generation = {
            let mut records = self.inner.records.write().await;
            let Some(record) = records.get_mut(user_id) else {
                return;
            };
            record.rooms.extend(rooms);
            record.last_seen = Utc::now();
            record.live_connections = record.live_connections.saturating_sub(1);
            if record.live_connections > 0 || record.pending_offline {
                return;
            }
            record.pending_offline = true;
            record.generation += 1;
            record.generation
        };

        let inner = self.inner.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.grace).await;
            let mut records = inner.records.write().await;
            let Some(record) = records.get_mut(&user_id) else {
                return;
            };
            if !record.pending_offline
                || record.generation != generation
                || record.live_connections > 0
            {
                return;
            }
            record.pending_offline = false;
            record.status = PresenceStatus::Offline;
            record.offline_since = Some(Instant::now());
            let event = record.event(&user_id);
            record.rooms.clear();
            inner.emit(event);
        });
    }

    /// Remember rooms that should hear about this user's transitions
    pub async fn note_rooms(&self, user_id: &UserId, rooms: impl IntoIterator<Item = RoomKey>) {
        if let Some(record) = self.inner.records.write().await.get_mut(user_id) {
            record.rooms.extend(rooms);
        }
    }

    pub async fn forget_room(&self, user_id: &UserId, key: &RoomKey) {
        if let Some(record) = self.inner.records.write().await.get_mut(user_id) {
            record.rooms.remove(key);
        }
    }

    /// Inbound activity; brings an away user back online
    pub async fn on_activity(&self, user_id: &UserId) {
        let mut records = self.inner.records.write().await;
        let Some(record) = records.get_mut(user_id) else {
            return;
        };
        record.last_activity = Instant::now();
        record.last_seen = Utc::now();
        if record.status == PresenceStatus::Away && record.live_connections > 0 {
            record.status = PresenceStatus::Online;
            self.inner.emit(record.event(user_id));
        }
    }

    /// Move inactive online users to away; returns how many changed
    pub async fn sweep_away(&self, now: Instant) -> usize {
        let mut records = self.inner.records.write().await;
        let mut changed = 0;
        for (user_id, record) in records.iter_mut() {
            let inactive = now.saturating_duration_since(record.last_activity);
            if record.status == PresenceStatus::Online
                && record.live_connections > 0
                && inactive > self.inner.away_threshold
            {
                record.status = PresenceStatus::Away;
                self.inner.emit(record.event(user_id));
                changed += 1;
            }
        }
        changed
    }

    /// Drop records of users offline for longer than `retention`; returns how many
    pub async fn prune_offline(&self, now: Instant, retention: Duration) -> usize {
        let mut records = self.inner.records.write().await;
        let before = records.len();
        records.retain(|_, record| match record.offline_since {
            Some(since) if record.live_connections == 0 && !record.pending_offline => {
                now.saturating_duration_since(since) <= retention
            }
            _ => true,
        });
        before - records.len()
    }

    pub async fn status(&self, user_id: &UserId) -> PresenceStatus {
        self.inner
            .records
            .read()
            .await
            .get(user_id)
            .map(|record| record.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub async fn snapshot(&self, user_id: &UserId) -> Option<PresenceSnapshot> {
        self.inner
            .records
            .read()
            .await
            .get(user_id)
            .map(|record| PresenceSnapshot {
                status: record.status,
                live_connections: record.live_connections,
                last_seen: record.last_seen,
            })
    }

    pub async fn online_count(&self) -> usize {
        self.inner
            .records
            .read()
            .await
            .values()
            .filter(|record| record.status != PresenceStatus::Offline)
            .count()
    }
}
