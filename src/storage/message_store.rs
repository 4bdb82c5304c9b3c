//! Simple in-memory storage for recent messages
//!
//! A bounded circular buffer per room; the oldest message is dropped once
//! a room reaches capacity. Nothing is persisted to disk.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::core::ids::RoomKey;
use crate::error::Result;
use crate::storage::traits::{MessageSink, StoredMessage};

/// Maximum number of messages to keep per room
const DEFAULT_MAX_MESSAGES: usize = 100;

/// In-memory message history with a per-room capacity
pub struct InMemoryMessageStore {
    rooms: RwLock<HashMap<RoomKey, VecDeque<StoredMessage>>>,
    max_per_room: usize,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_MESSAGES)
    }

    pub fn with_capacity(max_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_per_room: max_per_room.max(1),
        }
    }

    /// Most recent messages of a room, oldest first
    pub async fn recent_messages(&self, key: &RoomKey, limit: usize) -> Vec<StoredMessage> {
        let rooms = self.rooms.read().await;
        let Some(messages) = rooms.get(key) else {
            return Vec::new();
        };
        let skip = messages.len().saturating_sub(limit);
        messages.iter().skip(skip).cloned().collect()
    }

    /// Messages with a sequence number above `after_seq`, for gap repair
    pub async fn messages_since(&self, key: &RoomKey, after_seq: u64) -> Vec<StoredMessage> {
        self.rooms
            .read()
            .await
            .get(key)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|message| message.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn count(&self, key: &RoomKey) -> usize {
        self.rooms
            .read()
            .await
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageSink for InMemoryMessageStore {
    async fn store(&self, message: StoredMessage) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let messages = rooms.entry(message.room_key()).or_default();
        if messages.len() >= self.max_per_room {
            messages.pop_front();
        }
        messages.push_back(message);
        Ok(())
    }
}
