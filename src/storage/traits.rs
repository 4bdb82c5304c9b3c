//! Abstract storage interfaces for the persistence collaborator
//!
//! The hub never owns durable state: message history is pushed to a sink
//! without waiting, and room metadata is read when a join misses locally.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::{RoomId, RoomKey, TenantId, UserId};
use crate::core::message_types::SequencedEvent;
use crate::core::room::RoomSpec;
use crate::error::Result;

/// A sequenced content message handed to the history store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub tenant_id: TenantId,
    pub room_id: RoomId,
    pub seq: u64,
    pub author_id: UserId,
    pub message_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_sequenced(sequenced: &SequencedEvent) -> Self {
        Self {
            tenant_id: sequenced.event.tenant_id.clone(),
            room_id: sequenced.event.room_id.clone(),
            seq: sequenced.seq,
            author_id: sequenced.event.author_id.clone(),
            message_type: sequenced.event.kind.clone(),
            payload: sequenced.event.payload.clone(),
            timestamp: sequenced.server_timestamp,
        }
    }

    pub fn room_key(&self) -> RoomKey {
        RoomKey::new(self.tenant_id.clone(), self.room_id.clone())
    }
}

/// Message history sink; called fire-and-forget after fan-out
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn store(&self, message: StoredMessage) -> Result<()>;
}

/// Source of truth for room metadata
#[async_trait]
pub trait RoomCatalog: Send + Sync {
    /// Look up a room unknown to this process
    async fn lookup(&self, tenant_id: &TenantId, room_id: &RoomId) -> Result<Option<RoomSpec>>;
}
