//! Shard routing: room ownership and cross-shard hand-off
//!
//! Rooms are placed on a consistent-hash ring with virtual nodes, so a
//! change in shard count only moves the rooms adjacent to the new points.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::core::ids::{RoomId, ShardId};
use crate::core::message_types::{RoutedEvent, SequencedEvent};
use crate::core::presence::PresenceChanged;
use crate::error::{HubError, Result};

/// Messages exchanged between shards over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardEnvelope {
    /// Unsequenced event handed to the owning shard
    Route { event: RoutedEvent },
    /// Event sequenced by its owner, for the shards' local members
    Deliver { event: SequencedEvent },
    Presence { origin: ShardId, change: PresenceChanged },
}

impl ShardEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// External publish/subscribe transport between shards
#[async_trait]
pub trait ShardBus: Send + Sync {
    /// Deliver to one shard's inbound queue
    async fn publish(&self, target: ShardId, payload: Vec<u8>) -> Result<()>;

    /// Deliver to every shard except `origin`
    async fn broadcast(&self, origin: ShardId, payload: Vec<u8>) -> Result<()>;

    /// Open the inbound queue of a shard
    async fn subscribe(&self, shard: ShardId) -> Result<mpsc::UnboundedReceiver<Vec<u8>>>;
}

/// Bus over in-process channels, for tests and single-process clusters
#[derive(Default)]
pub struct InMemoryBus {
    inboxes: RwLock<HashMap<ShardId, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShardBus for InMemoryBus {
    async fn publish(&self, target: ShardId, payload: Vec<u8>) -> Result<()> {
        let inboxes = self.inboxes.read().await;
        let inbox = inboxes
            .get(&target)
            .ok_or_else(|| HubError::UpstreamUnavailable(format!("{} has no subscriber", target)))?;
        inbox
            .send(payload)
            .map_err(|_| HubError::UpstreamUnavailable(format!("{} inbox is closed", target)))
    }

    async fn broadcast(&self, origin: ShardId, payload: Vec<u8>) -> Result<()> {
        let inboxes = self.inboxes.read().await;
        for (shard, inbox) in inboxes.iter().filter(|(shard, _)| **shard != origin) {
            if inbox.send(payload.clone()).is_err() {
                log::warn!("Inbox of {} is closed, skipping broadcast", shard);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, shard: ShardId) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inboxes.write().await.insert(shard, sender);
        Ok(receiver)
    }
}

fn ring_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Consistent-hash ring over shard ids
#[derive(Debug, Clone)]
pub struct HashRing {
    points: BTreeMap<u64, ShardId>,
}

impl HashRing {
    pub fn new(shard_count: u32, virtual_nodes: usize) -> Self {
        let mut points = BTreeMap::new();
        for shard in 0..shard_count.max(1) {
            for node in 0..virtual_nodes.max(1) {
                points.insert(ring_hash(&format!("shard-{}#{}", shard, node)), ShardId(shard));
            }
        }
        Self { points }
    }

    pub fn owner_of(&self, room_id: &RoomId) -> ShardId {
        let hash = ring_hash(room_id.as_str());
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, shard)| *shard)
            .unwrap_or(ShardId(0))
    }
}

/// Where an event ended up after `forward`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// This shard owns the room; process it here
    Local,
    Forwarded(ShardId),
}

/// Maps rooms to owning shards and hands events to them
pub struct ShardRouter {
    local: ShardId,
    ring: HashRing,
    bus: Option<Arc<dyn ShardBus>>,
}

impl ShardRouter {
    pub fn new(
        local: ShardId,
        shard_count: u32,
        virtual_nodes: usize,
        bus: Option<Arc<dyn ShardBus>>,
    ) -> Self {
        Self {
            local,
            ring: HashRing::new(shard_count, virtual_nodes),
            bus,
        }
    }

    /// One shard owning every room
    pub fn standalone() -> Self {
        Self::new(ShardId(0), 1, 1, None)
    }

    pub fn local_shard(&self) -> ShardId {
        self.local
    }

    pub fn owner_of(&self, room_id: &RoomId) -> ShardId {
        self.ring.owner_of(room_id)
    }

    pub fn is_local(&self, room_id: &RoomId) -> bool {
        self.owner_of(room_id) == self.local
    }

    /// Hand an event to its owning shard unless it is owned here
    pub async fn forward(&self, event: &RoutedEvent) -> Result<ForwardOutcome> {
        let owner = self.owner_of(&event.room_id);
        if owner == self.local {
            return Ok(ForwardOutcome::Local);
        }
        let bus = self.bus.as_ref().ok_or_else(|| {
            HubError::UpstreamUnavailable(format!("no bus to reach {}", owner))
        })?;
        let payload = ShardEnvelope::Route { event: event.clone() }.encode()?;
        bus.publish(owner, payload).await?;
        log::debug!("Forwarded {} event for room {} to {}", event.kind, event.room_id, owner);
        Ok(ForwardOutcome::Forwarded(owner))
    }

    /// Publish a sequenced event to the other shards' local members
    pub async fn publish_delivery(&self, event: &SequencedEvent) -> Result<()> {
        self.broadcast(ShardEnvelope::Deliver { event: event.clone() }).await
    }

    pub async fn publish_presence(&self, change: &PresenceChanged) -> Result<()> {
        self.broadcast(ShardEnvelope::Presence {
            origin: self.local,
            change: change.clone(),
        })
        .await
    }

    async fn broadcast(&self, envelope: ShardEnvelope) -> Result<()> {
        match &self.bus {
            Some(bus) => bus.broadcast(self.local, envelope.encode()?).await,
            None => Ok(()),
        }
    }

    /// Inbound queue of this shard; `None` without a bus
    pub async fn subscribe(&self) -> Result<Option<mpsc::UnboundedReceiver<Vec<u8>>>> {
        match &self.bus {
            Some(bus) => Ok(Some(bus.subscribe(self.local).await?)),
            None => Ok(None),
        }
    }
}
