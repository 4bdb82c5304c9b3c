//! Message router: the single choke point of the hub
//!
//! Every membership change and every routed event goes through here. A
//! routed event walks `touch -> rate check -> permission -> moderation ->
//! sequence -> fan-out` and stops at the first rejection.
//!
//! Lock order: a room's sequencer may be held while reading the registries,
//! never the other way around. Membership changes hold the room registry
//! write lock and may read the connection registry inside it.

use chrono::Utc;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::auth::cache::CachedAuthorizer;
use crate::auth::provider::{Action, AuthProvider, Identity};
use crate::config::HubConfig;
use crate::constants::MAX_CONTENT_LENGTH;
use crate::core::connection::{Connection, ConnectionHandle, Outbound, SendOutcome};
use crate::core::ids::{ConnectionId, RoomId, RoomKey, ShardId, UserId};
use crate::core::message_types::{ClientFrame, FrameKind, RoutedEvent, SequencedEvent, ServerFrame};
use crate::core::moderation::{LinkReputation, ModerationGate, Verdict};
use crate::core::presence::{PresenceChanged, PresenceTracker};
use crate::core::rate_limiter::{RateDecision, RateLimiter};
use crate::core::registry::ConnectionRegistry;
use crate::core::room::{JoinOutcome, MemberRole, RoomRegistry, RoomSpec};
use crate::core::shard::{ForwardOutcome, ShardBus, ShardEnvelope, ShardRouter};
use crate::error::{HubError, Result};
use crate::metrics::HubStats;
use crate::storage::traits::{MessageSink, RoomCatalog, StoredMessage};

pub type SharedRouter = Arc<MessageRouter>;

/// Assembles a router and starts its background pumps
pub struct RouterBuilder {
    config: HubConfig,
    authorizer: Option<Arc<dyn AuthProvider>>,
    bus: Option<Arc<dyn ShardBus>>,
    catalog: Option<Arc<dyn RoomCatalog>>,
    sink: Option<Arc<dyn MessageSink>>,
    reputation: Option<Arc<dyn LinkReputation>>,
    moderation: Option<ModerationGate>,
    stats: Option<Arc<HubStats>>,
}

impl RouterBuilder {
    /// Permission queries go through a TTL cache in front of `authorizer`
    pub fn authorizer(mut self, authorizer: Arc<dyn AuthProvider>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn ShardBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn RoomCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn link_reputation(mut self, reputation: Arc<dyn LinkReputation>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    /// Replace the pipeline built from the moderation config
    pub fn moderation(mut self, gate: ModerationGate) -> Self {
        self.moderation = Some(gate);
        self
    }

    pub fn stats(mut self, stats: Arc<HubStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub async fn build(self) -> Result<SharedRouter> {
        let config = self.config;
        config.validate()?;

        let authorizer = self.authorizer.map(|inner| {
            Arc::new(CachedAuthorizer::new(
                inner,
                config.permission_cache_capacity,
                config.permission_cache_ttl,
            ))
        });
        let moderation = self
            .moderation
            .unwrap_or_else(|| ModerationGate::from_config(&config.moderation, self.reputation));
        let (presence, presence_events) =
            PresenceTracker::new(config.presence_grace, config.away_threshold);
        let shards = ShardRouter::new(
            ShardId(config.shard_id),
            config.shard_count,
            config.virtual_nodes_per_shard,
            self.bus,
        );
        let inbound = shards.subscribe().await?;

        let router = Arc::new(MessageRouter {
            connections: ConnectionRegistry::new(
                config.max_connections,
                config.max_connections_per_user,
                config.outbound_queue_capacity,
            ),
            rooms: RoomRegistry::new(),
            rate_limiter: RateLimiter::new(config.rate_policy.clone()),
            presence,
            moderation,
            authorizer,
            shards,
            catalog: self.catalog,
            sink: self.sink,
            stats: self.stats.unwrap_or_default(),
            echo_to_sender: config.echo_to_sender,
            auto_create_public_rooms: config.auto_create_public_rooms,
        });

        spawn_presence_pump(Arc::downgrade(&router), presence_events);
        if let Some(inbound) = inbound {
            spawn_shard_pump(Arc::downgrade(&router), inbound);
        }
        log::info!(
            "Message router ready on {} (echo: {})",
            router.shards.local_shard(),
            router.echo_to_sender
        );
        Ok(router)
    }
}

fn spawn_presence_pump(
    router: Weak<MessageRouter>,
    mut events: mpsc::UnboundedReceiver<PresenceChanged>,
) {
    tokio::spawn(async move {
        while let Some(change) = events.recv().await {
            let Some(router) = router.upgrade() else {
                break;
            };
            if let Err(e) = router.shards.publish_presence(&change).await {
                log::warn!(
                    "Failed to publish presence of {} to other shards: {}",
                    change.user_id,
                    e
                );
            }
            router.broadcast_presence(&change).await;
        }
        log::debug!("Presence pump stopped");
    });
}

fn spawn_shard_pump(router: Weak<MessageRouter>, mut inbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(bytes) = inbound.recv().await {
            let Some(router) = router.upgrade() else {
                break;
            };
            match ShardEnvelope::decode(&bytes) {
                Ok(envelope) => router.handle_envelope(envelope).await,
                Err(e) => log::warn!("Dropping undecodable shard envelope: {}", e),
            }
        }
        log::debug!("Shard inbound pump stopped");
    });
}

/// Orchestrates registries, policy checks and fan-out
pub struct MessageRouter {
    connections: ConnectionRegistry,
    rooms: RoomRegistry,
    rate_limiter: RateLimiter,
    presence: PresenceTracker,
    moderation: ModerationGate,
    authorizer: Option<Arc<CachedAuthorizer>>,
    shards: ShardRouter,
    catalog: Option<Arc<dyn RoomCatalog>>,
    sink: Option<Arc<dyn MessageSink>>,
    stats: Arc<HubStats>,
    echo_to_sender: bool,
    auto_create_public_rooms: bool,
}

impl MessageRouter {
    pub fn builder(config: HubConfig) -> RouterBuilder {
        RouterBuilder {
            config,
            authorizer: None,
            bus: None,
            catalog: None,
            sink: None,
            reputation: None,
            moderation: None,
            stats: None,
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn moderation(&self) -> &ModerationGate {
        &self.moderation
    }

    pub fn shards(&self) -> &ShardRouter {
        &self.shards
    }

    pub fn stats(&self) -> &Arc<HubStats> {
        &self.stats
    }

    // ---- connection lifecycle ----

    /// Admit an authenticated session
    pub async fn register(
        &self,
        identity: Identity,
    ) -> Result<(Arc<Connection>, ConnectionHandle)> {
        let (connection, handle) = self.connections.register(identity).await?;
        self.stats.connection_opened();
        self.presence.on_connect(connection.user_id()).await;
        log::info!(
            "Connection {} opened for {}@{}",
            connection.id,
            connection.user_id(),
            connection.tenant_id()
        );
        Ok((connection, handle))
    }

    /// Destroy a connection: leave every joined room, drop its rate state and
    /// notify presence. Only the first call for an id does anything.
    pub async fn remove(&self, connection_id: &ConnectionId) -> bool {
        let Some(connection) = self.connections.remove(connection_id).await else {
            return false;
        };
        let user_id = connection.user_id().clone();

        let (joined, emptied) = {
            let mut membership = self.rooms.membership().await;
            let joined: Vec<RoomKey> = connection
                .take_rooms()
                .iter()
                .map(|room_id| connection.room_key(room_id))
                .collect();
            let emptied: Vec<RoomKey> = joined
                .iter()
                .filter(|key| membership.leave(key, connection_id))
                .cloned()
                .collect();
            (joined, emptied)
        };

        connection.mark_unhealthy();
        self.rate_limiter.forget(connection_id).await;
        self.presence.on_disconnect(&user_id, joined.iter().cloned()).await;
        self.stats.connection_closed();

        for key in &emptied {
            let frame = ServerFrame::member_left(&key.room_id, &user_id, Some("disconnected"));
            // Failed targets here are already unhealthy; the reaper collects them
            self.send_to_room(key, &frame, None).await;
        }
        log::info!(
            "Connection {} of {} removed ({} rooms left)",
            connection_id,
            user_id,
            joined.len()
        );
        true
    }

    async fn evict(&self, failed: Vec<ConnectionId>) {
        for connection_id in failed {
            if self.remove(&connection_id).await {
                log::warn!("Evicted connection {} after a failed send", connection_id);
            }
        }
    }

    // ---- membership ----

    /// Make sure a room exists locally: catalog first, then auto-create
    async fn resolve_room(&self, key: &RoomKey) -> Result<()> {
        if self.rooms.contains(key).await {
            return Ok(());
        }
        let spec = match &self.catalog {
            Some(catalog) => catalog.lookup(&key.tenant_id, &key.room_id).await.map_err(|e| {
                log::warn!("Room catalog lookup for {} failed: {}", key, e);
                HubError::UpstreamUnavailable(format!("room catalog: {}", e))
            })?,
            None => None,
        };
        let spec = match spec {
            Some(spec) if spec.key() != *key => {
                return Err(HubError::PermissionDenied(format!(
                    "room {} belongs to another tenant",
                    key.room_id
                )));
            }
            Some(spec) => spec,
            None if self.auto_create_public_rooms => {
                RoomSpec::public(key.room_id.clone(), key.tenant_id.clone())
            }
            None => return Err(HubError::RoomNotFound(key.room_id.to_string())),
        };
        match self.rooms.create(spec).await {
            Ok(_) | Err(HubError::RoomAlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Add a connection to a room, updating both sides of the membership edge
    pub async fn join(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
    ) -> Result<JoinOutcome> {
        let connection = self.connections.get(connection_id).await?;
        connection.touch();
        let user_id = connection.user_id().clone();
        let key = connection.room_key(room_id);

        self.resolve_room(&key).await?;
        self.authorize(&user_id, room_id, Action::Read).await?;

        let (outcome, members, sequencer) = {
            let mut membership = self.rooms.membership().await;
            if !self.connections.contains(connection_id).await {
                return Err(HubError::ConnectionNotFound(connection_id.to_string()));
            }
            let outcome = membership.join(&key, &user_id, *connection_id)?;
            connection.add_room(room_id.clone());

            let room = membership.room(&key)?;
            let mut members: Vec<UserId> = room.members().into_iter().collect();
            members.sort();
            (outcome, members, room.sequencer())
        };

        self.presence.note_rooms(&user_id, [key.clone()]).await;
        let last_seq = sequencer.current().await;
        self.send_to(&connection, &ServerFrame::joined(room_id, last_seq, members));
        if outcome.newly_member {
            let frame = ServerFrame::member_joined(room_id, &user_id);
            let failed = self.send_to_room(&key, &frame, Some(*connection_id)).await;
            self.evict(failed).await;
        }
        log::debug!("{} joined {} via {}", user_id, room_id, connection_id);
        Ok(outcome)
    }

    /// Idempotent: leaving a room twice, or after disconnect, is not an error
    pub async fn leave(&self, connection_id: &ConnectionId, room_id: &RoomId) -> Result<()> {
        let Ok(connection) = self.connections.get(connection_id).await else {
            return Ok(());
        };
        connection.touch();
        let user_id = connection.user_id().clone();
        let key = connection.room_key(room_id);

        let (was_joined, user_left) = {
            let mut membership = self.rooms.membership().await;
            let was_joined = connection.remove_room(room_id);
            (was_joined, membership.leave(&key, connection_id))
        };

        if was_joined {
            self.send_to(&connection, &ServerFrame::left(room_id));
        }
        if user_left {
            self.presence.forget_room(&user_id, &key).await;
            let frame = ServerFrame::member_left(room_id, &user_id, None);
            let failed = self.send_to_room(&key, &frame, None).await;
            self.evict(failed).await;
        }
        Ok(())
    }

    /// Remove every connection of `target` from a room; returns how many
    pub async fn kick(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
        target: &UserId,
    ) -> Result<usize> {
        let connection = self.connections.get(connection_id).await?;
        connection.touch();
        let moderator = connection.user_id().clone();
        let key = connection.room_key(room_id);

        if !connection.is_in_room(room_id) {
            return Err(HubError::PermissionDenied(format!("not a member of {}", room_id)));
        }
        let moderator_role = self.rooms.role_of(&key, &moderator).await?;
        if !self.rooms.check_permission(&key, &moderator, Action::Moderate).await? {
            return Err(HubError::PermissionDenied(format!("cannot moderate {}", room_id)));
        }
        let target_role = self.rooms.role_of(&key, target).await?;
        if target_role.is_some()
            && target_role >= moderator_role
            && moderator_role != Some(MemberRole::Admin)
        {
            return Err(HubError::PermissionDenied(format!(
                "{} outranks or equals {} in {}",
                target, moderator, room_id
            )));
        }
        self.authorize(&moderator, room_id, Action::Moderate).await?;

        let kicked = {
            let mut membership = self.rooms.membership().await;
            let targets = membership.room(&key)?.connections_of(target);
            let mut kicked = Vec::with_capacity(targets.len());
            for target_connection in targets {
                membership.leave(&key, &target_connection);
                if let Ok(kicked_connection) = self.connections.get(&target_connection).await {
                    kicked_connection.remove_room(room_id);
                    kicked.push(kicked_connection);
                }
            }
            kicked
        };

        if kicked.is_empty() {
            return Ok(0);
        }
        let frame = ServerFrame::member_left(room_id, target, Some("kicked"));
        for kicked_connection in &kicked {
            self.send_to(kicked_connection, &frame);
        }
        self.presence.forget_room(target, &key).await;
        let failed = self.send_to_room(&key, &frame, None).await;
        self.evict(failed).await;
        log::info!(
            "{} kicked {} from {} ({} connections)",
            moderator,
            target,
            key,
            kicked.len()
        );
        Ok(kicked.len())
    }

    // ---- administrative surface ----

    pub async fn create_room(&self, spec: RoomSpec) -> Result<RoomKey> {
        self.rooms.create(spec).await
    }

    pub async fn delete_room(&self, key: &RoomKey) -> Result<()> {
        self.rooms.delete(key).await
    }

    // Role changes drop cached permission answers of the affected user.

    pub async fn grant(&self, key: &RoomKey, user_id: UserId, role: MemberRole) -> Result<()> {
        self.rooms.grant(key, user_id.clone(), role).await?;
        self.invalidate_permissions(&user_id).await;
        Ok(())
    }

    pub async fn revoke(&self, key: &RoomKey, user_id: &UserId) -> Result<()> {
        self.rooms.revoke(key, user_id).await?;
        self.invalidate_permissions(user_id).await;
        Ok(())
    }

    pub async fn set_role(&self, key: &RoomKey, user_id: &UserId, role: MemberRole) -> Result<()> {
        self.rooms.set_role(key, user_id, role).await?;
        self.invalidate_permissions(user_id).await;
        Ok(())
    }

    async fn invalidate_permissions(&self, user_id: &UserId) {
        if let Some(authorizer) = &self.authorizer {
            authorizer.invalidate_user(user_id).await;
        }
    }

    // ---- routing ----

    /// Ask the external authorizer; an unreachable authorizer denies
    async fn authorize(&self, user_id: &UserId, room_id: &RoomId, action: Action) -> Result<()> {
        let Some(authorizer) = &self.authorizer else {
            return Ok(());
        };
        match authorizer.can_perform(user_id, room_id, action).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(HubError::PermissionDenied(format!(
                "{:?} on {} not allowed",
                action, room_id
            ))),
            Err(e) => {
                log::warn!(
                    "Authorizer {} failed for {} on {}, denying: {}",
                    authorizer.provider_name(),
                    user_id,
                    room_id,
                    e
                );
                Err(HubError::UpstreamUnavailable(e.to_string()))
            }
        }
    }

    /// Route a client event to a room. Returns the sequence number when this
    /// shard owns the room, `None` when the event was forwarded.
    pub async fn route(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
        frame: ClientFrame,
    ) -> Result<Option<u64>> {
        let connection = self.connections.get(connection_id).await?;
        connection.touch();
        let user_id = connection.user_id().clone();
        self.presence.on_activity(&user_id).await;

        if let RateDecision::Denied { retry_after } =
            self.rate_limiter.check_and_consume(connection_id, &frame.kind).await
        {
            log::debug!(
                "Rate limited {} on {} for {} (retry in {:?})",
                frame.kind,
                connection_id,
                room_id,
                retry_after
            );
            return Err(HubError::RateLimited(frame.kind));
        }

        if !connection.is_in_room(room_id) {
            return Err(HubError::PermissionDenied(format!("not a member of {}", room_id)));
        }
        let action = frame.frame_kind().required_action().unwrap_or(Action::Write);
        if !self.rooms.check_permission(&connection.room_key(room_id), &user_id, action).await? {
            return Err(HubError::PermissionDenied(format!(
                "{:?} on {} requires a higher role",
                action, room_id
            )));
        }
        self.authorize(&user_id, room_id, action).await?;

        if let Some(content) = frame.content() {
            if content.len() > MAX_CONTENT_LENGTH {
                return Err(HubError::ContentBlocked(format!(
                    "message exceeds {} bytes",
                    MAX_CONTENT_LENGTH
                )));
            }
            let verdict = self.moderation.evaluate(content, &user_id, room_id).await;
            if let Verdict::Blocked(reason) = verdict {
                return Err(HubError::ContentBlocked(reason));
            }
        }

        let event = RoutedEvent {
            kind: frame.kind,
            room_id: room_id.clone(),
            tenant_id: connection.tenant_id().clone(),
            author_id: user_id,
            payload: frame.payload,
            client_msg_id: frame.client_msg_id,
            origin_connection: *connection_id,
            origin_shard: self.shards.local_shard(),
        };

        match self.shards.forward(&event).await? {
            ForwardOutcome::Forwarded(_) => {
                self.stats.shard_forwarded();
                Ok(None)
            }
            ForwardOutcome::Local => self.sequence_and_deliver(event).await.map(Some),
        }
    }

    /// Stamp the next sequence number and fan out while holding the room's
    /// sequencer, so every connection sees assignment order
    async fn sequence_and_deliver(&self, event: RoutedEvent) -> Result<u64> {
        let sequencer = self.rooms.sequencer(&event.room_key()).await?;
        let (sequenced, failed) = {
            let mut last = sequencer.lock().await;
            *last += 1;
            let sequenced = SequencedEvent {
                event,
                seq: *last,
                server_timestamp: Utc::now(),
            };
            let failed = self.fan_out(&sequenced).await?;
            if let Err(e) = self.shards.publish_delivery(&sequenced).await {
                log::warn!(
                    "Failed to publish seq {} of {} to other shards: {}",
                    sequenced.seq,
                    sequenced.event.room_id,
                    e
                );
            }
            (sequenced, failed)
        };

        self.stats.message_routed();
        self.persist(&sequenced);
        self.evict(failed).await;
        Ok(sequenced.seq)
    }

    /// Deliver a sequenced event to the local connections of its room.
    /// Vanished connections are skipped; failed ones are returned.
    async fn fan_out(&self, sequenced: &SequencedEvent) -> Result<Vec<ConnectionId>> {
        let event = &sequenced.event;
        let targets = self
            .rooms
            .connections_for(&event.room_key())
            .await
            .unwrap_or_default();
        let targets = self.connections.resolve(&targets).await;
        let frame: Outbound = Arc::from(ServerFrame::routed(sequenced).encode()?);

        let mut failed = Vec::new();
        let mut delivered = 0;
        for target in targets {
            if target.id == event.origin_connection && !self.echo_to_sender {
                if event.client_msg_id.is_some() {
                    self.send_to(&target, &ServerFrame::ack(sequenced));
                }
                continue;
            }
            match target.try_send(&frame) {
                SendOutcome::Queued => delivered += 1,
                SendOutcome::SlowConsumer => {
                    log::warn!("Slow consumer {} in {}, dropping it", target.id, event.room_id);
                    self.stats.slow_consumer_evicted();
                    failed.push(target.id);
                }
                SendOutcome::Closed => failed.push(target.id),
            }
        }
        log::trace!(
            "Seq {} of {} delivered to {} connections",
            sequenced.seq,
            event.room_id,
            delivered
        );
        Ok(failed)
    }

    fn persist(&self, sequenced: &SequencedEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        if sequenced.event.payload.get("content").is_none() {
            return;
        }
        let sink = sink.clone();
        let message = StoredMessage::from_sequenced(sequenced);
        tokio::spawn(async move {
            let (room_id, seq) = (message.room_id.clone(), message.seq);
            if let Err(e) = sink.store(message).await {
                log::warn!("History sink rejected seq {} of {}: {}", seq, room_id, e);
            }
        });
    }

    // ---- cross-shard ----

    async fn handle_envelope(&self, envelope: ShardEnvelope) {
        match envelope {
            ShardEnvelope::Route { event } => self.accept_forwarded(event).await,
            ShardEnvelope::Deliver { event } => self.deliver_remote(event).await,
            ShardEnvelope::Presence { origin, change } => {
                if origin != self.shards.local_shard() {
                    self.broadcast_presence(&change).await;
                }
            }
        }
    }

    /// Owner side of a forwarded event: sequence it and deliver locally
    async fn accept_forwarded(&self, event: RoutedEvent) {
        if !self.shards.is_local(&event.room_id) {
            log::warn!("Received event for {} which this shard does not own", event.room_id);
            return;
        }
        if let Err(e) = self.resolve_room(&event.room_key()).await {
            log::warn!("Dropping forwarded event for {}: {}", event.room_id, e);
            return;
        }
        let room_id = event.room_id.clone();
        if let Err(e) = self.sequence_and_deliver(event).await {
            log::warn!("Failed to sequence forwarded event for {}: {}", room_id, e);
        }
    }

    /// Non-owner side: fan out to local members, dropping redeliveries.
    /// The local copy of the room is created on first delivery so that it
    /// tracks the owner's latest sequence number before anyone joins here.
    async fn deliver_remote(&self, sequenced: SequencedEvent) {
        let key = sequenced.event.room_key();
        if let Err(e) = self.resolve_room(&key).await {
            log::debug!("No local copy of {} for seq {}: {}", key, sequenced.seq, e);
            return;
        }
        let Ok(sequencer) = self.rooms.sequencer(&key).await else {
            return;
        };
        let failed = {
            let mut last = sequencer.lock().await;
            if sequenced.seq <= *last {
                log::debug!(
                    "Duplicate seq {} for {} ignored",
                    sequenced.seq,
                    sequenced.event.room_id
                );
                return;
            }
            *last = sequenced.seq;
            match self.fan_out(&sequenced).await {
                Ok(failed) => failed,
                Err(e) => {
                    log::error!("Failed to encode remote delivery: {}", e);
                    return;
                }
            }
        };
        self.stats.shard_delivered();
        self.evict(failed).await;
    }

    // ---- presence ----

    async fn broadcast_presence(&self, change: &PresenceChanged) {
        let own: Vec<ConnectionId> = self
            .connections
            .connections_for_user(&change.user_id)
            .await
            .iter()
            .map(|connection| connection.id)
            .collect();
        for key in &change.rooms {
            let frame = ServerFrame::presence(&key.room_id, change);
            let failed = self.send_to_room_excluding(key, &frame, &own).await;
            self.evict(failed).await;
        }
    }

    // ---- delivery helpers ----

    fn send_to(&self, connection: &Connection, frame: &ServerFrame) -> SendOutcome {
        match frame.encode() {
            Ok(text) => connection.try_send(&Arc::from(text)),
            Err(e) => {
                log::error!("Failed to encode {} frame: {}", frame.kind, e);
                SendOutcome::Closed
            }
        }
    }

    async fn send_to_room(
        &self,
        key: &RoomKey,
        frame: &ServerFrame,
        exclude: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let exclude: Vec<ConnectionId> = exclude.into_iter().collect();
        self.send_to_room_excluding(key, frame, &exclude).await
    }

    /// Unsequenced system frame to a room's local connections
    async fn send_to_room_excluding(
        &self,
        key: &RoomKey,
        frame: &ServerFrame,
        exclude: &[ConnectionId],
    ) -> Vec<ConnectionId> {
        let Ok(targets) = self.rooms.connections_for(key).await else {
            return Vec::new();
        };
        let targets: Vec<ConnectionId> = targets
            .into_iter()
            .filter(|id| !exclude.contains(id))
            .collect();
        let text: Outbound = match frame.encode() {
            Ok(text) => Arc::from(text),
            Err(e) => {
                log::error!("Failed to encode {} frame: {}", frame.kind, e);
                return Vec::new();
            }
        };
        self.connections
            .resolve(&targets)
            .await
            .into_iter()
            .filter(|target| target.try_send(&text) != SendOutcome::Queued)
            .map(|target| target.id)
            .collect()
    }

    // ---- inbound frames ----

    /// Entry point for a raw inbound text frame; rejections go back to the sender
    pub async fn handle_text(&self, connection_id: &ConnectionId, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject(connection_id, &e, None, None).await;
                return;
            }
        };
        let room_id = frame.room_id.clone();
        let client_msg_id = frame.client_msg_id.clone();
        if let Err(e) = self.dispatch(connection_id, frame).await {
            self.reject(connection_id, &e, room_id, client_msg_id).await;
        }
    }

    pub async fn dispatch(&self, connection_id: &ConnectionId, frame: ClientFrame) -> Result<()> {
        match frame.frame_kind() {
            FrameKind::Join => {
                self.join(connection_id, &frame.require_room()?).await?;
            }
            FrameKind::Leave => self.leave(connection_id, &frame.require_room()?).await?,
            FrameKind::Kick => {
                let room_id = frame.require_room()?;
                let target = frame.target_user().ok_or_else(|| {
                    HubError::InvalidFrame("kick needs payload.user_id".to_string())
                })?;
                self.kick(connection_id, &room_id, &target).await?;
            }
            FrameKind::Ping => {
                let connection = self.connections.get(connection_id).await?;
                connection.touch();
                self.presence.on_activity(connection.user_id()).await;
                self.send_to(&connection, &ServerFrame::pong());
            }
            FrameKind::Routed(_) => {
                let room_id = frame.require_room()?;
                self.route(connection_id, &room_id, frame).await?;
            }
        }
        Ok(())
    }

    async fn reject(
        &self,
        connection_id: &ConnectionId,
        error: &HubError,
        room_id: Option<RoomId>,
        client_msg_id: Option<String>,
    ) {
        self.stats.rejection(error);
        if error.is_infrastructure() {
            log::warn!("Request from {} failed: {}", connection_id, error);
        } else {
            log::debug!("Rejected request from {}: {}", connection_id, error);
        }
        let Ok(connection) = self.connections.get(connection_id).await else {
            return;
        };
        let frame = ServerFrame::error(error, room_id, client_msg_id);
        if self.send_to(&connection, &frame) != SendOutcome::Queued {
            self.evict(vec![*connection_id]).await;
        }
    }

    /// Evict idle, unhealthy or closed connections. The candidate list is a
    /// snapshot; each one is re-checked before removal.
    pub async fn reap(
        &self,
        now: Instant,
        idle_timeout: std::time::Duration,
        max_evictions: usize,
    ) -> usize {
        let candidates = self.connections.eviction_candidates(now, idle_timeout).await;
        let mut evicted = 0;
        for connection_id in candidates.into_iter().take(max_evictions) {
            let still_evictable = match self.connections.get(&connection_id).await {
                Ok(connection) => connection.should_evict(now, idle_timeout),
                Err(_) => false,
            };
            if still_evictable && self.remove(&connection_id).await {
                evicted += 1;
            }
        }
        self.stats.connections_reaped(evicted);
        evicted
    }
}
