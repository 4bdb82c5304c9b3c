use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use crate::auth::provider::Action;
use crate::core::ids::{ConnectionId, RoomId, RoomKey, TenantId, UserId};
use crate::error::{HubError, Result};

/// Kind of room, which drives the default permission policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    Public,
    /// Invite-only: joining requires a grant
    Private,
    /// Anyone may read, only moderators and admins write
    Broadcast,
}

/// Role of a user within a room, ordered by privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Member,
    Moderator,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    Anyone,
    GrantedOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    Members,
    Moderators,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    /// Maximum number of distinct users (None for unlimited)
    pub max_members: Option<usize>,
    pub read_policy: ReadPolicy,
    pub write_policy: WritePolicy,
}

impl RoomSettings {
    pub fn for_type(room_type: RoomType) -> Self {
        let (read_policy, write_policy) = match room_type {
            RoomType::Public => (ReadPolicy::Anyone, WritePolicy::Members),
            RoomType::Private => (ReadPolicy::GrantedOnly, WritePolicy::Members),
            RoomType::Broadcast => (ReadPolicy::Anyone, WritePolicy::Moderators),
        };
        Self {
            max_members: None,
            read_policy,
            write_policy,
        }
    }
}

/// Everything needed to create a room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSpec {
    pub id: RoomId,
    pub name: String,
    pub tenant_id: TenantId,
    pub room_type: RoomType,
    pub settings: RoomSettings,
    /// Persistent role grants (invites, moderators, admins)
    #[serde(default)]
    pub grants: HashMap<UserId, MemberRole>,
}

impl RoomSpec {
    pub fn new(id: impl Into<RoomId>, tenant_id: impl Into<TenantId>, room_type: RoomType) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            tenant_id: tenant_id.into(),
            room_type,
            settings: RoomSettings::for_type(room_type),
            grants: HashMap::new(),
        }
    }

    pub fn public(id: impl Into<RoomId>, tenant_id: impl Into<TenantId>) -> Self {
        Self::new(id, tenant_id, RoomType::Public)
    }

    pub fn private(id: impl Into<RoomId>, tenant_id: impl Into<TenantId>) -> Self {
        Self::new(id, tenant_id, RoomType::Private)
    }

    pub fn broadcast(id: impl Into<RoomId>, tenant_id: impl Into<TenantId>) -> Self {
        Self::new(id, tenant_id, RoomType::Broadcast)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_members(mut self, max_members: usize) -> Self {
        self.settings.max_members = Some(max_members);
        self
    }

    pub fn with_grant(mut self, user_id: impl Into<UserId>, role: MemberRole) -> Self {
        self.grants.insert(user_id.into(), role);
        self
    }

    pub fn key(&self) -> RoomKey {
        RoomKey::new(self.tenant_id.clone(), self.id.clone())
    }
}

/// Per-room sequence counter. Holding the guard serializes sequence
/// assignment with enqueueing, so every connection sees assignment order.
#[derive(Debug, Default)]
pub struct Sequencer {
    last: Mutex<u64>,
}

impl Sequencer {
    pub async fn lock(&self) -> MutexGuard<'_, u64> {
        self.last.lock().await
    }

    /// Increment and return the next sequence number
    pub async fn next(&self) -> u64 {
        let mut last = self.last.lock().await;
        *last += 1;
        *last
    }

    pub async fn current(&self) -> u64 {
        *self.last.lock().await
    }
}

/// Room information for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub room_type: RoomType,
    pub member_count: usize,
    pub max_members: Option<usize>,
    pub last_seq: u64,
}

/// Represents a chat room or channel
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub tenant_id: TenantId,
    pub room_type: RoomType,
    pub settings: RoomSettings,
    /// Persistent grants, independent of liveness
    grants: HashMap<UserId, MemberRole>,
    /// Users with at least one live connection in the room
    members: HashMap<UserId, MemberRole>,
    /// Live connections and the user behind each
    connections: HashMap<ConnectionId, UserId>,
    sequencer: Arc<Sequencer>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Room {
    pub fn from_spec(spec: RoomSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            tenant_id: spec.tenant_id,
            room_type: spec.room_type,
            settings: spec.settings,
            grants: spec.grants,
            members: HashMap::new(),
            connections: HashMap::new(),
            sequencer: Arc::new(Sequencer::default()),
            created_at: chrono::Utc::now(),
        }
    }

    /// Live role if present, else the granted one
    pub fn role_of(&self, user_id: &UserId) -> Option<MemberRole> {
        self.members
            .get(user_id)
            .or_else(|| self.grants.get(user_id))
            .copied()
    }

    /// Checks if a user satisfies the room policy for an action
    pub fn permits(&self, user_id: &UserId, action: Action) -> bool {
        match action {
            Action::Read => match self.settings.read_policy {
                ReadPolicy::Anyone => true,
                ReadPolicy::GrantedOnly => self.grants.contains_key(user_id),
            },
            Action::Write => match (self.role_of(user_id), self.settings.write_policy) {
                (None, _) => false,
                (Some(_), WritePolicy::Members) => true,
                (Some(role), WritePolicy::Moderators) => role >= MemberRole::Moderator,
            },
            Action::Moderate => self
                .role_of(user_id)
                .map(|role| role >= MemberRole::Moderator)
                .unwrap_or(false),
        }
    }

    /// Adds a connection; returns true when the user became a member
    fn admit(&mut self, connection_id: ConnectionId, user_id: &UserId) -> Result<bool> {
        if self.connections.contains_key(&connection_id) {
            return Ok(false);
        }
        if !self.permits(user_id, Action::Read) {
            return Err(HubError::PermissionDenied(format!(
                "room {} is invite-only",
                self.id
            )));
        }

        let newly_member = !self.members.contains_key(user_id);
        if newly_member {
            if let Some(max) = self.settings.max_members {
                if self.members.len() >= max {
                    return Err(HubError::RoomFull(self.id.to_string()));
                }
            }
            let role = self.grants.get(user_id).copied().unwrap_or(MemberRole::Member);
            self.members.insert(user_id.clone(), role);
        }
        self.connections.insert(connection_id, user_id.clone());
        Ok(newly_member)
    }

    /// Removes a connection; returns true when its user has no connection left here
    fn release(&mut self, connection_id: &ConnectionId) -> bool {
        let Some(user_id) = self.connections.remove(connection_id) else {
            return false;
        };
        let still_present = self.connections.values().any(|user| *user == user_id);
        if !still_present {
            self.members.remove(&user_id);
        }
        !still_present
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn has_member(&self, user_id: &UserId) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn has_connection(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn members(&self) -> HashSet<UserId> {
        self.members.keys().cloned().collect()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, user)| *user == user_id)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn sequencer(&self) -> Arc<Sequencer> {
        self.sequencer.clone()
    }

}

/// Outcome of a room-side join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub newly_member: bool,
    pub role: MemberRole,
}

/// Write access to room membership. Only the message router obtains one,
/// so every membership change runs inside its critical section.
pub(crate) struct MembershipGuard<'a> {
    rooms: RwLockWriteGuard<'a, HashMap<RoomKey, Room>>,
}

impl MembershipGuard<'_> {
    pub fn room(&self, key: &RoomKey) -> Result<&Room> {
        self.rooms.get(key).ok_or_else(|| not_found(key))
    }

    pub fn join(
        &mut self,
        key: &RoomKey,
        user_id: &UserId,
        connection_id: ConnectionId,
    ) -> Result<JoinOutcome> {
        let room = self.rooms.get_mut(key).ok_or_else(|| not_found(key))?;
        let newly_member = room.admit(connection_id, user_id)?;
        let role = room.role_of(user_id).unwrap_or(MemberRole::Member);
        Ok(JoinOutcome { newly_member, role })
    }

    /// Idempotent; returns true when the user left the member set
    pub fn leave(&mut self, key: &RoomKey, connection_id: &ConnectionId) -> bool {
        self.rooms
            .get_mut(key)
            .map(|room| room.release(connection_id))
            .unwrap_or(false)
    }
}

fn not_found(key: &RoomKey) -> HubError {
    HubError::RoomNotFound(key.room_id.to_string())
}

/// Manages all rooms known to this process, keyed by tenant and room id
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomKey, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn membership(&self) -> MembershipGuard<'_> {
        MembershipGuard {
            rooms: self.rooms.write().await,
        }
    }

    /// Creates a room; fails when its tenant already has one with that id
    pub async fn create(&self, spec: RoomSpec) -> Result<RoomKey> {
        let key = spec.key();
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&key) {
            return Err(HubError::RoomAlreadyExists(key.room_id.to_string()));
        }
        rooms.insert(key.clone(), Room::from_spec(spec));
        log::info!("Room {} created", key);
        Ok(key)
    }

    /// Deletes a room that no connection references anymore
    pub async fn delete(&self, key: &RoomKey) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(key).ok_or_else(|| not_found(key))?;
        if !room.connections.is_empty() {
            return Err(HubError::RoomInUse(key.room_id.to_string()));
        }
        rooms.remove(key);
        log::info!("Room {} deleted", key);
        Ok(())
    }

    pub async fn contains(&self, key: &RoomKey) -> bool {
        self.rooms.read().await.contains_key(key)
    }

    /// Users with a live connection in the room
    pub async fn members(&self, key: &RoomKey) -> Result<HashSet<UserId>> {
        self.with_room(key, Room::members).await
    }

    /// Fast path used by the router for fan-out
    pub async fn connections_for(&self, key: &RoomKey) -> Result<Vec<ConnectionId>> {
        self.with_room(key, Room::connection_ids).await
    }

    pub async fn sequencer(&self, key: &RoomKey) -> Result<Arc<Sequencer>> {
        self.with_room(key, Room::sequencer).await
    }

    /// Atomically increments and returns the room's sequence counter
    pub async fn next_sequence(&self, key: &RoomKey) -> Result<u64> {
        let sequencer = self.sequencer(key).await?;
        Ok(sequencer.next().await)
    }

    pub async fn last_sequence(&self, key: &RoomKey) -> Result<u64> {
        let sequencer = self.sequencer(key).await?;
        Ok(sequencer.current().await)
    }

    pub async fn check_permission(
        &self,
        key: &RoomKey,
        user_id: &UserId,
        action: Action,
    ) -> Result<bool> {
        self.with_room(key, |room| room.permits(user_id, action))
            .await
    }

    pub async fn role_of(&self, key: &RoomKey, user_id: &UserId) -> Result<Option<MemberRole>> {
        self.with_room(key, |room| room.role_of(user_id)).await
    }

    /// Grant (or change) a persistent role; live members pick it up immediately
    pub async fn grant(&self, key: &RoomKey, user_id: UserId, role: MemberRole) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(key).ok_or_else(|| not_found(key))?;
        if let Some(live) = room.members.get_mut(&user_id) {
            *live = role;
        }
        room.grants.insert(user_id, role);
        Ok(())
    }

    /// Change the role of a user that is already a member or holds a grant
    pub async fn set_role(&self, key: &RoomKey, user_id: &UserId, role: MemberRole) -> Result<()> {
        let has_role = self.role_of(key, user_id).await?.is_some();
        if !has_role {
            return Err(HubError::PermissionDenied(format!(
                "user {} has no role in room {}",
                user_id, key.room_id
            )));
        }
        self.grant(key, user_id.clone(), role).await
    }

    /// Remove a persistent grant; live membership is untouched
    pub async fn revoke(&self, key: &RoomKey, user_id: &UserId) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(key).ok_or_else(|| not_found(key))?;
        room.grants.remove(user_id);
        if let Some(live) = room.members.get_mut(user_id) {
            *live = MemberRole::Member;
        }
        Ok(())
    }

    pub async fn info(&self, key: &RoomKey) -> Result<RoomInfo> {
        let sequencer = self.sequencer(key).await?;
        let last_seq = sequencer.current().await;
        self.with_room(key, |room| RoomInfo {
            id: room.id.clone(),
            name: room.name.clone(),
            room_type: room.room_type,
            member_count: room.member_count(),
            max_members: room.settings.max_members,
            last_seq,
        })
        .await
    }

    /// Lists the rooms of a tenant
    pub async fn list(&self, tenant_id: &TenantId) -> Vec<RoomId> {
        self.rooms
            .read()
            .await
            .keys()
            .filter(|key| key.tenant_id == *tenant_id)
            .map(|key| key.room_id.clone())
            .collect()
    }

    async fn with_room<T>(&self, key: &RoomKey, f: impl FnOnce(&Room) -> T) -> Result<T> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(key).ok_or_else(|| not_found(key))?;
        Ok(f(room))
    }
}
