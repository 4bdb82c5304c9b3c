//! Connection registry: the authoritative map of live connections

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::auth::provider::Identity;
use crate::core::connection::{Connection, ConnectionHandle};
use crate::core::ids::{ConnectionId, UserId};
use crate::error::{HubError, Result};

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    per_user: HashMap<UserId, usize>,
}

/// Manages live connections and enforces admission caps
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    max_connections: usize,
    max_connections_per_user: usize,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(
        max_connections: usize,
        max_connections_per_user: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_connections,
            max_connections_per_user,
            queue_capacity,
        }
    }

    /// Admit an already-authenticated session
    pub async fn register(
        &self,
        identity: Identity,
    ) -> Result<(Arc<Connection>, ConnectionHandle)> {
        let mut state = self.state.write().await;

        if state.connections.len() >= self.max_connections {
            return Err(HubError::CapacityExceeded(format!(
                "process limit of {} connections reached",
                self.max_connections
            )));
        }
        let user_count = state.per_user.get(&identity.user_id).copied().unwrap_or(0);
        if user_count >= self.max_connections_per_user {
            return Err(HubError::CapacityExceeded(format!(
                "user {} already has {} connections",
                identity.user_id, user_count
            )));
        }

        let user_id = identity.user_id.clone();
        let (connection, handle) = Connection::new(identity, self.queue_capacity);
        let connection = Arc::new(connection);
        state.connections.insert(connection.id, connection.clone());
        *state.per_user.entry(user_id).or_insert(0) += 1;

        log::debug!(
            "Registered connection {} for user {} ({} live)",
            connection.id,
            connection.user_id(),
            state.connections.len()
        );
        Ok((connection, handle))
    }

    pub async fn get(&self, id: &ConnectionId) -> Result<Arc<Connection>> {
        self.state
            .read()
            .await
            .connections
            .get(id)
            .cloned()
            .ok_or_else(|| HubError::ConnectionNotFound(id.to_string()))
    }

    /// Update last activity; called on every inbound frame
    pub async fn touch(&self, id: &ConnectionId) -> Result<()> {
        self.get(id).await?.touch();
        Ok(())
    }

    /// Remove a connection. Only the first call for an id returns it, which
    /// lets callers run teardown exactly once.
    pub async fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut state = self.state.write().await;
        let connection = state.connections.remove(id)?;

        let user_id = connection.user_id().clone();
        if let Some(count) = state.per_user.get_mut(&user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_user.remove(&user_id);
            }
        }
        Some(connection)
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.state.read().await.connections.contains_key(id)
    }

    /// Point-in-time copy of the live connections
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.state.read().await.connections.values().cloned().collect()
    }

    /// Resolve ids to live connections, skipping the ones that vanished
    pub async fn resolve(&self, ids: &[ConnectionId]) -> Vec<Arc<Connection>> {
        let state = self.state.read().await;
        ids.iter()
            .filter_map(|id| state.connections.get(id).cloned())
            .collect()
    }

    /// Idle, unhealthy or closed connections, from a point-in-time snapshot
    pub async fn eviction_candidates(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|connection| connection.should_evict(now, timeout))
            .map(|connection| connection.id)
            .collect()
    }

    pub async fn connections_for_user(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        self.state
            .read()
            .await
            .connections
            .values()
            .filter(|connection| connection.user_id() == user_id)
            .cloned()
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn user_connection_count(&self, user_id: &UserId) -> usize {
        self.state
            .read()
            .await
            .per_user
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }
}
