//! Live connection state
//! Handles the lifecycle data of one authenticated client session

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::auth::provider::Identity;
use crate::core::ids::{ConnectionId, RoomId, RoomKey, TenantId, UserId};

/// Serialized frame shared between every recipient of a broadcast
pub type Outbound = Arc<str>;

/// Result of pushing a frame onto a connection's outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue full: the client is not draining fast enough
    SlowConsumer,
    /// Transport side is gone
    Closed,
}

struct ConnectionState {
    joined_rooms: HashSet<RoomId>,
    last_activity: Instant,
}

/// Represents the state of a single client connection.
/// Owned by the connection registry; the transport only keeps a `ConnectionHandle`.
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub connected_at: Instant,
    sender: mpsc::Sender<Outbound>,
    state: Mutex<ConnectionState>,
    healthy: AtomicBool,
}

/// Transport-side end of a connection: drains frames into the socket
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub receiver: mpsc::Receiver<Outbound>,
}

impl Connection {
    /// Create a connection with a bounded outbound queue
    pub fn new(identity: Identity, queue_capacity: usize) -> (Self, ConnectionHandle) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let id = ConnectionId::new();
        let now = Instant::now();
        let connection = Self {
            id,
            identity,
            connected_at: now,
            sender,
            state: Mutex::new(ConnectionState {
                joined_rooms: HashSet::new(),
                last_activity: now,
            }),
            healthy: AtomicBool::new(true),
        };
        (connection, ConnectionHandle { id, receiver })
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.identity.tenant_id
    }

    /// Queue a frame without waiting; a full queue marks a slow consumer
    pub fn try_send(&self, frame: &Outbound) -> SendOutcome {
        if !self.is_healthy() {
            return SendOutcome::Closed;
        }
        match self.sender.try_send(frame.clone()) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.mark_unhealthy();
                SendOutcome::SlowConsumer
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mark_unhealthy();
                SendOutcome::Closed
            }
        }
    }

    /// Record inbound activity
    pub fn touch(&self) {
        self.state().last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.state().last_activity
    }

    /// Check if the connection has been idle longer than `timeout`
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity()) > timeout
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// The transport dropped its end of the outbound queue
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Whether the idle reaper should evict this connection
    pub fn should_evict(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_healthy() || self.is_closed() || self.is_stale(now, timeout)
    }

    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.state().joined_rooms.iter().cloned().collect()
    }

    pub fn is_in_room(&self, room_id: &RoomId) -> bool {
        self.state().joined_rooms.contains(room_id)
    }

    /// Rooms are addressed within the connection's own tenant
    pub fn room_key(&self, room_id: &RoomId) -> RoomKey {
        RoomKey::new(self.tenant_id().clone(), room_id.clone())
    }

    // Membership edge mutation is reserved to the router's critical section.

    pub(crate) fn add_room(&self, room_id: RoomId) -> bool {
        self.state().joined_rooms.insert(room_id)
    }

    pub(crate) fn remove_room(&self, room_id: &RoomId) -> bool {
        self.state().joined_rooms.remove(room_id)
    }

    pub(crate) fn take_rooms(&self) -> HashSet<RoomId> {
        std::mem::take(&mut self.state().joined_rooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity::new("alice", "acme")
    }

    #[tokio::test]
    async fn test_full_queue_is_slow_consumer() {
        let (connection, _handle) = Connection::new(identity(), 1);
        let frame: Outbound = Arc::from("frame");

        assert_eq!(connection.try_send(&frame), SendOutcome::Queued);
        assert_eq!(connection.try_send(&frame), SendOutcome::SlowConsumer);
        assert!(!connection.is_healthy());
    }

    #[tokio::test]
    async fn test_dropped_handle_is_closed() {
        let (connection, handle) = Connection::new(identity(), 4);
        drop(handle);
        assert!(connection.is_closed());
        assert!(connection.should_evict(Instant::now(), Duration::from_secs(300)));
        assert_eq!(connection.try_send(&Arc::from("x")), SendOutcome::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_follows_touch() {
        let (connection, _handle) = Connection::new(identity(), 4);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(connection.is_stale(Instant::now(), Duration::from_secs(5)));

        connection.touch();
        assert!(!connection.is_stale(Instant::now(), Duration::from_secs(5)));
    }
}
