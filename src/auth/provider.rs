//! Authorization collaborator seam
//!
//! Credential validation and ad hoc permission queries are answered by an
//! external identity service. The hub only talks to it through `AuthProvider`,
//! so JWT, API gateways or test doubles can be plugged in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::core::ids::{RoomId, TenantId, UserId};
use crate::error::{HubError, Result};

/// Kind of access an operation needs on a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Moderate,
}

/// Identity established by a successful handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, tenant_id: impl Into<TenantId>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

/// Trait for authorization providers
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Validate a handshake credential and return who is connecting
    async fn authenticate(&self, credential: &str) -> Result<Identity>;

    /// Answer an ad hoc permission query for a room
    async fn can_perform(&self, user_id: &UserId, room_id: &RoomId, action: Action)
        -> Result<bool>;

    /// Get the provider name for logging/debugging
    fn provider_name(&self) -> &'static str;
}

/// Token table provider for local runs and tests
#[derive(Default)]
pub struct StaticAuthProvider {
    tokens: RwLock<HashMap<String, Identity>>,
    denied: RwLock<HashSet<(UserId, RoomId, Action)>>,
    unavailable: AtomicBool,
    permission_queries: AtomicUsize,
}

impl StaticAuthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as a credential for `identity`
    pub async fn insert_token(&self, token: impl Into<String>, identity: Identity) {
        self.tokens.write().await.insert(token.into(), identity);
    }

    /// Make `can_perform` answer false for this triple
    pub async fn deny(&self, user_id: UserId, room_id: RoomId, action: Action) {
        self.denied.write().await.insert((user_id, room_id, action));
    }

    /// Simulate an outage of the identity service
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of permission queries that reached this provider
    pub fn permission_queries(&self) -> usize {
        self.permission_queries.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(HubError::UpstreamUnavailable(
                "static provider marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn authenticate(&self, credential: &str) -> Result<Identity> {
        self.check_available()?;
        self.tokens
            .read()
            .await
            .get(credential)
            .cloned()
            .ok_or_else(|| HubError::AuthenticationFailed("unknown token".to_string()))
    }

    async fn can_perform(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        action: Action,
    ) -> Result<bool> {
        self.permission_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let key = (user_id.clone(), room_id.clone(), action);
        Ok(!self.denied.read().await.contains(&key))
    }

    fn provider_name(&self) -> &'static str {
        "static"
    }
}
