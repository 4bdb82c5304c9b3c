//! Short-lived cache in front of the permission collaborator

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::auth::provider::{Action, AuthProvider, Identity};
use crate::core::ids::{RoomId, UserId};
use crate::error::Result;

type PermissionKey = (UserId, RoomId, Action);

/// Caches `can_perform` answers for a TTL to bound upstream call volume.
/// Errors are never cached.
pub struct CachedAuthorizer {
    inner: Arc<dyn AuthProvider>,
    cache: Mutex<LruCache<PermissionKey, (bool, Instant)>>,
    ttl: Duration,
}

impl CachedAuthorizer {
    pub fn new(inner: Arc<dyn AuthProvider>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Drop every cached answer for a user (e.g. after a role change)
    pub async fn invalidate_user(&self, user_id: &UserId) {
        let mut cache = self.cache.lock().await;
        let stale: Vec<PermissionKey> = cache
            .iter()
            .filter(|((user, _, _), _)| user == user_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }
}

#[async_trait]
impl AuthProvider for CachedAuthorizer {
    async fn authenticate(&self, credential: &str) -> Result<Identity> {
        self.inner.authenticate(credential).await
    }

    async fn can_perform(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        action: Action,
    ) -> Result<bool> {
        let key = (user_id.clone(), room_id.clone(), action);
        {
            let mut cache = self.cache.lock().await;
            if let Some((allowed, stored_at)) = cache.get(&key) {
                if stored_at.elapsed() < self.ttl {
                    return Ok(*allowed);
                }
            }
        }

        let allowed = self.inner.can_perform(user_id, room_id, action).await?;
        self.cache.lock().await.put(key, (allowed, Instant::now()));
        Ok(allowed)
    }

    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }
}
