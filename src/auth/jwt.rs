//! JWT-backed handshake validation
//!
//! Tokens are issued by the identity service; the hub only verifies them.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::auth::provider::{Action, AuthProvider, Identity};
use crate::core::ids::{RoomId, UserId};
use crate::error::{HubError, Result};

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Tenant the user belongs to
    pub tenant: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Expiration time (as UTC timestamp)
    pub exp: usize,
    /// Issued at (as UTC timestamp)
    pub iat: usize,
}

impl Claims {
    /// Creates claims valid for `hours` from now
    pub fn new(user_id: String, tenant: String, roles: Vec<String>, hours: i64) -> Self {
        let now = chrono::Utc::now();
        Self {
            sub: user_id,
            tenant,
            roles,
            exp: (now + chrono::Duration::hours(hours)).timestamp() as usize,
            iat: now.timestamp() as usize,
        }
    }
}

/// Validates HS256 tokens signed with a shared secret
pub struct JwtAuthProvider {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthProvider {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }
}

#[async_trait]
impl AuthProvider for JwtAuthProvider {
    async fn authenticate(&self, credential: &str) -> Result<Identity> {
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential);
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| HubError::AuthenticationFailed(format!("Invalid token: {}", e)))?;

        let claims = data.claims;
        Ok(Identity::new(claims.sub, claims.tenant).with_roles(claims.roles))
    }

    // Claims carry no room ACL; room-level roles are enforced by the room registry.
    async fn can_perform(
        &self,
        _user_id: &UserId,
        _room_id: &RoomId,
        _action: Action,
    ) -> Result<bool> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "jwt"
    }
}
