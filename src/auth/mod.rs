//! Authorization collaborator: handshake validation and permission queries

pub mod cache;
pub mod jwt;
pub mod provider;

pub use cache::CachedAuthorizer;
pub use jwt::JwtAuthProvider;
pub use provider::{Action, AuthProvider, Identity, StaticAuthProvider};
