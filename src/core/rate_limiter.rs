//! Rate limiting module to prevent abuse
//!
//! Fixed windows per (connection, message type). Windows reset lazily on
//! access, so idle connections cost no timer wakeups.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::constants::{RATE_DEFAULT, RATE_MESSAGE, RATE_REACTION, RATE_TYPING};
use crate::core::ids::ConnectionId;
use crate::error::{HubError, Result};

/// Bucket name used for message types missing from the policy table
pub const FALLBACK_BUCKET: &str = "other";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateRule {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    fn from_constant((limit, secs): (u32, u64)) -> Self {
        Self::new(limit, Duration::from_secs(secs))
    }
}

/// Parses `<limit>/<window_secs>`, e.g. `30/60`
impl FromStr for RateRule {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        let (limit, window) = s
            .split_once('/')
            .ok_or_else(|| HubError::Config(format!("rate rule '{}' is not <limit>/<secs>", s)))?;
        let limit = limit
            .trim()
            .parse()
            .map_err(|_| HubError::Config(format!("invalid rate limit in '{}'", s)))?;
        let secs = window
            .trim()
            .parse()
            .map_err(|_| HubError::Config(format!("invalid rate window in '{}'", s)))?;
        Ok(Self::new(limit, Duration::from_secs(secs)))
    }
}

/// Message type -> rule table with a mandatory fallback entry
#[derive(Debug, Clone)]
pub struct RatePolicy {
    rules: HashMap<String, RateRule>,
    pub fallback: RateRule,
}

impl Default for RatePolicy {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert("message".to_string(), RateRule::from_constant(RATE_MESSAGE));
        rules.insert("typing".to_string(), RateRule::from_constant(RATE_TYPING));
        rules.insert("reaction".to_string(), RateRule::from_constant(RATE_REACTION));
        Self {
            rules,
            fallback: RateRule::from_constant(RATE_DEFAULT),
        }
    }
}

impl RatePolicy {
    pub fn set_rule(&mut self, message_type: &str, rule: RateRule) {
        self.rules.insert(message_type.to_string(), rule);
    }

    /// Resolve the bucket and rule for a message type
    pub fn rule_for<'a>(&'a self, message_type: &'a str) -> (&'a str, RateRule) {
        match self.rules.get(message_type) {
            Some(rule) => (message_type, *rule),
            None => (FALLBACK_BUCKET, self.fallback),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let all = self.rules.values().chain(std::iter::once(&self.fallback));
        for rule in all {
            if rule.limit == 0 || rule.window.is_zero() {
                return Err(HubError::Config(
                    "rate rules need a non-zero limit and window".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Per-connection, per-message-type rate limiter
pub struct RateLimiter {
    policy: RatePolicy,
    windows: RwLock<HashMap<ConnectionId, HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    pub async fn check_and_consume(
        &self,
        connection_id: &ConnectionId,
        message_type: &str,
    ) -> RateDecision {
        self.check_and_consume_at(connection_id, message_type, Instant::now())
            .await
    }

    pub async fn check_and_consume_at(
        &self,
        connection_id: &ConnectionId,
        message_type: &str,
        now: Instant,
    ) -> RateDecision {
        let (bucket, rule) = self.policy.rule_for(message_type);
        let mut windows = self.windows.write().await;
        let window = windows
            .entry(*connection_id)
            .or_default()
            .entry(bucket.to_string())
            .or_insert(Window {
                started: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= rule.window {
            window.started = now;
            window.count = 0;
        }

        if window.count < rule.limit {
            window.count += 1;
            RateDecision::Allowed
        } else {
            RateDecision::Denied {
                retry_after: rule.window.saturating_sub(elapsed),
            }
        }
    }

    /// Drop all state of a destroyed connection
    pub async fn forget(&self, connection_id: &ConnectionId) {
        self.windows.write().await.remove(connection_id);
    }

    pub async fn tracked_connections(&self) -> usize {
        self.windows.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_31st_message_in_window_is_denied() {
        let limiter = RateLimiter::new(RatePolicy::default());
        let connection = ConnectionId::new();

        for _ in 0..30 {
            assert!(limiter.check_and_consume(&connection, "message").await.is_allowed());
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        let decision = limiter.check_and_consume(&connection, "message").await;
        assert!(matches!(decision, RateDecision::Denied { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_thirty_messages_straddling_window_pass() {
        let limiter = RateLimiter::new(RatePolicy::default());
        let connection = ConnectionId::new();

        // 30 events spread evenly across 61 seconds
        for i in 0..30u64 {
            assert!(limiter.check_and_consume(&connection, "message").await.is_allowed());
            if i < 29 {
                tokio::time::advance(Duration::from_millis(61_000 / 29)).await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_lazily() {
        let limiter = RateLimiter::new(RatePolicy::default());
        let connection = ConnectionId::new();

        for _ in 0..30 {
            limiter.check_and_consume(&connection, "message").await;
        }
        assert!(!limiter.check_and_consume(&connection, "message").await.is_allowed());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.check_and_consume(&connection, "message").await.is_allowed());
    }

    #[tokio::test]
    async fn test_unknown_type_uses_fallback_bucket() {
        let limiter = RateLimiter::new(RatePolicy::default());
        let connection = ConnectionId::new();

        for i in 0..50 {
            // Distinct unknown types share the same fallback bucket
            let kind = if i % 2 == 0 { "sticker" } else { "poll" };
            assert!(limiter.check_and_consume(&connection, kind).await.is_allowed());
        }
        assert!(!limiter.check_and_consume(&connection, "sticker").await.is_allowed());
        assert!(limiter.check_and_consume(&connection, "message").await.is_allowed());
    }

    #[tokio::test]
    async fn test_forget_drops_state() {
        let limiter = RateLimiter::new(RatePolicy::default());
        let connection = ConnectionId::new();
        limiter.check_and_consume(&connection, "typing").await;
        assert_eq!(limiter.tracked_connections().await, 1);

        limiter.forget(&connection).await;
        assert_eq!(limiter.tracked_connections().await, 0);
    }

    #[test]
    fn test_rule_parsing() {
        let rule: RateRule = "30/60".parse().unwrap();
        assert_eq!(rule, RateRule::new(30, Duration::from_secs(60)));
        assert!("30".parse::<RateRule>().is_err());
        assert!("x/60".parse::<RateRule>().is_err());
    }
}
