//! Content moderation pipeline
//!
//! Rules run in order (blocklist, spam heuristics, link safety) and the
//! first block wins. A rule that cannot reach its dependency degrades
//! according to its own failure policy.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::constants::{
    DEFAULT_LINK_CHECK_TIMEOUT_MILLIS, DEFAULT_SPAM_BURST_THRESHOLD, DEFAULT_SPAM_REPEAT_THRESHOLD,
    DEFAULT_SPAM_WINDOW_SECS,
};
use crate::core::ids::{RoomId, UserId};
use crate::error::{HubError, Result};

/// What to do when a rule's external dependency fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Let the content through
    FailOpen,
    /// Block the content
    FailClosed,
}

impl FromStr for FailurePolicy {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "open" | "fail_open" => Ok(Self::FailOpen),
            "closed" | "fail_closed" => Ok(Self::FailClosed),
            other => Err(HubError::Config(format!(
                "unknown failure policy '{}', expected open or closed",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Blocked(String),
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// Lowercase terms rejected outright
    pub blocklist: Vec<String>,
    /// Link hosts rejected together with their subdomains
    pub blocked_domains: Vec<String>,
    pub spam_window: Duration,
    /// Identical messages tolerated per author and room inside the window
    pub spam_repeat_threshold: usize,
    /// Messages tolerated per author and room inside the window
    pub spam_burst_threshold: usize,
    pub link_check_timeout: Duration,
    pub link_failure_policy: FailurePolicy,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            blocklist: Vec::new(),
            blocked_domains: Vec::new(),
            spam_window: Duration::from_secs(DEFAULT_SPAM_WINDOW_SECS),
            spam_repeat_threshold: DEFAULT_SPAM_REPEAT_THRESHOLD,
            spam_burst_threshold: DEFAULT_SPAM_BURST_THRESHOLD,
            link_check_timeout: Duration::from_millis(DEFAULT_LINK_CHECK_TIMEOUT_MILLIS),
            link_failure_policy: FailurePolicy::FailClosed,
        }
    }
}

/// One step of the moderation pipeline
#[async_trait]
pub trait ModerationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::FailClosed
    }

    /// `Err` means the rule could not decide
    async fn check(&self, content: &str, author: &UserId, room: &RoomId) -> Result<Verdict>;

    /// Drop state older than the rule cares about
    async fn sweep(&self, _now: Instant) {}
}

/// External link reputation lookup
#[async_trait]
pub trait LinkReputation: Send + Sync {
    async fn is_safe(&self, url: &Url) -> Result<bool>;
}

/// Rejects content containing a blocklisted term
pub struct BlocklistRule {
    words: Vec<String>,
    phrases: Vec<String>,
}

impl BlocklistRule {
    pub fn new(terms: &[String]) -> Self {
        let (phrases, words): (Vec<String>, Vec<String>) = terms
            .iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .partition(|term| term.contains(char::is_whitespace));
        Self { words, phrases }
    }
}

#[async_trait]
impl ModerationRule for BlocklistRule {
    fn name(&self) -> &'static str {
        "blocklist"
    }

    async fn check(&self, content: &str, _author: &UserId, _room: &RoomId) -> Result<Verdict> {
        let lowered = content.to_lowercase();
        let hit_word = lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| self.words.iter().any(|word| word == token));
        let hit_phrase = self.phrases.iter().any(|phrase| lowered.contains(phrase));

        if hit_word || hit_phrase {
            Ok(Verdict::Blocked("message contains a blocked term".to_string()))
        } else {
            Ok(Verdict::Approved)
        }
    }
}

/// Repeated-content and burst detection keyed by author and room
pub struct SpamRule {
    window: Duration,
    repeat_threshold: usize,
    burst_threshold: usize,
    history: Mutex<HashMap<(UserId, RoomId), VecDeque<(Instant, [u8; 8])>>>,
}

impl SpamRule {
    const MAX_CONSECUTIVE_CHARS: usize = 10;

    pub fn new(window: Duration, repeat_threshold: usize, burst_threshold: usize) -> Self {
        Self {
            window,
            repeat_threshold: repeat_threshold.max(1),
            burst_threshold: burst_threshold.max(1),
            history: Mutex::new(HashMap::new()),
        }
    }

    fn fingerprint(content: &str) -> [u8; 8] {
        let normalized = content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let digest = Sha256::digest(normalized.as_bytes());
        let mut fingerprint = [0u8; 8];
        fingerprint.copy_from_slice(&digest[..8]);
        fingerprint
    }

    /// Check for excessive character repetition
    fn has_excessive_repetition(content: &str) -> bool {
        let mut previous = None;
        let mut run = 0;
        for c in content.chars() {
            if Some(c) == previous {
                run += 1;
                if run >= Self::MAX_CONSECUTIVE_CHARS {
                    return true;
                }
            } else {
                previous = Some(c);
                run = 1;
            }
        }
        false
    }
}

#[async_trait]
impl ModerationRule for SpamRule {
    fn name(&self) -> &'static str {
        "spam"
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::FailOpen
    }

    async fn check(&self, content: &str, author: &UserId, room: &RoomId) -> Result<Verdict> {
        if Self::has_excessive_repetition(content) {
            return Ok(Verdict::Blocked(
                "message contains excessive repeated characters".to_string(),
            ));
        }

        let now = Instant::now();
        let fingerprint = Self::fingerprint(content);
        let mut history = self.history.lock().await;
        let recent = history.entry((author.clone(), room.clone())).or_default();
        while let Some((at, _)) = recent.front() {
            if now.saturating_duration_since(*at) < self.window {
                break;
            }
            recent.pop_front();
        }

        let repeats = recent.iter().filter(|(_, seen)| *seen == fingerprint).count();
        if repeats >= self.repeat_threshold {
            return Ok(Verdict::Blocked("repeated message".to_string()));
        }
        if recent.len() >= self.burst_threshold {
            return Ok(Verdict::Blocked("sending messages too quickly".to_string()));
        }
        recent.push_back((now, fingerprint));
        Ok(Verdict::Approved)
    }

    async fn sweep(&self, now: Instant) {
        let window = self.window;
        self.history.lock().await.retain(|_, recent| {
            recent
                .back()
                .map(|(at, _)| now.saturating_duration_since(*at) < window)
                .unwrap_or(false)
        });
    }
}

/// Embedded link checks: local domain blocklist, then an optional
/// reputation service bounded by a timeout
pub struct LinkSafetyRule {
    blocked_domains: Vec<String>,
    reputation: Option<Arc<dyn LinkReputation>>,
    timeout: Duration,
    failure_policy: FailurePolicy,
}

impl LinkSafetyRule {
    pub fn new(
        blocked_domains: &[String],
        reputation: Option<Arc<dyn LinkReputation>>,
        timeout: Duration,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            blocked_domains: blocked_domains
                .iter()
                .map(|domain| domain.trim().trim_start_matches('.').to_lowercase())
                .filter(|domain| !domain.is_empty())
                .collect(),
            reputation,
            timeout,
            failure_policy,
        }
    }

    /// Extract the links of a message; `None` when one of them is malformed
    fn extract_links(content: &str) -> Option<Vec<Url>> {
        let mut links = Vec::new();
        for token in content.split_whitespace() {
            let token = token.trim_matches(|c: char| {
                matches!(c, '(' | ')' | '<' | '>' | '"' | '\'' | ',' | '.')
            });
            let lowered = token.to_lowercase();
            let candidate = if lowered.starts_with("http://") || lowered.starts_with("https://") {
                token.to_string()
            } else if lowered.starts_with("www.") {
                format!("https://{}", token)
            } else {
                continue;
            };
            let url = Url::parse(&candidate).ok()?;
            url.host_str()?;
            links.push(url);
        }
        Some(links)
    }

    fn is_blocked_host(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.blocked_domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
    }
}

#[async_trait]
impl ModerationRule for LinkSafetyRule {
    fn name(&self) -> &'static str {
        "link_safety"
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    async fn check(&self, content: &str, _author: &UserId, _room: &RoomId) -> Result<Verdict> {
        let Some(links) = Self::extract_links(content) else {
            return Ok(Verdict::Blocked("message contains a malformed link".to_string()));
        };

        for link in &links {
            if link.host_str().map(|host| self.is_blocked_host(host)).unwrap_or(false) {
                return Ok(Verdict::Blocked("message links to a blocked domain".to_string()));
            }
        }

        let Some(reputation) = &self.reputation else {
            return Ok(Verdict::Approved);
        };
        for link in &links {
            let safe = tokio::time::timeout(self.timeout, reputation.is_safe(link))
                .await
                .map_err(|_| {
                    HubError::UpstreamUnavailable(format!(
                        "link reputation lookup timed out for {}",
                        link
                    ))
                })??;
            if !safe {
                return Ok(Verdict::Blocked("message links to an unsafe site".to_string()));
            }
        }
        Ok(Verdict::Approved)
    }
}

/// Ordered rule pipeline; runs before a message is sequenced
pub struct ModerationGate {
    rules: Vec<Box<dyn ModerationRule>>,
}

impl ModerationGate {
    pub fn new(rules: Vec<Box<dyn ModerationRule>>) -> Self {
        Self { rules }
    }

    /// Gate with no rules; approves everything
    pub fn permissive() -> Self {
        Self::new(Vec::new())
    }

    /// Standard pipeline built from configuration
    pub fn from_config(
        config: &ModerationConfig,
        reputation: Option<Arc<dyn LinkReputation>>,
    ) -> Self {
        Self::new(vec![
            Box::new(BlocklistRule::new(&config.blocklist)),
            Box::new(SpamRule::new(
                config.spam_window,
                config.spam_repeat_threshold,
                config.spam_burst_threshold,
            )),
            Box::new(LinkSafetyRule::new(
                &config.blocked_domains,
                reputation,
                config.link_check_timeout,
                config.link_failure_policy,
            )),
        ])
    }

    pub async fn evaluate(&self, content: &str, author: &UserId, room: &RoomId) -> Verdict {
        for rule in &self.rules {
            match rule.check(content, author, room).await {
                Ok(Verdict::Approved) => continue,
                Ok(blocked) => {
                    log::debug!("Rule {} blocked message from {} in {}", rule.name(), author, room);
                    return blocked;
                }
                Err(e) => {
                    log::warn!("Moderation rule {} unavailable: {}", rule.name(), e);
                    match rule.failure_policy() {
                        FailurePolicy::FailOpen => continue,
                        FailurePolicy::FailClosed => {
                            return Verdict::Blocked("message could not be verified".to_string())
                        }
                    }
                }
            }
        }
        Verdict::Approved
    }

    pub async fn sweep(&self, now: Instant) {
        for rule in &self.rules {
            rule.sweep(now).await;
        }
    }
}
