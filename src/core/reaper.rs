//! Idle reaper: periodic eviction of stale connections
//!
//! Each sweep works from a snapshot of the registry and re-validates every
//! candidate before removing it, so it never holds a registry lock for the
//! duration of the scan.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::config::HubConfig;
use crate::core::router::SharedRouter;

/// Background sweep over the connection registry
pub struct IdleReaper {
    router: SharedRouter,
    interval: Duration,
    idle_timeout: Duration,
    max_evictions: usize,
    presence_retention: Duration,
}

/// What a single sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub marked_away: usize,
    /// Offline presence records dropped after the retention window
    pub pruned_presence: usize,
}

impl IdleReaper {
    pub fn new(router: SharedRouter, config: &HubConfig) -> Self {
        Self {
            router,
            interval: config.reaper_interval,
            idle_timeout: config.idle_timeout,
            max_evictions: config.reaper_max_evictions,
            presence_retention: config.presence_retention,
        }
    }

    /// Run one sweep at `now`
    pub async fn sweep_once(&self, now: Instant) -> SweepReport {
        let evicted = self
            .router
            .reap(now, self.idle_timeout, self.max_evictions)
            .await;
        let presence = self.router.presence();
        let marked_away = presence.sweep_away(now).await;
        let pruned_presence = presence.prune_offline(now, self.presence_retention).await;
        self.router.moderation().sweep(now).await;

        if evicted > 0 {
            log::info!("Reaper evicted {} idle connections", evicted);
        }
        if evicted == self.max_evictions {
            log::warn!(
                "Reaper hit its cap of {} evictions; the rest waits for the next sweep",
                self.max_evictions
            );
        }
        SweepReport {
            evicted,
            marked_away,
            pruned_presence,
        }
    }

    /// Start sweeping on a fixed interval
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = self.sweep_once(Instant::now()).await;
                log::debug!("Reaper sweep: {:?}", report);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::provider::Identity;
    use crate::core::router::MessageRouter;

    fn config() -> HubConfig {
        HubConfig {
            idle_timeout: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(60),
            reaper_max_evictions: 2,
            presence_grace: Duration::from_secs(1),
            presence_retention: Duration::from_secs(600),
            ..HubConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_idle_connections() {
        let router = MessageRouter::builder(config()).build().await.unwrap();
        let reaper = IdleReaper::new(router.clone(), &config());
        let (idle, _h1) = router.register(Identity::new("alice", "acme")).await.unwrap();
        let (busy, _h2) = router.register(Identity::new("bob", "acme")).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        busy.touch();

        let report = reaper.sweep_once(Instant::now()).await;
        assert_eq!(report.evicted, 1);
        assert!(!router.connections().contains(&idle.id).await);
        assert!(router.connections().contains(&busy.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_respects_eviction_cap() {
        let router = MessageRouter::builder(config()).build().await.unwrap();
        let reaper = IdleReaper::new(router.clone(), &config());
        let mut handles = Vec::new();
        for user in ["a", "b", "c"] {
            handles.push(router.register(Identity::new(user, "acme")).await.unwrap());
        }

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(reaper.sweep_once(Instant::now()).await.evicted, 2);
        assert_eq!(reaper.sweep_once(Instant::now()).await.evicted, 1);
        assert_eq!(router.connections().connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_prunes_long_offline_presence() {
        let router = MessageRouter::builder(config()).build().await.unwrap();
        let reaper = IdleReaper::new(router.clone(), &config());
        let (alice, _handle) = router.register(Identity::new("alice", "acme")).await.unwrap();
        router.remove(&alice.id).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(router.presence().snapshot(&"alice".into()).await.is_some());

        tokio::time::advance(Duration::from_secs(601)).await;
        let report = reaper.sweep_once(Instant::now()).await;
        assert_eq!(report.pruned_presence, 1);
        assert!(router.presence().snapshot(&"alice".into()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reaper_collects_closed_connections() {
        let router = MessageRouter::builder(config()).build().await.unwrap();
        let (gone, handle) = router.register(Identity::new("alice", "acme")).await.unwrap();
        drop(handle);

        let task = IdleReaper::new(router.clone(), &config()).spawn();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!router.connections().contains(&gone.id).await);
        task.abort();
    }
}
