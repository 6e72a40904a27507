//! Lifecycle of a running rate limiter.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::clock::Clock;
use super::engine::AdmissionEngine;
use super::propagator::BanPropagator;
use super::scheduler::SyncScheduler;
use super::settings::LimiterSettings;
use crate::error::Result;
use crate::store::SharedStore;

/// An admission engine together with its background tasks.
///
/// `start` recovers bans, subscribes to ban propagation and launches the
/// sync scheduler; `stop` shuts both down and flushes what is still queued.
pub struct RateLimitService {
    engine: Arc<AdmissionEngine>,
    shutdown: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    propagator: JoinHandle<()>,
}

impl RateLimitService {
    pub async fn start(
        settings: LimiterSettings,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let engine = Arc::new(AdmissionEngine::new(settings, store, clock));
        info!(
            instance = %engine.id(),
            partition = %engine.keyspace().partition(),
            quota = engine.settings().quota,
            window_secs = engine.settings().window.as_secs(),
            "Starting rate limiter"
        );

        let scheduler = SyncScheduler::new(engine.clone());
        match scheduler.recover_bans().await {
            Ok(seeded) => info!(seeded = seeded, "Ban recovery complete"),
            Err(e) => warn!(error = %e, "Ban recovery failed, continuing without"),
        }

        // Subscribe before serving so no ban published from now on is missed
        let propagator = BanPropagator::new(engine.clone());
        let messages = propagator.subscribe().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let propagator = propagator.spawn(messages, shutdown_rx.clone());
        let scheduler = scheduler.spawn(shutdown_rx);

        Ok(Self {
            engine,
            shutdown,
            scheduler,
            propagator,
        })
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    /// Stop background tasks, flushing queued writes first.
    pub async fn stop(self) {
        info!(instance = %self.engine.id(), "Stopping rate limiter");
        let _ = self.shutdown.send(true);

        if let Err(e) = self.scheduler.await {
            error!(error = %e, "Sync scheduler task failed");
        }
        if let Err(e) = self.propagator.await {
            error!(error = %e, "Ban propagator task failed");
        }
        info!("Rate limiter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{FailurePolicy, ManualClock, Micros, VisitorKey};
    use crate::store::MemoryStore;
    use std::time::Duration;

    const START: Micros = 1_700_000_000_000_000;

    fn settings(quota: u64) -> LimiterSettings {
        LimiterSettings {
            partition_key: "test".to_string(),
            quota,
            window: Duration::from_secs(60),
            flush_interval: Duration::from_millis(20),
            local_cache_capacity: 100,
            failure_policy: FailurePolicy::Open,
        }
    }

    #[tokio::test]
    async fn test_start_recovers_bans_and_stop_flushes() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let banned = VisitorKey::encode("10.1.1.1").unwrap();
        store.insert_ban(banned.clone(), START + 1_000_000, &settings(3).keyspace());

        let service = RateLimitService::start(settings(3), store.clone(), clock)
            .await
            .unwrap();
        let engine = service.engine().clone();
        assert!(!engine.admit(&banned).await.is_allowed());

        let k = VisitorKey::encode("10.1.1.2").unwrap();
        engine.admit(&k).await;
        engine.admit(&k).await;

        service.stop().await;
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(store.window(&k, engine.keyspace()).unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn test_start_fails_without_subscription() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let result =
            RateLimitService::start(settings(3), store, Arc::new(ManualClock::new(START))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_two_services_share_ban() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let a = RateLimitService::start(settings(3), store.clone(), clock.clone())
            .await
            .unwrap();
        let b = RateLimitService::start(settings(3), store.clone(), clock.clone())
            .await
            .unwrap();
        let k = VisitorKey::encode("1.2.3.4").unwrap();

        for expected in [2, 1, 0] {
            assert_eq!(a.engine().admit(&k).await.remaining, expected);
        }
        assert!(!a.engine().admit(&k).await.is_allowed());

        let mut seen = false;
        for _ in 0..50 {
            if b.engine().ban_expiry(&k) == Some(START + 60_000_000) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);

        store.set_available(false);
        let denied = b.engine().admit(&k).await;
        assert!(!denied.is_allowed());
        assert_eq!(denied.reset_at, START + 60_000_000);
        store.set_available(true);

        a.stop().await;
        b.stop().await;
    }
}
