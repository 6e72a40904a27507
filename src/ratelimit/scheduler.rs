//! Periodic synchronization with the shared store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::engine::AdmissionEngine;
use super::propagator::BanMessage;
use crate::error::Result;

/// Most expired window records dropped from the store per tick.
const WINDOW_PRUNE_BATCH: usize = 1000;

/// What a single tick accomplished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub flushed: usize,
    pub refreshed: usize,
    pub unbanned: usize,
    pub expired_windows: u64,
    pub store_alive: bool,
}

/// Drives flush, refresh, liveness and ban pruning on a fixed interval.
pub struct SyncScheduler {
    engine: Arc<AdmissionEngine>,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(engine: Arc<AdmissionEngine>) -> Self {
        let interval = engine.settings().flush_interval;
        Self { engine, interval }
    }

    /// Restore ban state after a restart.
    ///
    /// Drops bans that expired while no instance was pruning and seeds the
    /// local ban cache with the ones still in force. Returns how many bans
    /// were seeded.
    pub async fn recover_bans(&self) -> Result<usize> {
        let store = self.engine.store();
        let keyspace = self.engine.keyspace();
        let now = self.engine.now();

        let expired = store.list_expired_bans(keyspace, now).await?;
        if !expired.is_empty() {
            let removed = store.prune_expired_bans(keyspace, now).await?;
            debug!(removed = removed, "Pruned bans that expired before startup");
        }

        let active = store.list_active_bans(keyspace, now).await?;
        Ok(self.engine.seed_bans(&active))
    }

    /// Run one synchronization pass: flush, refresh, liveness probe, then
    /// pruning of expired bans and windows. Each step runs even if an earlier
    /// one failed.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.engine.flush().await {
            Ok(flushed) => report.flushed = flushed,
            Err(e) => warn!(error = %e, "Flush step failed"),
        }

        match self.engine.refresh().await {
            Ok(refreshed) => report.refreshed = refreshed,
            Err(e) => warn!(error = %e, "Refresh step failed"),
        }

        match self.engine.store().ping().await {
            Ok(()) => report.store_alive = true,
            Err(e) => warn!(error = %e, "Shared store liveness probe failed"),
        }

        match self.prune_bans().await {
            Ok(unbanned) => report.unbanned = unbanned,
            Err(e) => warn!(error = %e, "Ban pruning failed"),
        }

        let store = self.engine.store();
        match store
            .prune_expired_windows(self.engine.keyspace(), self.engine.now(), WINDOW_PRUNE_BATCH)
            .await
        {
            Ok(expired) => report.expired_windows = expired,
            Err(e) => warn!(error = %e, "Window pruning failed"),
        }

        report
    }

    /// Remove expired bans from the store and announce each as an unban.
    async fn prune_bans(&self) -> Result<usize> {
        let store = self.engine.store();
        let keyspace = self.engine.keyspace();
        let now = self.engine.now();

        let expired = store.list_expired_bans(keyspace, now).await?;
        if expired.is_empty() {
            return Ok(0);
        }
        store.prune_expired_bans(keyspace, now).await?;

        let channel = keyspace.unban_channel();
        for ban in &expired {
            let message = BanMessage::new(ban.key.clone(), ban.expiry);
            if let Err(e) = store.publish(&channel, &message.to_string()).await {
                warn!(key = %ban.key, error = %e, "Failed to publish unban");
            }
        }
        Ok(expired.len())
    }

    /// Tick until `shutdown` flips to true, then flush one last time.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Sync scheduler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    debug!(
                        flushed = report.flushed,
                        refreshed = report.refreshed,
                        unbanned = report.unbanned,
                        expired_windows = report.expired_windows,
                        store_alive = report.store_alive,
                        "Sync tick complete"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        match self.engine.flush().await {
            Ok(flushed) => info!(flushed = flushed, "Final flush complete"),
            Err(e) => warn!(error = %e, "Final flush failed"),
        }
        info!("Sync scheduler stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
