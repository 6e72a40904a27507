//! Ban propagation across instances.
//!
//! Every instance subscribes to the partition's ban and unban channels and
//! mirrors what it hears into its local caches, so a ban issued anywhere is
//! enforced everywhere after one network hop.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::clock::Micros;
use super::engine::AdmissionEngine;
use super::key::VisitorKey;
use crate::error::{GliderError, Result};
use crate::store::MessageStream;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// A decoded `<key>:<expiry>` pub/sub payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanMessage {
    pub key: VisitorKey,
    pub expiry: Micros,
}

impl BanMessage {
    pub fn new(key: VisitorKey, expiry: Micros) -> Self {
        Self { key, expiry }
    }

    pub fn parse(payload: &str) -> Result<Self> {
        let (key, expiry) = payload
            .rsplit_once(':')
            .ok_or_else(|| GliderError::MalformedMessage(payload.to_string()))?;
        if key.is_empty() {
            return Err(GliderError::MalformedMessage(payload.to_string()));
        }
        let expiry = expiry
            .parse()
            .map_err(|_| GliderError::MalformedMessage(payload.to_string()))?;
        Ok(Self {
            key: VisitorKey::from_encoded(key),
            expiry,
        })
    }
}

impl std::fmt::Display for BanMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key, self.expiry)
    }
}

/// Listens for ban/unban messages and applies them to an engine.
pub struct BanPropagator {
    engine: Arc<AdmissionEngine>,
    ban_channel: String,
    unban_channel: String,
}

impl BanPropagator {
    pub fn new(engine: Arc<AdmissionEngine>) -> Self {
        let keyspace = engine.keyspace();
        Self {
            ban_channel: keyspace.ban_channel(),
            unban_channel: keyspace.unban_channel(),
            engine,
        }
    }

    /// Subscribe to both channels.
    pub async fn subscribe(&self) -> Result<MessageStream> {
        self.engine
            .store()
            .subscribe(&[self.ban_channel.clone(), self.unban_channel.clone()])
            .await
    }

    /// Apply one message. Malformed payloads are reported, never applied.
    pub fn handle_message(&self, channel: &str, payload: &str) -> Result<()> {
        let message = BanMessage::parse(payload)?;

        if channel == self.ban_channel {
            if self.engine.apply_ban(&message.key, message.expiry) {
                debug!(key = %message.key, expiry = message.expiry, "Applied remote ban");
            }
        } else if channel == self.unban_channel {
            self.engine.apply_unban(&message.key, message.expiry)?;
            debug!(key = %message.key, "Applied remote unban");
        } else {
            trace!(channel = %channel, "Ignoring message on unknown channel");
        }
        Ok(())
    }

    /// Consume `messages` until `shutdown` flips to true.
    ///
    /// A subscription that ends (e.g. the connection dropped) is replaced
    /// with a new one, retrying with capped exponential backoff.
    pub async fn run(self, mut messages: MessageStream, mut shutdown: watch::Receiver<bool>) {
        info!(
            ban_channel = %self.ban_channel,
            unban_channel = %self.unban_channel,
            "Ban propagator started"
        );

        loop {
            tokio::select! {
                message = messages.next() => match message {
                    Some((channel, payload)) => {
                        if let Err(e) = self.handle_message(&channel, &payload) {
                            warn!(channel = %channel, error = %e, "Discarding pub/sub message");
                        }
                    }
                    None => {
                        warn!("Subscription stream ended, resubscribing");
                        match self.resubscribe(&mut shutdown).await {
                            Some(stream) => messages = stream,
                            None => break,
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Dropping the stream tears the subscription down
        drop(messages);
        info!("Ban propagator stopped");
    }

    /// Subscribe again, backing off between failures. Returns `None` on shutdown.
    async fn resubscribe(&self, shutdown: &mut watch::Receiver<bool>) -> Option<MessageStream> {
        let mut backoff = RESUBSCRIBE_BACKOFF;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                    continue;
                }
            }

            match self.subscribe().await {
                Ok(stream) => {
                    info!("Resubscribed to ban channels");
                    self.resync_bans().await;
                    return Some(stream);
                }
                Err(e) => {
                    backoff = (backoff * 2).min(MAX_RESUBSCRIBE_BACKOFF);
                    warn!(
                        error = %e,
                        retry_ms = backoff.as_millis() as u64,
                        "Resubscribe failed"
                    );
                }
            }
        }
    }

    /// Pick up bans published while no subscription was active.
    async fn resync_bans(&self) {
        let store = self.engine.store();
        match store
            .list_active_bans(self.engine.keyspace(), self.engine.now())
            .await
        {
            Ok(bans) => {
                let seeded = self.engine.seed_bans(&bans);
                debug!(seeded = seeded, "Resynced bans after resubscribe");
            }
            Err(e) => warn!(error = %e, "Ban resync failed"),
        }
    }

    /// Run on a background task.
    pub fn spawn(
        self,
        messages: MessageStream,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(messages, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{FailurePolicy, LimiterSettings, ManualClock};
    use crate::store::{
        BanEntry, Keyspace, MemoryStore, OpOutcome, RemoteWindow, SharedStore, StoreOp,
        VisitOutcome, WindowGrant,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const START: Micros = 1_700_000_000_000_000;

    fn engine(store: Arc<MemoryStore>, clock: Arc<ManualClock>, quota: u64) -> Arc<AdmissionEngine> {
        let settings = LimiterSettings {
            partition_key: "test".to_string(),
            quota,
            window: Duration::from_secs(60),
            flush_interval: Duration::from_millis(50),
            local_cache_capacity: 100,
            failure_policy: FailurePolicy::Open,
        };
        Arc::new(AdmissionEngine::new(settings, store, clock))
    }

    #[test]
    fn test_parse_message() {
        let message = BanMessage::parse("0x01020304:1700000060000000").unwrap();
        assert_eq!(message.key.as_str(), "0x01020304");
        assert_eq!(message.expiry, 1_700_000_060_000_000);
        assert_eq!(message.to_string(), "0x01020304:1700000060000000");
    }

    #[test]
    fn test_parse_malformed() {
        for payload in ["", "0x01020304", "0x01020304:", ":123", "0x01020304:abc"] {
            assert!(
                matches!(BanMessage::parse(payload), Err(GliderError::MalformedMessage(_))),
                "{:?} should be rejected",
                payload
            );
        }
    }

    #[tokio::test]
    async fn test_ban_message_denies_without_store_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let engine = engine(store.clone(), clock, 5);
        let propagator = BanPropagator::new(engine.clone());
        let key = VisitorKey::encode("1.2.3.4").unwrap();

        engine.admit(&key).await;
        propagator
            .handle_message("test-ban", &format!("{}:{}", key, START + 10_000_000))
            .unwrap();

        store.set_available(false);
        let admission = engine.admit(&key).await;
        assert!(!admission.is_allowed());
        assert_eq!(admission.reset_at, START + 10_000_000);
    }

    #[tokio::test]
    async fn test_unban_seeds_full_quota() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let engine = engine(store, clock, 5);
        let propagator = BanPropagator::new(engine.clone());
        let key = VisitorKey::encode("1.2.3.4").unwrap();

        propagator
            .handle_message("test-ban", &format!("{}:{}", key, START + 1))
            .unwrap();
        propagator
            .handle_message("test-unban", &format!("{}:{}", key, START + 1))
            .unwrap();

        assert!(engine.ban_expiry(&key).is_none());
        assert_eq!(engine.visitor(&key).unwrap().remaining, 5);
    }

    #[tokio::test]
    async fn test_unban_keeps_existing_window() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let engine = engine(store, clock, 5);
        let propagator = BanPropagator::new(engine.clone());
        let key = VisitorKey::encode("1.2.3.4").unwrap();

        engine.admit(&key).await;
        propagator
            .handle_message("test-unban", &format!("{}:{}", key, START))
            .unwrap();
        assert_eq!(engine.visitor(&key).unwrap().remaining, 4);
    }

    #[tokio::test]
    async fn test_unban_with_out_of_range_expiry_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Arc::new(ManualClock::new(START)), 5);
        let propagator = BanPropagator::new(engine.clone());
        let key = VisitorKey::encode("1.2.3.4").unwrap();

        let result = propagator.handle_message("test-unban", &format!("{}:{}", key, u64::MAX));
        assert!(matches!(result, Err(GliderError::MalformedMessage(_))));
        assert!(engine.visitor(&key).is_none());
    }

    #[tokio::test]
    async fn test_other_partition_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Arc::new(ManualClock::new(START)), 5);
        let propagator = BanPropagator::new(engine.clone());
        let key = VisitorKey::encode("1.2.3.4").unwrap();

        propagator
            .handle_message("other-ban", &format!("{}:{}", key, START + 1_000_000))
            .unwrap();
        assert!(engine.ban_expiry(&key).is_none());
    }

    #[tokio::test]
    async fn test_two_instances_converge_on_ban() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let a = engine(store.clone(), clock.clone(), 3);
        let b = engine(store.clone(), clock.clone(), 3);
        let key = VisitorKey::encode("1.2.3.4").unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let propagator = BanPropagator::new(b.clone());
        let messages = propagator.subscribe().await.unwrap();
        let handle = propagator.spawn(messages, shutdown_rx);

        for _ in 0..3 {
            assert!(a.admit(&key).await.is_allowed());
        }
        assert!(!a.admit(&key).await.is_allowed());

        // Give the propagator a moment to receive the ban
        let mut banned = false;
        for _ in 0..50 {
            if b.ban_expiry(&key).is_some() {
                banned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(banned, "instance B should have received the ban");

        store.set_available(false);
        let admission = b.admit(&key).await;
        assert!(!admission.is_allowed());
        assert_eq!(admission.reset_at, START + 60_000_000);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// Delegates to a `MemoryStore`, but the first subscription ends at once.
    struct DroppingStore {
        inner: MemoryStore,
        subscribes: AtomicUsize,
    }

    #[async_trait]
    impl SharedStore for DroppingStore {
        async fn create_window(
            &self,
            key: &VisitorKey,
            window_expiry: Micros,
            now: Micros,
            initial_remaining: u64,
            keyspace: &Keyspace,
        ) -> Result<WindowGrant> {
            self.inner
                .create_window(key, window_expiry, now, initial_remaining, keyspace)
                .await
        }

        async fn record_visit(
            &self,
            key: &VisitorKey,
            at: Micros,
            keyspace: &Keyspace,
        ) -> Result<VisitOutcome> {
            self.inner.record_visit(key, at, keyspace).await
        }

        async fn batch_execute(
            &self,
            ops: &[StoreOp],
            keyspace: &Keyspace,
        ) -> Result<Vec<Result<OpOutcome>>> {
            self.inner.batch_execute(ops, keyspace).await
        }

        async fn read_remaining(
            &self,
            keys: &[VisitorKey],
            keyspace: &Keyspace,
        ) -> Result<HashMap<VisitorKey, RemoteWindow>> {
            self.inner.read_remaining(keys, keyspace).await
        }

        async fn prune_expired_windows(
            &self,
            keyspace: &Keyspace,
            before: Micros,
            limit: usize,
        ) -> Result<u64> {
            self.inner.prune_expired_windows(keyspace, before, limit).await
        }

        async fn list_expired_bans(
            &self,
            keyspace: &Keyspace,
            before: Micros,
        ) -> Result<Vec<BanEntry>> {
            self.inner.list_expired_bans(keyspace, before).await
        }

        async fn list_active_bans(
            &self,
            keyspace: &Keyspace,
            after: Micros,
        ) -> Result<Vec<BanEntry>> {
            self.inner.list_active_bans(keyspace, after).await
        }

        async fn prune_expired_bans(&self, keyspace: &Keyspace, before: Micros) -> Result<u64> {
            self.inner.prune_expired_bans(keyspace, before).await
        }

        async fn publish(&self, channel: &str, message: &str) -> Result<()> {
            self.inner.publish(channel, message).await
        }

        async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
            if self.subscribes.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(futures::stream::empty().boxed());
            }
            self.inner.subscribe(channels).await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_resubscribes_after_stream_ends() {
        let store = Arc::new(DroppingStore {
            inner: MemoryStore::new(),
            subscribes: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::new(START));
        let settings = LimiterSettings {
            partition_key: "test".to_string(),
            quota: 5,
            window: Duration::from_secs(60),
            flush_interval: Duration::from_millis(50),
            local_cache_capacity: 100,
            failure_policy: FailurePolicy::Open,
        };
        let engine = Arc::new(AdmissionEngine::new(settings, store.clone(), clock));
        let ks = engine.keyspace().clone();
        let missed = VisitorKey::encode("5.6.7.8").unwrap();
        let key = VisitorKey::encode("1.2.3.4").unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let propagator = BanPropagator::new(engine.clone());
        let messages = propagator.subscribe().await.unwrap();
        let handle = propagator.spawn(messages, shutdown_rx);

        // Lands in the store while nothing is subscribed
        store.inner.insert_ban(missed.clone(), START + 9_000_000, &ks);

        assert!(wait_until(|| store.subscribes.load(Ordering::SeqCst) >= 2).await);
        assert!(wait_until(|| engine.ban_expiry(&missed).is_some()).await);

        store
            .publish("test-ban", &format!("{}:{}", key, START + 5_000_000))
            .await
            .unwrap();
        assert!(wait_until(|| engine.ban_expiry(&key) == Some(START + 5_000_000)).await);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_while_resubscribing() {
        let store = Arc::new(DroppingStore {
            inner: MemoryStore::new(),
            subscribes: AtomicUsize::new(0),
        });
        store.inner.set_available(false);
        let engine = Arc::new(AdmissionEngine::new(
            LimiterSettings::default(),
            store.clone(),
            Arc::new(ManualClock::new(START)),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let propagator = BanPropagator::new(engine);
        let messages = propagator.subscribe().await.unwrap();
        let handle = propagator.spawn(messages, shutdown_rx);

        assert!(wait_until(|| store.subscribes.load(Ordering::SeqCst) >= 2).await);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_message_does_not_stop_loop() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone(), Arc::new(ManualClock::new(START)), 5);
        let key = VisitorKey::encode("1.2.3.4").unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let propagator = BanPropagator::new(engine.clone());
        let messages = propagator.subscribe().await.unwrap();
        let handle = propagator.spawn(messages, shutdown_rx);

        store.publish("test-ban", "garbage").await.unwrap();
        store
            .publish("test-ban", &format!("{}:{}", key, START + 5_000_000))
            .await
            .unwrap();

        let mut banned = false;
        for _ in 0..50 {
            if engine.ban_expiry(&key).is_some() {
                banned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(banned);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
