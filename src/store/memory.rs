//! In-process shared store.
//!
//! Mirrors the semantics of the Redis scripts so several engines in one
//! process can share it. Useful for single-instance deployments and for
//! exercising multi-instance behaviour without a live Redis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{
    BanEntry, Keyspace, Message, MessageStream, OpOutcome, RemoteWindow, SharedStore, StoreOp,
    VisitOutcome, WindowGrant,
};
use crate::error::{GliderError, Result};
use crate::ratelimit::{Micros, VisitorKey};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Partition {
    windows: HashMap<VisitorKey, RemoteWindow>,
    bans: HashMap<VisitorKey, Micros>,
}

/// A `SharedStore` held entirely in memory.
pub struct MemoryStore {
    partitions: Mutex<HashMap<String, Partition>>,
    messages: broadcast::Sender<Message>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            partitions: Mutex::new(HashMap::new()),
            messages,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GliderError::StoreUnavailable("memory store offline".into()))
        }
    }

    /// Current window record for a key, live or not.
    pub fn window(&self, key: &VisitorKey, keyspace: &Keyspace) -> Option<RemoteWindow> {
        self.partitions
            .lock()
            .get(keyspace.partition())
            .and_then(|p| p.windows.get(key).copied())
    }

    /// Ban expiry recorded in the ban set for a key.
    pub fn ban(&self, key: &VisitorKey, keyspace: &Keyspace) -> Option<Micros> {
        self.partitions
            .lock()
            .get(keyspace.partition())
            .and_then(|p| p.bans.get(key).copied())
    }

    /// Record a ban directly, as another instance would.
    pub fn insert_ban(&self, key: VisitorKey, expiry: Micros, keyspace: &Keyspace) {
        self.partitions
            .lock()
            .entry(keyspace.partition().to_string())
            .or_default()
            .bans
            .insert(key, expiry);
    }

    fn visit(partition: &mut Partition, key: &VisitorKey, at: Micros) -> VisitOutcome {
        let Some(window) = partition.windows.get_mut(key) else {
            return VisitOutcome::Missing;
        };
        if window.expiry <= at {
            return VisitOutcome::Missing;
        }
        if window.remaining == 0 {
            partition.bans.insert(key.clone(), window.expiry);
            return VisitOutcome::Exhausted {
                expiry: window.expiry,
            };
        }
        window.remaining -= 1;
        VisitOutcome::Counted {
            remaining: window.remaining,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn create_window(
        &self,
        key: &VisitorKey,
        window_expiry: Micros,
        now: Micros,
        initial_remaining: u64,
        keyspace: &Keyspace,
    ) -> Result<WindowGrant> {
        self.check_available()?;
        let mut partitions = self.partitions.lock();
        let partition = partitions
            .entry(keyspace.partition().to_string())
            .or_default();

        match partition.windows.get(key).copied() {
            Some(window) if window.expiry > now => match Self::visit(partition, key, now) {
                VisitOutcome::Counted { remaining } => Ok(WindowGrant {
                    created: false,
                    admitted: true,
                    remaining,
                    expiry: window.expiry,
                }),
                _ => Ok(WindowGrant {
                    created: false,
                    admitted: false,
                    remaining: 0,
                    expiry: window.expiry,
                }),
            },
            _ => {
                partition.windows.insert(
                    key.clone(),
                    RemoteWindow {
                        remaining: initial_remaining,
                        expiry: window_expiry,
                    },
                );
                Ok(WindowGrant {
                    created: true,
                    admitted: true,
                    remaining: initial_remaining,
                    expiry: window_expiry,
                })
            }
        }
    }

    async fn record_visit(
        &self,
        key: &VisitorKey,
        at: Micros,
        keyspace: &Keyspace,
    ) -> Result<VisitOutcome> {
        self.check_available()?;
        let mut partitions = self.partitions.lock();
        let partition = partitions
            .entry(keyspace.partition().to_string())
            .or_default();
        Ok(Self::visit(partition, key, at))
    }

    async fn batch_execute(
        &self,
        ops: &[StoreOp],
        keyspace: &Keyspace,
    ) -> Result<Vec<Result<OpOutcome>>> {
        self.check_available()?;
        let mut partitions = self.partitions.lock();
        let partition = partitions
            .entry(keyspace.partition().to_string())
            .or_default();

        let results = ops
            .iter()
            .map(|op| match op {
                StoreOp::Visit { key, at } => Ok(OpOutcome::Visit(Self::visit(partition, key, *at))),
                StoreOp::Ban { key, expiry } => {
                    partition.bans.insert(key.clone(), *expiry);
                    Ok(OpOutcome::Banned)
                }
            })
            .collect();
        Ok(results)
    }

    async fn read_remaining(
        &self,
        keys: &[VisitorKey],
        keyspace: &Keyspace,
    ) -> Result<HashMap<VisitorKey, RemoteWindow>> {
        self.check_available()?;
        let partitions = self.partitions.lock();
        let Some(partition) = partitions.get(keyspace.partition()) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| partition.windows.get(key).map(|w| (key.clone(), *w)))
            .collect())
    }

    async fn prune_expired_windows(
        &self,
        keyspace: &Keyspace,
        before: Micros,
        limit: usize,
    ) -> Result<u64> {
        self.check_available()?;
        let mut partitions = self.partitions.lock();
        let Some(partition) = partitions.get_mut(keyspace.partition()) else {
            return Ok(0);
        };
        let expired: Vec<VisitorKey> = partition
            .windows
            .iter()
            .filter(|(_, window)| window.expiry <= before)
            .map(|(key, _)| key.clone())
            .take(limit)
            .collect();
        for key in &expired {
            partition.windows.remove(key);
        }
        Ok(expired.len() as u64)
    }

    async fn list_expired_bans(
        &self,
        keyspace: &Keyspace,
        before: Micros,
    ) -> Result<Vec<BanEntry>> {
        self.check_available()?;
        Ok(self.collect_bans(keyspace, |expiry| expiry <= before))
    }

    async fn list_active_bans(&self, keyspace: &Keyspace, after: Micros) -> Result<Vec<BanEntry>> {
        self.check_available()?;
        Ok(self.collect_bans(keyspace, |expiry| expiry > after))
    }

    async fn prune_expired_bans(&self, keyspace: &Keyspace, before: Micros) -> Result<u64> {
        self.check_available()?;
        let mut partitions = self.partitions.lock();
        let Some(partition) = partitions.get_mut(keyspace.partition()) else {
            return Ok(0);
        };
        let len = partition.bans.len();
        partition.bans.retain(|_, expiry| *expiry > before);
        Ok((len - partition.bans.len()) as u64)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.check_available()?;
        // No receivers is not an error for pub/sub
        let receivers = self
            .messages
            .send((channel.to_string(), message.to_string()))
            .unwrap_or(0);
        debug!(channel = %channel, receivers = receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        self.check_available()?;
        let channels = channels.to_vec();
        let stream = BroadcastStream::new(self.messages.subscribe()).filter_map(move |item| {
            let message = match item {
                Ok((channel, payload)) if channels.contains(&channel) => Some((channel, payload)),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Subscriber lagged behind, messages dropped");
                    None
                }
            };
            futures::future::ready(message)
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

impl MemoryStore {
    fn collect_bans(&self, keyspace: &Keyspace, keep: impl Fn(Micros) -> bool) -> Vec<BanEntry> {
        let partitions = self.partitions.lock();
        let Some(partition) = partitions.get(keyspace.partition()) else {
            return Vec::new();
        };
        let mut bans: Vec<BanEntry> = partition
            .bans
            .iter()
            .filter(|(_, expiry)| keep(**expiry))
            .map(|(key, expiry)| BanEntry {
                key: key.clone(),
                expiry: *expiry,
            })
            .collect();
        bans.sort_by_key(|ban| ban.expiry);
        bans
    }
}
