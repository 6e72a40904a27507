//! Shared store abstraction.
//!
//! Every instance of the gateway talks to one shared key-value/pub-sub
//! backend. Windows are only created, and the final "quota crossed" decision
//! is only made, inside the atomic operations of this trait; everything else
//! the engine keeps locally is an optimistic copy.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::ratelimit::{Micros, VisitorKey};

/// Store key and channel names derived from a partition key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    partition: String,
}

impl Keyspace {
    pub fn new(partition: &str) -> Self {
        Self {
            partition: partition.to_string(),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Hash of visitor key to remaining quota.
    pub fn remaining_hash(&self) -> String {
        format!("{}-remaining", self.partition)
    }

    /// Hash of visitor key to window expiry.
    pub fn expiry_hash(&self) -> String {
        format!("{}-expiry", self.partition)
    }

    /// Sorted set of visitor keys scored by window expiry.
    pub fn window_index(&self) -> String {
        format!("{}-windows", self.partition)
    }

    /// Sorted set of banned visitor keys scored by ban expiry.
    pub fn ban_set(&self) -> String {
        format!("{}-ban", self.partition)
    }

    pub fn ban_channel(&self) -> String {
        format!("{}-ban", self.partition)
    }

    pub fn unban_channel(&self) -> String {
        format!("{}-unban", self.partition)
    }
}

/// Result of the atomic `createKey` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGrant {
    /// This call opened the window
    pub created: bool,
    /// The request fits in the window's quota
    pub admitted: bool,
    /// Quota left after this request
    pub remaining: u64,
    /// End of the window
    pub expiry: Micros,
}

/// Result of the atomic `visitKey` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    /// The visit was charged against a live window.
    Counted { remaining: u64 },
    /// The window had no quota left; the store recorded a ban until `expiry`.
    Exhausted { expiry: Micros },
    /// No live window exists for the key; nothing was changed.
    Missing,
}

/// A queued operation awaiting a batched flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Charge one request made at `at` against the key's window.
    Visit { key: VisitorKey, at: Micros },
    /// Record a ban in the ban sorted set.
    Ban { key: VisitorKey, expiry: Micros },
}

impl StoreOp {
    pub fn key(&self) -> &VisitorKey {
        match self {
            StoreOp::Visit { key, .. } | StoreOp::Ban { key, .. } => key,
        }
    }
}

/// Per-operation result of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Visit(VisitOutcome),
    Banned,
}

/// Window state as the store currently holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteWindow {
    pub remaining: u64,
    pub expiry: Micros,
}

/// A ban as held in the ban sorted set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub key: VisitorKey,
    pub expiry: Micros,
}

/// A pub/sub message as `(channel, payload)`.
pub type Message = (String, String);

/// Stream of messages from a subscription. Dropping it ends the subscription.
pub type MessageStream = BoxStream<'static, Message>;

/// The operations the rate limiter needs from the shared backend.
///
/// Connection failures surface as `GliderError::StoreUnavailable`, store-side
/// failures as `GliderError::ScriptExecution`.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically open a window for `key` or charge the request against the
    /// live one.
    async fn create_window(
        &self,
        key: &VisitorKey,
        window_expiry: Micros,
        now: Micros,
        initial_remaining: u64,
        keyspace: &Keyspace,
    ) -> Result<WindowGrant>;

    /// Atomically charge one visit against a live window.
    async fn record_visit(
        &self,
        key: &VisitorKey,
        at: Micros,
        keyspace: &Keyspace,
    ) -> Result<VisitOutcome>;

    /// Run `ops` as one pipeline. Results come back in submission order and a
    /// failing entry does not abort the others.
    async fn batch_execute(
        &self,
        ops: &[StoreOp],
        keyspace: &Keyspace,
    ) -> Result<Vec<Result<OpOutcome>>>;

    /// Bulk read of window state. Keys without a record are absent from the map.
    async fn read_remaining(
        &self,
        keys: &[VisitorKey],
        keyspace: &Keyspace,
    ) -> Result<HashMap<VisitorKey, RemoteWindow>>;

    /// Drop up to `limit` window records whose expiry is at or before
    /// `before`, returning how many went.
    async fn prune_expired_windows(
        &self,
        keyspace: &Keyspace,
        before: Micros,
        limit: usize,
    ) -> Result<u64>;

    /// Bans whose expiry is at or before `before`.
    async fn list_expired_bans(&self, keyspace: &Keyspace, before: Micros)
        -> Result<Vec<BanEntry>>;

    /// Bans whose expiry is after `after`.
    async fn list_active_bans(&self, keyspace: &Keyspace, after: Micros) -> Result<Vec<BanEntry>>;

    /// Remove bans whose expiry is at or before `before`, returning how many went.
    async fn prune_expired_bans(&self, keyspace: &Keyspace, before: Micros) -> Result<u64>;

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;
}
