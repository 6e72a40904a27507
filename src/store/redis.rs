//! Redis-backed shared store.
//!
//! Window creation and visits run as Lua scripts so that two instances can
//! never both believe they opened the same window. Plain commands are only
//! used for reads, the ban sorted set and pub/sub.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::{Client, Pipeline, Script, Value};
use tracing::{debug, info, warn};

use super::{
    BanEntry, Keyspace, MessageStream, OpOutcome, RemoteWindow, SharedStore, StoreOp,
    VisitOutcome, WindowGrant,
};
use crate::error::{GliderError, Result};
use crate::ratelimit::{Micros, VisitorKey};

const CREATE_KEY_LUA: &str = include_str!("../../scripts/create_key.lua");
const VISIT_KEY_LUA: &str = include_str!("../../scripts/visit_key.lua");
const PRUNE_WINDOWS_LUA: &str = include_str!("../../scripts/prune_windows.lua");

/// A `SharedStore` talking to a Redis server.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    create_key: Script,
    visit_key: Script,
    prune_windows: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| GliderError::Config(format!("invalid redis url {}: {}", url, e)))?;
        let mut conn = client.get_connection_manager().await?;

        let visit_key = Script::new(VISIT_KEY_LUA);
        let sha: String = visit_key.prepare_invoke().load_async(&mut conn).await?;
        debug!(sha = %sha, "Loaded visitKey script");

        info!(url = %url, "Connected to shared store");

        Ok(Self {
            client,
            conn,
            create_key: Script::new(CREATE_KEY_LUA),
            visit_key,
            prune_windows: Script::new(PRUNE_WINDOWS_LUA),
        })
    }

    /// Build the pipeline for a batch.
    ///
    /// Visits go out as `EVALSHA`. When the batch holds any, it starts with a
    /// `SCRIPT LOAD` so a server that lost its script cache still knows the
    /// hash; that reply is not part of the batch results.
    fn batch_pipeline(&self, ops: &[StoreOp], keyspace: &Keyspace) -> (Pipeline, usize) {
        let mut pipe = redis::pipe();
        let mut offset = 0;
        if ops.iter().any(|op| matches!(op, StoreOp::Visit { .. })) {
            pipe.cmd("SCRIPT").arg("LOAD").arg(VISIT_KEY_LUA);
            offset = 1;
        }
        for op in ops {
            self.queue_op(&mut pipe, op, keyspace);
        }
        (pipe, offset)
    }

    /// Append one operation to a pipeline.
    fn queue_op(&self, pipe: &mut Pipeline, op: &StoreOp, keyspace: &Keyspace) {
        match op {
            StoreOp::Visit { key, at } => {
                pipe.cmd("EVALSHA")
                    .arg(self.visit_key.get_hash())
                    .arg(3)
                    .arg(keyspace.remaining_hash())
                    .arg(keyspace.expiry_hash())
                    .arg(keyspace.ban_set())
                    .arg(key.as_str())
                    .arg(*at);
            }
            StoreOp::Ban { key, expiry } => {
                pipe.cmd("ZADD")
                    .arg(keyspace.ban_set())
                    .arg(*expiry)
                    .arg(key.as_str());
            }
        }
    }

    fn parse_op(op: &StoreOp, value: &Value) -> Result<OpOutcome> {
        if let Value::ServerError(err) = value {
            return Err(redis::RedisError::from(err.clone()).into());
        }
        match op {
            StoreOp::Visit { .. } => {
                let reply: Vec<i64> = redis::from_redis_value(value)?;
                parse_visit(&reply).map(OpOutcome::Visit)
            }
            StoreOp::Ban { .. } => {
                let _: i64 = redis::from_redis_value(value)?;
                Ok(OpOutcome::Banned)
            }
        }
    }

    async fn query_bans(&self, key: &str, min: String, max: String) -> Result<Vec<BanEntry>> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .into_iter()
            .map(|(member, score)| BanEntry {
                key: VisitorKey::from_encoded(member),
                expiry: score.max(0.0) as Micros,
            })
            .collect())
    }
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

/// Pair each operation with its pipeline reply.
fn batch_results(ops: &[StoreOp], values: &[Value]) -> Result<Vec<Result<OpOutcome>>> {
    if values.len() != ops.len() {
        return Err(GliderError::ScriptExecution(format!(
            "pipeline returned {} replies for {} operations",
            values.len(),
            ops.len()
        )));
    }
    Ok(ops
        .iter()
        .zip(values)
        .map(|(op, value)| RedisStore::parse_op(op, value))
        .collect())
}

fn parse_grant(reply: &[i64]) -> Result<WindowGrant> {
    match reply {
        [created, admitted, remaining, expiry] => Ok(WindowGrant {
            created: *created == 1,
            admitted: *admitted == 1,
            remaining: to_u64(*remaining),
            expiry: to_u64(*expiry),
        }),
        other => Err(GliderError::ScriptExecution(format!(
            "createKey returned {} fields, expected 4",
            other.len()
        ))),
    }
}

fn parse_visit(reply: &[i64]) -> Result<VisitOutcome> {
    match reply {
        [1, remaining, _] => Ok(VisitOutcome::Counted {
            remaining: to_u64(*remaining),
        }),
        [0, _, expiry] => Ok(VisitOutcome::Exhausted {
            expiry: to_u64(*expiry),
        }),
        [-1, _, _] => Ok(VisitOutcome::Missing),
        other => Err(GliderError::ScriptExecution(format!(
            "unexpected visitKey reply {:?}",
            other
        ))),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn create_window(
        &self,
        key: &VisitorKey,
        window_expiry: Micros,
        now: Micros,
        initial_remaining: u64,
        keyspace: &Keyspace,
    ) -> Result<WindowGrant> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .create_key
            .key(keyspace.remaining_hash())
            .key(keyspace.expiry_hash())
            .key(keyspace.ban_set())
            .key(keyspace.window_index())
            .arg(key.as_str())
            .arg(window_expiry)
            .arg(now)
            .arg(initial_remaining)
            .invoke_async(&mut conn)
            .await?;
        parse_grant(&reply)
    }

    async fn record_visit(
        &self,
        key: &VisitorKey,
        at: Micros,
        keyspace: &Keyspace,
    ) -> Result<VisitOutcome> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .visit_key
            .key(keyspace.remaining_hash())
            .key(keyspace.expiry_hash())
            .key(keyspace.ban_set())
            .arg(key.as_str())
            .arg(at)
            .invoke_async(&mut conn)
            .await?;
        parse_visit(&reply)
    }

    async fn batch_execute(
        &self,
        ops: &[StoreOp],
        keyspace: &Keyspace,
    ) -> Result<Vec<Result<OpOutcome>>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let (pipe, offset) = self.batch_pipeline(ops, keyspace);
        let mut conn = self.conn.clone();
        // Raw replies keep per-entry server errors instead of failing the
        // whole batch after the other entries already ran.
        let values = conn.req_packed_commands(&pipe, offset, ops.len()).await?;
        batch_results(ops, &values)
    }

    async fn read_remaining(
        &self,
        keys: &[VisitorKey],
        keyspace: &Keyspace,
    ) -> Result<HashMap<VisitorKey, RemoteWindow>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let fields: Vec<&str> = keys.iter().map(VisitorKey::as_str).collect();
        let mut conn = self.conn.clone();
        let (remaining, expiries): (Vec<Option<i64>>, Vec<Option<i64>>) = redis::pipe()
            .cmd("HMGET")
            .arg(keyspace.remaining_hash())
            .arg(&fields)
            .cmd("HMGET")
            .arg(keyspace.expiry_hash())
            .arg(&fields)
            .query_async(&mut conn)
            .await?;

        Ok(keys
            .iter()
            .zip(remaining.into_iter().zip(expiries))
            .filter_map(|(key, pair)| match pair {
                (Some(remaining), Some(expiry)) => Some((
                    key.clone(),
                    RemoteWindow {
                        remaining: to_u64(remaining),
                        expiry: to_u64(expiry),
                    },
                )),
                _ => None,
            })
            .collect())
    }

    async fn prune_expired_windows(
        &self,
        keyspace: &Keyspace,
        before: Micros,
        limit: usize,
    ) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .prune_windows
            .key(keyspace.remaining_hash())
            .key(keyspace.expiry_hash())
            .key(keyspace.window_index())
            .arg(before)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn list_expired_bans(
        &self,
        keyspace: &Keyspace,
        before: Micros,
    ) -> Result<Vec<BanEntry>> {
        self.query_bans(&keyspace.ban_set(), "-inf".into(), before.to_string())
            .await
    }

    async fn list_active_bans(&self, keyspace: &Keyspace, after: Micros) -> Result<Vec<BanEntry>> {
        self.query_bans(&keyspace.ban_set(), format!("({}", after), "+inf".into())
            .await
    }

    async fn prune_expired_bans(&self, keyspace: &Keyspace, before: Micros) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(keyspace.ban_set())
            .arg("-inf")
            .arg(before)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        debug!(channel = %channel, receivers = receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel.as_str()).await?;
        }
        info!(channels = ?channels, "Subscribed to shared store channels");

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let channel = msg.get_channel_name().to_string();
            let message = match msg.get_payload::<String>() {
                Ok(payload) => Some((channel, payload)),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Dropping non-text pub/sub payload");
                    None
                }
            };
            futures::future::ready(message)
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
