//! Per-request admission decisions.
//!
//! The engine answers from its local caches whenever it can and only calls
//! the shared store synchronously when a key has no live local window. Local
//! decrements are queued and flushed in batches, so a local view may lag the
//! store by at most one flush interval.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::cache::LocalCache;
use super::clock::{duration_micros, micros_to_millis, Clock, Micros};
use super::key::VisitorKey;
use super::propagator::BanMessage;
use super::settings::{FailurePolicy, LimiterSettings};
use crate::error::{GliderError, Result};
use crate::store::{BanEntry, Keyspace, OpOutcome, SharedStore, StoreOp, VisitOutcome};

/// Window state held for a visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisitorAttrs {
    /// Requests left in the window
    pub remaining: u64,
    /// Time of the last request charged to the window
    pub last_access: Micros,
    /// End of the window
    pub expiry: Micros,
}

/// Admission verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// The verdict plus the quota metadata returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub verdict: Verdict,
    pub remaining: u64,
    /// When the window or ban ends, in epoch microseconds
    pub reset_at: Micros,
}

impl Admission {
    fn allow(remaining: u64, reset_at: Micros) -> Self {
        Self {
            verdict: Verdict::Allow,
            remaining,
            reset_at,
        }
    }

    fn deny(reset_at: Micros) -> Self {
        Self {
            verdict: Verdict::Deny,
            remaining: 0,
            reset_at,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    /// Reset time in epoch milliseconds.
    pub fn reset_millis(&self) -> u64 {
        micros_to_millis(self.reset_at)
    }
}

/// Outcome of the local, non-suspending part of a decision.
enum LocalDecision {
    Decided(Admission),
    /// Quota ran out locally; the ban must be flushed and announced.
    Exhausted(Admission),
    Miss,
}

struct LocalState {
    visitors: LocalCache<VisitorAttrs>,
    bans: LocalCache<Micros>,
    pending: Vec<StoreOp>,
}

/// The admission engine for one gateway instance.
pub struct AdmissionEngine {
    id: Uuid,
    settings: LimiterSettings,
    keyspace: Keyspace,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    /// Never held across an `.await`.
    state: Mutex<LocalState>,
}

impl std::fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .finish()
    }
}

impl AdmissionEngine {
    pub fn new(
        settings: LimiterSettings,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = settings.local_cache_capacity;
        Self {
            id: Uuid::new_v4(),
            keyspace: settings.keyspace(),
            settings,
            store,
            clock,
            state: Mutex::new(LocalState {
                visitors: LocalCache::new(capacity),
                bans: LocalCache::new(capacity),
                pending: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub(crate) fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn now(&self) -> Micros {
        self.clock.now_micros()
    }

    fn window_micros(&self) -> Micros {
        duration_micros(self.settings.window)
    }

    /// Decide on a request from a textual client address.
    pub async fn admit_address(&self, address: &str) -> Result<Admission> {
        let key = VisitorKey::encode(address)?;
        Ok(self.admit(&key).await)
    }

    /// Decide on one request from `key`.
    pub async fn admit(&self, key: &VisitorKey) -> Admission {
        let now = self.now();

        match self.decide_locally(key, now) {
            LocalDecision::Decided(admission) => admission,
            LocalDecision::Exhausted(admission) => {
                debug!(key = %key, reset_at = admission.reset_at, "Quota exhausted locally");
                if let Err(e) = self.flush().await {
                    warn!(error = %e, "Immediate flush after ban failed");
                }
                self.announce_ban(key, admission.reset_at).await;
                admission
            }
            LocalDecision::Miss => self.open_window(key, now).await,
        }
    }

    fn decide_locally(&self, key: &VisitorKey, now: Micros) -> LocalDecision {
        let mut state = self.state.lock();

        if let Some(ban_expiry) = state.bans.get(key, now) {
            trace!(key = %key, ban_expiry = ban_expiry, "Key is banned");
            return LocalDecision::Decided(Admission::deny(ban_expiry));
        }

        let Some(attrs) = state.visitors.get(key, now) else {
            return LocalDecision::Miss;
        };

        if attrs.remaining == 0 {
            state.bans.set(key.clone(), attrs.expiry, attrs.expiry, now);
            state.visitors.delete(key);
            state.pending.push(StoreOp::Ban {
                key: key.clone(),
                expiry: attrs.expiry,
            });
            return LocalDecision::Exhausted(Admission::deny(attrs.expiry));
        }

        let updated = VisitorAttrs {
            remaining: attrs.remaining - 1,
            last_access: attrs.last_access.max(now),
            expiry: attrs.expiry,
        };
        state
            .visitors
            .set(key.clone(), updated, updated.expiry, now);
        state.pending.push(StoreOp::Visit {
            key: key.clone(),
            at: updated.last_access,
        });

        trace!(key = %key, remaining = updated.remaining, "Admitted from local window");
        LocalDecision::Decided(Admission::allow(updated.remaining, updated.expiry))
    }

    async fn open_window(&self, key: &VisitorKey, now: Micros) -> Admission {
        let quota = self.settings.quota;
        let window_expiry = now.saturating_add(self.window_micros());

        let grant = self
            .store
            .create_window(key, window_expiry, now, quota.saturating_sub(1), &self.keyspace)
            .await;

        match grant {
            Ok(grant) if grant.admitted => {
                let attrs = VisitorAttrs {
                    remaining: grant.remaining.min(quota),
                    last_access: now,
                    expiry: grant.expiry,
                };
                self.state
                    .lock()
                    .visitors
                    .set(key.clone(), attrs, attrs.expiry, now);
                debug!(
                    key = %key,
                    created = grant.created,
                    remaining = attrs.remaining,
                    "Admitted by shared store"
                );
                Admission::allow(attrs.remaining, attrs.expiry)
            }
            Ok(grant) => {
                self.ban_locally(key, grant.expiry, now);
                debug!(key = %key, expiry = grant.expiry, "Denied by shared store");
                self.announce_ban(key, grant.expiry).await;
                Admission::deny(grant.expiry)
            }
            Err(e) if !e.is_store_unavailable() => {
                error!(key = %key, error = %e, "Unexpected error while opening window");
                Admission::deny(window_expiry)
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    policy = ?self.settings.failure_policy,
                    "Shared store unavailable while opening window"
                );
                match self.settings.failure_policy {
                    FailurePolicy::Open => {
                        let attrs = VisitorAttrs {
                            remaining: quota.saturating_sub(1),
                            last_access: now,
                            expiry: window_expiry,
                        };
                        self.state
                            .lock()
                            .visitors
                            .set(key.clone(), attrs, window_expiry, now);
                        Admission::allow(attrs.remaining, window_expiry)
                    }
                    FailurePolicy::Closed => Admission::deny(window_expiry),
                }
            }
        }
    }

    fn ban_locally(&self, key: &VisitorKey, expiry: Micros, now: Micros) {
        let state = self.state.lock();
        state.bans.set(key.clone(), expiry, expiry, now);
        state.visitors.delete(key);
    }

    async fn announce_ban(&self, key: &VisitorKey, expiry: Micros) {
        let message = BanMessage::new(key.clone(), expiry);
        if let Err(e) = self
            .store
            .publish(&self.keyspace.ban_channel(), &message.to_string())
            .await
        {
            warn!(key = %key, error = %e, "Failed to publish ban");
        }
    }

    /// Number of operations waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Drain the pending queue into the shared store.
    ///
    /// Returns how many operations were sent. On failure the drained
    /// operations are dropped; the next refresh reconciles local state.
    pub async fn flush(&self) -> Result<usize> {
        let ops = std::mem::take(&mut self.state.lock().pending);
        if ops.is_empty() {
            return Ok(0);
        }

        let results = match self.store.batch_execute(&ops, &self.keyspace).await {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, dropped = ops.len(), "Flush failed");
                return Err(e);
            }
        };

        let now = self.now();
        let mut bans = Vec::new();
        {
            let state = self.state.lock();
            for (op, result) in ops.iter().zip(results) {
                match result {
                    Ok(OpOutcome::Visit(VisitOutcome::Missing)) => {
                        // The store never saw this window; re-create it on next request
                        state.visitors.delete(op.key());
                    }
                    Ok(OpOutcome::Visit(VisitOutcome::Exhausted { expiry })) => {
                        if state.bans.get(op.key(), now) != Some(expiry) {
                            state.bans.set(op.key().clone(), expiry, expiry, now);
                            state.visitors.delete(op.key());
                            bans.push((op.key().clone(), expiry));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(key = %op.key(), error = %e, "Queued operation failed"),
                }
            }
        }

        for (key, expiry) in &bans {
            self.announce_ban(key, *expiry).await;
        }

        trace!(ops = ops.len(), bans = bans.len(), "Flushed pending operations");
        Ok(ops.len())
    }

    /// Overwrite locally cached windows with the store's view.
    ///
    /// Only entries for which the store holds a live window are touched.
    /// Returns how many entries were updated.
    pub async fn refresh(&self) -> Result<usize> {
        let keys = self.state.lock().visitors.keys(self.now());
        if keys.is_empty() {
            return Ok(0);
        }

        let remote = self.store.read_remaining(&keys, &self.keyspace).await?;

        let now = self.now();
        let quota = self.settings.quota;
        let state = self.state.lock();
        let mut updated = 0;
        for (key, window) in remote {
            if window.expiry <= now {
                continue;
            }
            let Some(local) = state.visitors.get(&key, now) else {
                continue;
            };
            let attrs = VisitorAttrs {
                remaining: window.remaining.min(quota),
                last_access: local.last_access,
                expiry: window.expiry,
            };
            state.visitors.set(key, attrs, attrs.expiry, now);
            updated += 1;
        }

        trace!(keys = keys.len(), updated = updated, "Refreshed local windows");
        Ok(updated)
    }

    /// Apply a ban announced by any instance.
    ///
    /// Returns `false` if the same ban was already held.
    pub fn apply_ban(&self, key: &VisitorKey, expiry: Micros) -> bool {
        let now = self.now();
        let state = self.state.lock();
        if state.bans.get(key, now) == Some(expiry) {
            return false;
        }
        state.bans.set(key.clone(), expiry, expiry, now);
        state.visitors.delete(key);
        true
    }

    /// Apply an unban: drop the ban and, if nothing is cached for the key,
    /// start a full window at `expiry`.
    ///
    /// Fails without touching local state when the window would end past
    /// the representable time range.
    pub fn apply_unban(&self, key: &VisitorKey, expiry: Micros) -> Result<()> {
        let window_end = expiry.checked_add(self.window_micros()).ok_or_else(|| {
            GliderError::MalformedMessage(format!("unban expiry {} out of range", expiry))
        })?;

        let now = self.now();
        let state = self.state.lock();
        state.bans.delete(key);
        if state.visitors.get(key, now).is_none() {
            let attrs = VisitorAttrs {
                remaining: self.settings.quota,
                last_access: expiry,
                expiry: window_end,
            };
            state.visitors.set(key.clone(), attrs, attrs.expiry, now);
        }
        Ok(())
    }

    /// Seed the ban cache with bans recovered from the store.
    pub fn seed_bans(&self, bans: &[BanEntry]) -> usize {
        let now = self.now();
        let state = self.state.lock();
        let seeded = bans
            .iter()
            .filter(|ban| state.bans.set(ban.key.clone(), ban.expiry, ban.expiry, now))
            .count();
        if seeded > 0 {
            info!(seeded = seeded, "Recovered bans from shared store");
        }
        seeded
    }

    /// The locally cached window for `key`, if live.
    pub fn visitor(&self, key: &VisitorKey) -> Option<VisitorAttrs> {
        self.state.lock().visitors.get(key, self.now())
    }

    /// The locally cached ban expiry for `key`, if live.
    pub fn ban_expiry(&self, key: &VisitorKey) -> Option<Micros> {
        self.state.lock().bans.get(key, self.now())
    }
}
