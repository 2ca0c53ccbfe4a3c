//! Warm sandbox pool.
//!
//! The pool is the single owner of slot state. Every transition goes
//! through one of its methods, all of which run under one mutex together
//! with the count bookkeeping, so the allocation worker's view of the Ready
//! count is never stale.
//!
//! The pool never talks to the container runtime. Retiring a slot only
//! marks it Draining; the cleanup worker later claims it with
//! [`take_draining`](SandboxPool::take_draining) and tears the container
//! down.
//!
//! # Example
//!
//! ```ignore
//! let pool = Arc::new(SandboxPool::new(&config));
//!
//! match pool.try_acquire() {
//!     Some(mut lease) => {
//!         // ... exchange frames over lease.stream() ...
//!         pool.release(lease);
//!     }
//!     None => return Err(CoreError::PoolExhausted),
//! }
//! ```

use crate::config::PoolConfig;
use crate::error::CoreError;
use crate::protocol::SandboxStream;
use crate::runtime::ContainerId;
use crate::slot::{SlotId, SlotInfo, SlotState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

// ============================================================================
// Statistics
// ============================================================================

/// Pool statistics for observability.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Slots handed to executions.
    pub acquired: AtomicU64,
    /// `try_acquire` calls that found no Ready slot.
    pub exhausted: AtomicU64,
    /// Sandboxes that reached Ready.
    pub created: AtomicU64,
    /// Warm-ups that failed at any step.
    pub creation_failures: AtomicU64,
    /// Slots returned to Ready after an execution.
    pub released: AtomicU64,
    /// Slots moved to Draining.
    pub retired: AtomicU64,
    /// Containers torn down.
    pub destroyed: AtomicU64,
}

/// Plain copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub acquired: u64,
    pub exhausted: u64,
    pub created: u64,
    pub creation_failures: u64,
    pub released: u64,
    pub retired: u64,
    pub destroyed: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }

    /// Share of acquire attempts that found a Ready slot, as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.acquired.load(Ordering::Relaxed) as f64;
        let misses = self.exhausted.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 {
            0.0
        } else {
            (hits / total) * 100.0
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Number of slots per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub warming: usize,
    pub ready: usize,
    pub allocated: usize,
    pub draining: usize,
    /// Warm-ups in flight that have not been admitted yet.
    pub reserved: usize,
}

impl PoolCounts {
    /// Slots counted against `max_size`.
    pub fn live(&self) -> usize {
        self.warming + self.ready + self.allocated + self.reserved
    }
}

// ============================================================================
// Slot table
// ============================================================================

struct SlotEntry {
    container_id: ContainerId,
    state: SlotState,
    /// Held by the pool while Warming/Ready, by the lease while Allocated.
    stream: Option<SandboxStream>,
    created_at: DateTime<Utc>,
    state_since: Instant,
    last_activity: Instant,
}

impl SlotEntry {
    fn transition(&mut self, slot: SlotId, next: SlotState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::trace!(slot = %slot, from = %self.state, to = %next, "Rejected slot transition");
            return false;
        }
        tracing::trace!(slot = %slot, from = %self.state, to = %next, "Slot transition");
        let now = Instant::now();
        self.state = next;
        self.state_since = now;
        self.last_activity = now;
        true
    }
}

#[derive(Default)]
struct PoolInner {
    slots: BTreeMap<SlotId, SlotEntry>,
    next_id: u64,
    reserved: usize,
    closed: bool,
}

impl PoolInner {
    fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts {
            reserved: self.reserved,
            ..Default::default()
        };
        for entry in self.slots.values() {
            match entry.state {
                SlotState::Warming => counts.warming += 1,
                SlotState::Ready => counts.ready += 1,
                SlotState::Allocated => counts.allocated += 1,
                SlotState::Draining => counts.draining += 1,
            }
        }
        counts
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Concurrency-safe registry of sandbox slots.
pub struct SandboxPool {
    inner: Mutex<PoolInner>,
    max_size: usize,
    target_ready: usize,
    /// Wakes the allocation worker.
    deficit: Notify,
    /// Wakes the cleanup worker.
    draining: Notify,
    stats: PoolStats,
}

impl SandboxPool {
    /// Create an empty pool sized by `config`.
    pub fn new(config: &PoolConfig) -> Self {
        tracing::info!(
            target_ready = config.target_ready,
            max_size = config.max_size,
            "Creating sandbox pool"
        );
        Self {
            inner: Mutex::new(PoolInner::default()),
            max_size: config.max_size,
            target_ready: config.target_ready,
            deficit: Notify::new(),
            draining: Notify::new(),
            stats: PoolStats::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // No method panics while holding the lock, so the table is
        // consistent even if a poisoned guard is observed.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve capacity for one new sandbox.
    ///
    /// Returns `None` when the pool is at `max_size`, when Ready plus
    /// in-flight warm-ups already meet the watermark, or after
    /// [`close`](Self::close). Dropping the reservation unused gives the
    /// capacity back.
    pub fn reserve(self: &Arc<Self>) -> Option<Reservation> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        let counts = inner.counts();
        if counts.live() >= self.max_size {
            return None;
        }
        if counts.ready + counts.warming + counts.reserved >= self.target_ready {
            return None;
        }
        inner.reserved += 1;
        Some(Reservation {
            pool: Arc::clone(self),
            consumed: false,
        })
    }

    /// Number of reservations [`reserve`](Self::reserve) would grant right now.
    pub fn deficit(&self) -> usize {
        let inner = self.lock();
        if inner.closed {
            return 0;
        }
        let counts = inner.counts();
        let below_watermark = self
            .target_ready
            .saturating_sub(counts.ready + counts.warming + counts.reserved);
        below_watermark.min(self.max_size.saturating_sub(counts.live()))
    }

    /// Move a Warming slot to Ready with its attached stream.
    ///
    /// Returns `false` (and drops the stream) if the slot was retired while
    /// it was warming.
    pub fn promote(&self, slot: SlotId, stream: SandboxStream) -> bool {
        let mut inner = self.lock();
        match inner.slots.get_mut(&slot) {
            Some(entry) if entry.state == SlotState::Warming => {
                entry.transition(slot, SlotState::Ready);
                entry.stream = Some(stream);
                PoolStats::bump(&self.stats.created);
                tracing::debug!(slot = %slot, container_id = %entry.container_id, "Slot ready");
                true
            }
            _ => {
                tracing::debug!(slot = %slot, "Slot retired during warm-up, dropping stream");
                false
            }
        }
    }

    /// Claim the oldest Ready slot without waiting.
    ///
    /// Returns `None` immediately if no slot is Ready; callers should treat
    /// that as backpressure.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Lease> {
        let lease = {
            let mut inner = self.lock();
            let found = inner
                .slots
                .iter_mut()
                .find(|(_, entry)| entry.state == SlotState::Ready && entry.stream.is_some());
            match found {
                Some((&slot, entry)) => {
                    entry.transition(slot, SlotState::Allocated);
                    entry.stream.take().map(|stream| Lease {
                        guard: LeaseGuard {
                            pool: Arc::clone(self),
                            slot,
                            armed: true,
                        },
                        container_id: entry.container_id.clone(),
                        stream,
                    })
                }
                None => None,
            }
        };

        match &lease {
            Some(lease) => {
                PoolStats::bump(&self.stats.acquired);
                tracing::debug!(slot = %lease.slot(), "Acquired slot");
                self.deficit.notify_one();
            }
            None => {
                PoolStats::bump(&self.stats.exhausted);
                tracing::debug!("No ready slot available");
            }
        }
        lease
    }

    /// Return an Allocated slot to Ready.
    ///
    /// A no-op if the slot was retired in the meantime: the stream is
    /// dropped and `false` returned.
    pub fn release(&self, lease: Lease) -> bool {
        let Lease {
            mut guard, stream, ..
        } = lease;
        guard.armed = false;
        let slot = guard.slot;

        let mut inner = self.lock();
        match inner.slots.get_mut(&slot) {
            Some(entry) if entry.state == SlotState::Allocated => {
                entry.transition(slot, SlotState::Ready);
                entry.stream = Some(stream);
                PoolStats::bump(&self.stats.released);
                tracing::debug!(slot = %slot, "Released slot");
                true
            }
            _ => {
                tracing::debug!(slot = %slot, "Release ignored, slot already retired");
                false
            }
        }
    }

    /// Move a slot to Draining.
    ///
    /// Idempotent. Returns `true` only for the call that performed the
    /// transition.
    pub fn retire(&self, slot: SlotId) -> bool {
        let retired = {
            let mut inner = self.lock();
            match inner.slots.get_mut(&slot) {
                Some(entry) => {
                    let retired = entry.transition(slot, SlotState::Draining);
                    if retired {
                        entry.stream = None;
                    }
                    retired
                }
                None => false,
            }
        };

        if retired {
            PoolStats::bump(&self.stats.retired);
            tracing::debug!(slot = %slot, "Retired slot");
            self.draining.notify_one();
            self.deficit.notify_one();
        }
        retired
    }

    /// Retire the slot behind `lease` and drop its stream.
    pub fn retire_lease(&self, lease: Lease) -> bool {
        let Lease { mut guard, .. } = lease;
        guard.armed = false;
        self.retire(guard.slot)
    }

    /// Record activity on a slot.
    pub fn touch(&self, slot: SlotId) {
        if let Some(entry) = self.lock().slots.get_mut(&slot) {
            entry.last_activity = Instant::now();
        }
    }

    /// Current state of a slot, `None` once it has been torn down.
    pub fn state(&self, slot: SlotId) -> Option<SlotState> {
        self.lock().slots.get(&slot).map(|entry| entry.state)
    }

    /// Warming or Allocated slots that overstayed `max_age` in their
    /// current state or have been idle longer than `liveness`.
    pub fn expired(&self, now: Instant, max_age: Duration, liveness: Duration) -> Vec<SlotId> {
        self.lock()
            .slots
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.state, SlotState::Warming | SlotState::Allocated)
                    && (now.saturating_duration_since(entry.state_since) > max_age
                        || now.saturating_duration_since(entry.last_activity) > liveness)
            })
            .map(|(slot, _)| *slot)
            .collect()
    }

    /// Ready slots with their containers, for liveness probing.
    pub fn ready_containers(&self) -> Vec<(SlotId, ContainerId)> {
        self.lock()
            .slots
            .iter()
            .filter(|(_, entry)| entry.state == SlotState::Ready)
            .map(|(slot, entry)| (*slot, entry.container_id.clone()))
            .collect()
    }

    /// Remove every Draining slot from the table and hand its container to
    /// the caller for teardown.
    ///
    /// Each slot is returned to exactly one caller.
    pub fn take_draining(&self) -> Vec<(SlotId, ContainerId)> {
        let mut inner = self.lock();
        let drained: Vec<SlotId> = inner
            .slots
            .iter()
            .filter(|(_, entry)| entry.state == SlotState::Draining)
            .map(|(slot, _)| *slot)
            .collect();
        drained
            .into_iter()
            .filter_map(|slot| {
                inner
                    .slots
                    .remove(&slot)
                    .map(|entry| (slot, entry.container_id))
            })
            .collect()
    }

    /// Stop accepting new slots and retire every live one.
    ///
    /// Returns the number of slots retired.
    pub fn close(&self) -> usize {
        let live: Vec<SlotId> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner
                .slots
                .iter()
                .filter(|(_, entry)| entry.state.is_live())
                .map(|(slot, _)| *slot)
                .collect()
        };
        live.into_iter().filter(|slot| self.retire(*slot)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn counts(&self) -> PoolCounts {
        self.lock().counts()
    }

    /// Snapshot of every slot in the table.
    pub fn snapshot(&self) -> Vec<SlotInfo> {
        self.lock()
            .slots
            .iter()
            .map(|(slot, entry)| SlotInfo {
                id: *slot,
                container_id: entry.container_id.to_string(),
                state: entry.state,
                created_at: entry.created_at,
            })
            .collect()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn target_ready(&self) -> usize {
        self.target_ready
    }

    /// Resolves when a slot was acquired or retired since the last wait.
    pub async fn deficit_notified(&self) {
        self.deficit.notified().await
    }

    /// Resolves when a slot was retired since the last wait.
    pub async fn draining_notified(&self) {
        self.draining.notified().await
    }

    pub(crate) fn record_creation_failure(&self) {
        PoolStats::bump(&self.stats.creation_failures);
    }

    pub(crate) fn record_destroyed(&self) {
        PoolStats::bump(&self.stats.destroyed);
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// Capacity held for one sandbox that is being created.
///
/// Consumed by [`admit`](Reservation::admit); dropping it unused gives the
/// capacity back to the pool.
pub struct Reservation {
    pool: Arc<SandboxPool>,
    consumed: bool,
}

impl Reservation {
    /// Insert a freshly created container as a Warming slot.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PoolClosed`] if the pool was closed while the
    /// container was being created. The caller still owns the container.
    pub fn admit(mut self, container_id: ContainerId) -> Result<SlotId, CoreError> {
        self.consumed = true;
        let mut inner = self.pool.lock();
        inner.reserved = inner.reserved.saturating_sub(1);
        if inner.closed {
            return Err(CoreError::PoolClosed);
        }

        inner.next_id += 1;
        let slot = SlotId::from_raw(inner.next_id);
        let now = Instant::now();
        tracing::debug!(slot = %slot, container_id = %container_id, "Admitted warming slot");
        inner.slots.insert(
            slot,
            SlotEntry {
                container_id,
                state: SlotState::Warming,
                stream: None,
                created_at: Utc::now(),
                state_since: now,
                last_activity: now,
            },
        );
        Ok(slot)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.consumed {
            let mut inner = self.pool.lock();
            inner.reserved = inner.reserved.saturating_sub(1);
        }
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Exclusive handle on an Allocated slot.
///
/// Hand it back with [`SandboxPool::release`] or
/// [`SandboxPool::retire_lease`]. A lease dropped any other way (for
/// example a cancelled request) retires its slot.
pub struct Lease {
    guard: LeaseGuard,
    container_id: ContainerId,
    stream: SandboxStream,
}

impl Lease {
    pub fn slot(&self) -> SlotId {
        self.guard.slot
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn stream(&mut self) -> &mut SandboxStream {
        &mut self.stream
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("slot", &self.guard.slot)
            .field("container_id", &self.container_id)
            .finish()
    }
}

struct LeaseGuard {
    pool: Arc<SandboxPool>,
    slot: SlotId,
    armed: bool,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.armed && self.pool.retire(self.slot) {
            tracing::warn!(slot = %self.slot, "Lease dropped without disposition, slot retired");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::detached_stream;
    use std::collections::HashSet;

    fn pool(target_ready: usize, max_size: usize) -> Arc<SandboxPool> {
        let config = PoolConfig {
            target_ready,
            max_size,
            ..Default::default()
        };
        Arc::new(SandboxPool::new(&config))
    }

    fn add_ready(pool: &Arc<SandboxPool>, name: &str) -> SlotId {
        let reservation = pool.reserve().expect("capacity");
        let slot = reservation.admit(ContainerId::new(name)).unwrap();
        assert!(pool.promote(slot, detached_stream()));
        slot
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();
        assert_eq!(stats.snapshot().acquired, 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_pool_stats_hit_rate() {
        let stats = PoolStats::default();
        stats.acquired.store(3, Ordering::Relaxed);
        stats.exhausted.store(1, Ordering::Relaxed);
        assert!((stats.hit_rate() - 75.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_try_acquire_empty_returns_none() {
        let pool = pool(2, 2);
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.stats().snapshot().exhausted, 1);
    }

    #[tokio::test]
    async fn test_warming_slot_is_not_acquirable() {
        let pool = pool(1, 1);
        let slot = pool
            .reserve()
            .unwrap()
            .admit(ContainerId::new("c1"))
            .unwrap();
        assert_eq!(pool.state(slot), Some(SlotState::Warming));
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_reserve_respects_watermark_and_max() {
        let pool = pool(2, 3);
        let first = pool.reserve().expect("first");
        let second = pool.reserve().expect("second");
        assert!(pool.reserve().is_none(), "watermark reached by reservations");
        assert_eq!(pool.counts().reserved, 2);

        drop(first);
        assert_eq!(pool.counts().reserved, 1);
        let slot = second.admit(ContainerId::new("c1")).unwrap();
        pool.promote(slot, detached_stream());

        // One Ready + one allocated would still leave room for another warm-up.
        let lease = pool.try_acquire().unwrap();
        assert!(pool.reserve().is_some());
        pool.release(lease);
    }

    #[tokio::test]
    async fn test_deficit_tracks_reserve() {
        let pool = pool(2, 3);
        assert_eq!(pool.deficit(), 2);
        let _reservation = pool.reserve().unwrap();
        assert_eq!(pool.deficit(), 1);
        add_ready(&pool, "c1");
        assert_eq!(pool.deficit(), 0);

        pool.close();
        assert_eq!(pool.deficit(), 0);
    }

    #[tokio::test]
    async fn test_retire_from_each_live_state() {
        let pool = pool(2, 3);
        let warming = pool
            .reserve()
            .unwrap()
            .admit(ContainerId::new("warming"))
            .unwrap();
        add_ready(&pool, "a");
        add_ready(&pool, "b");
        let lease = pool.try_acquire().unwrap();
        let allocated = lease.slot();
        let ready = pool
            .snapshot()
            .into_iter()
            .find(|info| info.state == SlotState::Ready)
            .unwrap()
            .id;

        for slot in [warming, ready, allocated] {
            assert!(pool.retire(slot));
            assert_eq!(pool.state(slot), Some(SlotState::Draining));
        }
        assert_eq!(pool.counts().draining, 3);
        assert!(!pool.retire_lease(lease));
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = pool(1, 1);
        let slot = add_ready(&pool, "c1");

        let lease = pool.try_acquire().expect("ready slot");
        assert_eq!(lease.slot(), slot);
        assert_eq!(lease.container_id().as_str(), "c1");
        assert_eq!(pool.state(slot), Some(SlotState::Allocated));
        assert!(pool.try_acquire().is_none());

        assert!(pool.release(lease));
        assert_eq!(pool.state(slot), Some(SlotState::Ready));
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_retire_is_idempotent_and_wins_over_release() {
        let pool = pool(1, 1);
        let slot = add_ready(&pool, "c1");
        let lease = pool.try_acquire().unwrap();

        assert!(pool.retire(slot));
        let after_first = pool.counts();
        assert!(!pool.retire(slot));
        assert!(!pool.release(lease));

        assert_eq!(pool.counts(), after_first);
        assert_eq!(pool.state(slot), Some(SlotState::Draining));
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_dropped_lease_retires_slot() {
        let pool = pool(1, 1);
        let slot = add_ready(&pool, "c1");
        drop(pool.try_acquire().unwrap());
        assert_eq!(pool.state(slot), Some(SlotState::Draining));
    }

    #[tokio::test]
    async fn test_promote_after_retire_is_rejected() {
        let pool = pool(1, 1);
        let slot = pool
            .reserve()
            .unwrap()
            .admit(ContainerId::new("c1"))
            .unwrap();
        assert!(pool.retire(slot));
        assert!(!pool.promote(slot, detached_stream()));
        assert_eq!(pool.state(slot), Some(SlotState::Draining));
    }

    #[tokio::test]
    async fn test_take_draining_hands_out_once() {
        let pool = pool(2, 2);
        let a = add_ready(&pool, "a");
        let _b = add_ready(&pool, "b");
        pool.retire(a);

        let drained = pool.take_draining();
        assert_eq!(drained, vec![(a, ContainerId::new("a"))]);
        assert!(pool.take_draining().is_empty());
        assert_eq!(pool.state(a), None);
        assert!(!pool.retire(a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_checks_age_and_activity() {
        let pool = pool(2, 2);
        let busy = add_ready(&pool, "busy");
        let idle = add_ready(&pool, "idle");
        let lease_busy = pool.try_acquire().unwrap();
        let lease_idle = pool.try_acquire().unwrap();
        assert_eq!(lease_busy.slot(), busy);
        assert_eq!(lease_idle.slot(), idle);

        tokio::time::advance(Duration::from_secs(4)).await;
        pool.touch(busy);
        tokio::time::advance(Duration::from_secs(2)).await;

        let now = Instant::now();
        let expired = pool.expired(now, Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(expired, vec![idle]);

        let expired = pool.expired(now, Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(expired, vec![busy, idle]);
    }

    #[tokio::test]
    async fn test_close_retires_everything_and_rejects_admits() {
        let pool = pool(2, 2);
        add_ready(&pool, "a");
        let pending = pool.reserve().unwrap();

        assert_eq!(pool.close(), 1);
        assert!(pool.is_closed());
        assert!(pool.reserve().is_none());
        assert!(matches!(
            pending.admit(ContainerId::new("late")),
            Err(CoreError::PoolClosed)
        ));
        assert_eq!(pool.counts().live(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_never_shares_a_slot() {
        let pool = pool(8, 8);
        for i in 0..8 {
            add_ready(&pool, &format!("c{i}"));
        }

        let mut handles = Vec::new();
        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.try_acquire().map(|lease| {
                    let slot = lease.slot();
                    // Keep the lease alive until every task has tried.
                    (slot, lease)
                })
            }));
        }

        let mut leases = Vec::new();
        for handle in handles {
            if let Some(pair) = handle.await.unwrap() {
                leases.push(pair);
            }
        }

        let unique: HashSet<SlotId> = leases.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(leases.len(), 8);
        assert_eq!(unique.len(), 8);
        assert_eq!(pool.stats().snapshot().exhausted, 24);
    }
}
