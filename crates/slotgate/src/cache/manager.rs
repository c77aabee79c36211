//! Couples the workflow slot supplier with the workflow cache.
//!
//! Every outstanding workflow permit holds one unit of cache room, taken before
//! the inner supplier is asked and returned after it is told about the release.
//! With a bound of N, at most N workflow permits exist at once.
//!
//! Room alone is not enough when the policy is unbounded or refuses below its
//! bound, so a reservation also claims a place in the cache: the policy must
//! accept one more run on top of the claims already granted, or there must be
//! more Idle entries than outstanding claims. A claim lasts until its permit is
//! marked used or released. Until a claim is possible the reservation waits
//! without asking the inner supplier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use lru::LruCache;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use super::{
    CacheEntryState, CachedWorkflowEntry, EvictedWorkflow, EvictionReason, WorkflowCachePolicy,
    WorkflowSlotsInfo,
};
use crate::kind::{RunId, SlotKind, WorkflowSlotKind};
use crate::permit::{PermitId, SlotSupplierPermit};
use crate::supplier::{ReservationError, SlotReleaseReason, SlotReservationContext, SlotSupplier};

struct EntryData {
    state: CacheEntryState,
    last_touched: Instant,
    /// Evict once the in-flight task completes.
    pending_eviction: Option<String>,
}

/// Why an admission could not proceed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stall {
    RunActive,
    NothingEvictable,
}

/// State shared with outstanding leases.
struct CacheShared {
    policy: Arc<dyn WorkflowCachePolicy>,
    max_cached: Option<usize>,
    entries: Mutex<LruCache<RunId, EntryData>>,
    num_cached: AtomicUsize,
    used: DashSet<PermitId>,
    buffered: AtomicUsize,
    /// Permits granted but not yet marked used or released.
    claims: AtomicUsize,
    /// The policy asked for a bound of 0; admit a single run instead.
    clamped: bool,
    changed: Notify,
}

impl CacheShared {
    fn lock(&self) -> MutexGuard<'_, LruCache<RunId, EntryData>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slots_info(&self) -> WorkflowSlotsInfo {
        WorkflowSlotsInfo {
            used_slots: self.used.len(),
            num_cached_workflows: self.num_cached.load(Ordering::Acquire),
            max_cache_size: self.max_cached,
        }
    }

    fn allows_additional(&self, slots: &WorkflowSlotsInfo) -> bool {
        if self.clamped {
            slots.num_cached_workflows < 1
        } else {
            self.policy.can_allow_additional_workflow(slots)
        }
    }

    /// Claim a place in the cache for one more permit, if there is one.
    fn try_claim(&self) -> bool {
        let entries = self.lock();
        let claims = self.claims.load(Ordering::Acquire);
        let idle = entries
            .iter()
            .filter(|(_, e)| e.state == CacheEntryState::Idle)
            .count();
        let mut slots = self.slots_info();
        slots.num_cached_workflows += claims;
        if idle > claims || self.allows_additional(&slots) {
            self.claims.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    fn drop_claim(&self) {
        self.claims.fetch_sub(1, Ordering::AcqRel);
        self.changed.notify_waiters();
    }

    fn remove(
        &self,
        entries: &mut LruCache<RunId, EntryData>,
        run_id: &RunId,
        reason: EvictionReason,
    ) -> Option<EvictedWorkflow> {
        entries.pop(run_id)?;
        self.num_cached.fetch_sub(1, Ordering::AcqRel);
        let evicted = EvictedWorkflow {
            run_id: run_id.clone(),
            reason,
        };
        tracing::debug!(run_id = %evicted.run_id, reason = %evicted.reason, "Workflow evicted");
        self.policy.evicted_workflow(&evicted);
        Some(evicted)
    }

    fn insert_active(&self, entries: &mut LruCache<RunId, EntryData>, run_id: RunId) {
        entries.put(
            run_id,
            EntryData {
                state: CacheEntryState::Active,
                last_touched: Instant::now(),
                pending_eviction: None,
            },
        );
        self.num_cached.fetch_add(1, Ordering::AcqRel);
    }

    fn try_admit(&self, run_id: &RunId) -> Result<Option<EvictedWorkflow>, Stall> {
        let mut entries = self.lock();

        if let Some(entry) = entries.get_mut(run_id) {
            return match entry.state {
                CacheEntryState::Idle => {
                    entry.state = CacheEntryState::Active;
                    entry.last_touched = Instant::now();
                    Ok(None)
                }
                CacheEntryState::Active => Err(Stall::RunActive),
            };
        }

        if self.allows_additional(&self.slots_info()) {
            self.insert_active(&mut entries, run_id.clone());
            return Ok(None);
        }

        let evictable: Vec<CachedWorkflowEntry> = entries
            .iter()
            .rev()
            .filter(|(_, e)| e.state == CacheEntryState::Idle)
            .map(|(id, e)| CachedWorkflowEntry {
                run_id: id.clone(),
                state: e.state,
                last_touched: e.last_touched,
            })
            .collect();
        let Some(lru) = evictable.first() else {
            return Err(Stall::NothingEvictable);
        };

        let victim = match self.policy.eviction_hint(&evictable) {
            Some(hint) if evictable.iter().any(|e| e.run_id == hint) => hint,
            Some(hint) => {
                tracing::debug!(hint = %hint, fallback = %lru.run_id, "Eviction hint is not evictable, using LRU");
                lru.run_id.clone()
            }
            None => lru.run_id.clone(),
        };

        let evicted = self.remove(&mut entries, &victim, EvictionReason::CacheFull);
        self.insert_active(&mut entries, run_id.clone());
        Ok(evicted)
    }

    fn complete(&self, run_id: &RunId) -> Option<EvictedWorkflow> {
        let evicted = {
            let mut entries = self.lock();
            let pending = match entries.get_mut(run_id) {
                Some(entry) => {
                    let pending = entry.pending_eviction.take();
                    if pending.is_none() {
                        entry.state = CacheEntryState::Idle;
                        entry.last_touched = Instant::now();
                    }
                    pending
                }
                None => {
                    tracing::warn!(run_id = %run_id, "Completed lease for a workflow no longer cached");
                    None
                }
            };
            pending.and_then(|reason| {
                self.remove(&mut entries, run_id, EvictionReason::Requested(reason))
            })
        };
        self.changed.notify_waiters();
        evicted
    }
}

/// Counts a task as buffered for as long as it lives.
struct BufferedGuard<'a>(&'a AtomicUsize);

impl<'a> BufferedGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for BufferedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Gives a claim back unless its reservation produced a permit.
struct ClaimGuard<'a> {
    shared: &'a CacheShared,
    armed: bool,
}

impl ClaimGuard<'_> {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.drop_claim();
        }
    }
}

/// A run's claim on its Active cache entry.
///
/// On drop: the entry goes back to Idle (or is evicted if that was requested).
pub struct CacheLease {
    run_id: RunId,
    shared: Arc<CacheShared>,
    completed: bool,
}

impl CacheLease {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Return the entry to Idle. Reports the eviction if one was pending.
    pub fn complete(mut self) -> Option<EvictedWorkflow> {
        self.completed = true;
        self.shared.complete(&self.run_id)
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        if !self.completed {
            self.shared.complete(&self.run_id);
        }
    }
}

impl std::fmt::Debug for CacheLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLease")
            .field("run_id", &self.run_id)
            .field("completed", &self.completed)
            .finish()
    }
}

#[derive(Debug)]
pub struct CacheAdmission {
    pub lease: CacheLease,
    /// Entry removed to make room for this run.
    pub evicted: Option<EvictedWorkflow>,
}

pub struct WorkflowCacheManager {
    inner: Arc<dyn SlotSupplier<SlotKind = WorkflowSlotKind>>,
    room: Option<Arc<Semaphore>>,
    rooms: DashMap<PermitId, OwnedSemaphorePermit>,
    /// Permits still holding a claim.
    claimed: DashSet<PermitId>,
    shared: Arc<CacheShared>,
}

impl WorkflowCacheManager {
    pub fn new(
        inner: Arc<dyn SlotSupplier<SlotKind = WorkflowSlotKind>>,
        policy: Arc<dyn WorkflowCachePolicy>,
    ) -> Self {
        let clamped = policy.max_cached_workflows() == Some(0);
        let max_cached = if clamped {
            tracing::warn!("Workflow cache bound of 0 would admit nothing, using 1");
            Some(1)
        } else {
            policy.max_cached_workflows()
        };
        Self {
            inner,
            room: max_cached.map(|max| Arc::new(Semaphore::new(max))),
            rooms: DashMap::new(),
            claimed: DashSet::new(),
            shared: Arc::new(CacheShared {
                policy,
                max_cached,
                // Unbounded: evictions go through the policy, never through `put`.
                entries: Mutex::new(LruCache::unbounded()),
                num_cached: AtomicUsize::new(0),
                used: DashSet::new(),
                buffered: AtomicUsize::new(0),
                claims: AtomicUsize::new(0),
                clamped,
                changed: Notify::new(),
            }),
        }
    }

    pub fn max_cached(&self) -> Option<usize> {
        self.shared.max_cached
    }

    /// Lock-free; safe to call from policy callbacks.
    pub fn slots_info(&self) -> WorkflowSlotsInfo {
        self.shared.slots_info()
    }

    pub fn num_cached(&self) -> usize {
        self.shared.num_cached.load(Ordering::Acquire)
    }

    /// Tasks waiting for their run to go Idle or for an evictable entry.
    pub fn buffered(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// Cached entries, least recently touched first.
    pub fn entries(&self) -> Vec<CachedWorkflowEntry> {
        self.shared
            .lock()
            .iter()
            .rev()
            .map(|(id, e)| CachedWorkflowEntry {
                run_id: id.clone(),
                state: e.state,
                last_touched: e.last_touched,
            })
            .collect()
    }

    /// Make `run_id` Active in the cache, waiting if it cannot be yet.
    ///
    /// Cancelling the returned future leaves the cache untouched.
    pub async fn admit(&self, run_id: RunId) -> CacheAdmission {
        let mut buffered: Option<BufferedGuard<'_>> = None;
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.shared.try_admit(&run_id) {
                Ok(evicted) => {
                    if buffered.is_some() {
                        tracing::debug!(run_id = %run_id, "Buffered workflow task admitted");
                    }
                    return CacheAdmission {
                        lease: CacheLease {
                            run_id,
                            shared: Arc::clone(&self.shared),
                            completed: false,
                        },
                        evicted,
                    };
                }
                Err(stall) => {
                    if buffered.is_none() {
                        tracing::debug!(run_id = %run_id, ?stall, "Workflow task buffered");
                        buffered = Some(BufferedGuard::new(&self.shared.buffered));
                    }
                }
            }
            changed.await;
        }
    }

    /// Evict `run_id` now if Idle, or once its in-flight task completes.
    ///
    /// Returns `false` if the run is not cached.
    pub fn request_eviction(&self, run_id: &RunId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let removed = {
            let mut entries = self.shared.lock();
            let Some(state) = entries.peek(run_id).map(|e| e.state) else {
                return false;
            };
            if state == CacheEntryState::Active {
                tracing::debug!(run_id = %run_id, %reason, "Eviction deferred until task completes");
                if let Some(entry) = entries.peek_mut(run_id) {
                    entry.pending_eviction = Some(reason);
                }
                false
            } else {
                self.shared
                    .remove(&mut entries, run_id, EvictionReason::Requested(reason))
                    .is_some()
            }
        };
        if removed {
            self.shared.changed.notify_waiters();
        }
        true
    }

    /// Wait until a place in the cache can be claimed.
    async fn claim(&self) -> ClaimGuard<'_> {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.shared.try_claim() {
                return ClaimGuard {
                    shared: &self.shared,
                    armed: true,
                };
            }
            tracing::trace!("Workflow reservation waiting for cache room");
            changed.await;
        }
    }

    fn try_claim(&self) -> Option<ClaimGuard<'_>> {
        self.shared.try_claim().then(|| ClaimGuard {
            shared: &self.shared,
            armed: true,
        })
    }

    fn take_room(
        &self,
        permit: &SlotSupplierPermit,
        room: Option<OwnedSemaphorePermit>,
        claim: ClaimGuard<'_>,
    ) {
        if let Some(room) = room {
            self.rooms.insert(permit.id(), room);
        }
        self.claimed.insert(permit.id());
        claim.keep();
    }

    fn settle_claim(&self, id: &PermitId) {
        if self.claimed.remove(id).is_some() {
            self.shared.drop_claim();
        }
    }
}

#[async_trait]
impl SlotSupplier for WorkflowCacheManager {
    type SlotKind = WorkflowSlotKind;

    async fn reserve_slot(
        &self,
        ctx: &SlotReservationContext<WorkflowSlotKind>,
    ) -> Result<SlotSupplierPermit, ReservationError> {
        let room = match &self.room {
            Some(room) => Some(
                Arc::clone(room)
                    .acquire_owned()
                    .await
                    .map_err(|_| ReservationError::Closed)?,
            ),
            None => None,
        };
        let claim = self.claim().await;
        let permit = self.inner.reserve_slot(ctx).await?;
        self.take_room(&permit, room, claim);
        Ok(permit)
    }

    fn try_reserve_slot(
        &self,
        ctx: &SlotReservationContext<WorkflowSlotKind>,
    ) -> Result<Option<SlotSupplierPermit>, ReservationError> {
        let room = match &self.room {
            Some(room) => match Arc::clone(room).try_acquire_owned() {
                Ok(room) => Some(room),
                Err(TryAcquireError::NoPermits) => return Ok(None),
                Err(TryAcquireError::Closed) => return Err(ReservationError::Closed),
            },
            None => None,
        };
        let Some(claim) = self.try_claim() else {
            return Ok(None);
        };
        let Some(permit) = self.inner.try_reserve_slot(ctx)? else {
            return Ok(None);
        };
        self.take_room(&permit, room, claim);
        Ok(Some(permit))
    }

    fn mark_slot_used(
        &self,
        permit: &SlotSupplierPermit,
        info: &<WorkflowSlotKind as SlotKind>::Info,
    ) {
        self.shared.used.insert(permit.id());
        self.inner.mark_slot_used(permit, info);
        self.settle_claim(&permit.id());
    }

    fn release_slot(&self, permit: SlotSupplierPermit, reason: &SlotReleaseReason) {
        let id = permit.id();
        self.shared.used.remove(&id);
        let room = self.rooms.remove(&id);
        self.inner.release_slot(permit, reason);
        drop(room);
        self.settle_claim(&id);
    }

    fn available_slots(&self) -> Option<usize> {
        let room = self.room.as_ref().map(|r| r.available_permits());
        match (room, self.inner.available_slots()) {
            (Some(room), Some(inner)) => Some(room.min(inner)),
            (room, inner) => room.or(inner),
        }
    }
}
