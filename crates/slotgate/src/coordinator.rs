//! Per-worker admission pipeline.
//!
//! One unit of work goes through:
//! 1. reserve a slot (before polling, so polls never outnumber free slots)
//! 2. poll
//! 3. cache admission (workflow tasks only)
//! 4. mark the slot used
//! 5. dispatch
//! 6. cache entry back to Idle, then release with `TaskComplete`
//!
//! The coordinator never second-guesses the supplier. It only enforces the
//! structural rules around it, and the slot guards make sure every permit is
//! settled exactly once on every exit path, cancellation included.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{EvictedWorkflow, WorkflowCacheManager};
use crate::kind::{SlotKind, WorkflowSlotKind};
use crate::permit::{PermitLedger, PermitMisuseError, ReservedSlot, SlotTracker};
use crate::supplier::{ReservationError, SlotReleaseReason, SlotSupplier, UsedSlotsView};

pub enum PollOutcome<T> {
    Task(T),
    /// Long poll came back empty.
    NoTask,
    /// Server handed back something that cannot be processed.
    Invalid(String),
}

#[async_trait]
pub trait TaskPoller<T>: Send + Sync {
    async fn poll(&self) -> PollOutcome<T>;

    fn task_queue(&self) -> &str;

    fn is_sticky(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait TaskDispatcher<T>: Send + Sync {
    async fn dispatch(&self, task: T) -> Result<(), DispatchError>;

    /// A run left the workflow cache; drop whatever state is kept for it.
    fn evicted(&self, _evicted: &EvictedWorkflow) {}
}

/// A polled task knows the slot info it will be admitted under.
pub trait AdmissionTask<K: SlotKind>: Send {
    fn slot_info(&self) -> K::Info;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task dispatch failed: {0}")]
pub struct DispatchError(pub String);

impl DispatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Completed,
    DispatchFailed(String),
    NoTask,
    /// The poll returned an invalid task; its slot was released with `Error`.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error("worker is defunct: {0}")]
    PermitMisuse(#[from] PermitMisuseError),
}

impl AdmissionError {
    /// The worker should stop polling altogether.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PermitMisuse(_))
    }
}

/// Counts an in-flight poll for as long as it lives.
struct PollGuard<'a>(&'a AtomicUsize);

impl<'a> PollGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct AdmissionCoordinator<K: SlotKind> {
    tracker: Arc<SlotTracker<K>>,
    active_polls: AtomicUsize,
}

impl<K: SlotKind> AdmissionCoordinator<K> {
    pub fn new(supplier: Arc<dyn SlotSupplier<SlotKind = K>>, ledger: Arc<PermitLedger>) -> Self {
        Self {
            tracker: Arc::new(SlotTracker::new(supplier, ledger)),
            active_polls: AtomicUsize::new(0),
        }
    }

    pub fn ledger(&self) -> &Arc<PermitLedger> {
        self.tracker.ledger()
    }

    pub fn supplier(&self) -> &Arc<dyn SlotSupplier<SlotKind = K>> {
        self.tracker.supplier()
    }

    fn check_defunct(&self) -> Result<(), AdmissionError> {
        match self.ledger().fatal() {
            Some(misuse) => Err(AdmissionError::PermitMisuse(misuse.clone())),
            None => Ok(()),
        }
    }

    /// Wait for a slot. Dropping the future leaks nothing.
    pub async fn reserve(
        &self,
        task_queue: &str,
        is_sticky: bool,
    ) -> Result<ReservedSlot<K>, AdmissionError> {
        self.check_defunct()?;
        let ctx = self.tracker.context(task_queue, is_sticky);
        let permit = self.supplier().reserve_slot(&ctx).await?;
        Ok(self.tracker.track(permit)?)
    }

    /// Reserve for eager paths that cannot wait.
    pub fn try_reserve(
        &self,
        task_queue: &str,
        is_sticky: bool,
    ) -> Result<Option<ReservedSlot<K>>, AdmissionError> {
        self.check_defunct()?;
        let ctx = self.tracker.context(task_queue, is_sticky);
        match self.supplier().try_reserve_slot(&ctx)? {
            Some(permit) => Ok(Some(self.tracker.track(permit)?)),
            None => Ok(None),
        }
    }

    /// Reserve, then poll. `Err(outcome)` when the poll produced no task; its
    /// slot has already been released.
    async fn reserve_and_poll<T, P>(
        &self,
        poller: &P,
    ) -> Result<Result<(ReservedSlot<K>, T), AdmissionOutcome>, AdmissionError>
    where
        T: AdmissionTask<K>,
        P: TaskPoller<T> + ?Sized,
    {
        let reserved = self.reserve(poller.task_queue(), poller.is_sticky()).await?;
        let polled = {
            let _poll = PollGuard::new(&self.active_polls);
            poller.poll().await
        };
        match polled {
            PollOutcome::Task(task) => Ok(Ok((reserved, task))),
            PollOutcome::NoTask => {
                reserved.release(SlotReleaseReason::NeverUsed);
                Ok(Err(AdmissionOutcome::NoTask))
            }
            PollOutcome::Invalid(reason) => {
                tracing::warn!(
                    kind = %K::KIND,
                    task_queue = poller.task_queue(),
                    %reason,
                    "Polled task rejected"
                );
                reserved.release(SlotReleaseReason::error(reason.clone()));
                Ok(Err(AdmissionOutcome::Rejected(reason)))
            }
        }
    }

    /// Drive one unit of work end to end.
    pub async fn run_once<T, P, D>(
        &self,
        poller: &P,
        dispatcher: &D,
    ) -> Result<AdmissionOutcome, AdmissionError>
    where
        T: AdmissionTask<K>,
        P: TaskPoller<T> + ?Sized,
        D: TaskDispatcher<T> + ?Sized,
    {
        match self.reserve_and_poll(poller).await? {
            Ok((reserved, task)) => Ok(self.execute(reserved, task, dispatcher).await),
            Err(outcome) => Ok(outcome),
        }
    }

    /// Mark used, dispatch, release.
    pub async fn execute<T, D>(
        &self,
        reserved: ReservedSlot<K>,
        task: T,
        dispatcher: &D,
    ) -> AdmissionOutcome
    where
        T: AdmissionTask<K>,
        D: TaskDispatcher<T> + ?Sized,
    {
        let used = reserved.mark_used(task.slot_info());
        let result = dispatcher.dispatch(task).await;
        used.release(SlotReleaseReason::TaskComplete);
        dispatch_outcome::<K>(result)
    }

    /// Polls currently in flight.
    pub fn active_polls(&self) -> usize {
        self.active_polls.load(Ordering::Acquire)
    }

    /// Permits reserved but not yet bound to a task.
    pub fn reserved(&self) -> usize {
        let ledger = self.ledger();
        ledger
            .outstanding(K::KIND)
            .saturating_sub(ledger.in_use(K::KIND))
    }

    pub fn in_use(&self) -> usize {
        self.ledger().in_use(K::KIND)
    }

    pub fn used_slots(&self) -> UsedSlotsView<K> {
        self.tracker.used_slots()
    }

    /// Permits of this kind held for longer than `threshold`.
    pub fn check_leaks(&self, threshold: Duration) -> Vec<PermitMisuseError> {
        self.ledger()
            .leaks(threshold)
            .into_iter()
            .filter(|leak| matches!(leak, PermitMisuseError::Leaked { kind, .. } if *kind == K::KIND))
            .collect()
    }
}

fn dispatch_outcome<K: SlotKind>(result: Result<(), DispatchError>) -> AdmissionOutcome {
    match result {
        Ok(()) => AdmissionOutcome::Completed,
        Err(e) => {
            tracing::warn!(kind = %K::KIND, error = %e, "Task dispatch failed");
            AdmissionOutcome::DispatchFailed(e.0)
        }
    }
}

/// Workflow pipeline: the base pipeline plus cache admission.
pub struct WorkflowAdmissionCoordinator {
    base: AdmissionCoordinator<WorkflowSlotKind>,
    cache: Arc<WorkflowCacheManager>,
}

impl WorkflowAdmissionCoordinator {
    pub fn new(cache: Arc<WorkflowCacheManager>, ledger: Arc<PermitLedger>) -> Self {
        let supplier: Arc<dyn SlotSupplier<SlotKind = WorkflowSlotKind>> = cache.clone();
        Self {
            base: AdmissionCoordinator::new(supplier, ledger),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<WorkflowCacheManager> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<PermitLedger> {
        self.base.ledger()
    }

    pub async fn reserve(
        &self,
        task_queue: &str,
        is_sticky: bool,
    ) -> Result<ReservedSlot<WorkflowSlotKind>, AdmissionError> {
        self.base.reserve(task_queue, is_sticky).await
    }

    pub fn try_reserve(
        &self,
        task_queue: &str,
        is_sticky: bool,
    ) -> Result<Option<ReservedSlot<WorkflowSlotKind>>, AdmissionError> {
        self.base.try_reserve(task_queue, is_sticky)
    }

    pub async fn run_once<T, P, D>(
        &self,
        poller: &P,
        dispatcher: &D,
    ) -> Result<AdmissionOutcome, AdmissionError>
    where
        T: AdmissionTask<WorkflowSlotKind>,
        P: TaskPoller<T> + ?Sized,
        D: TaskDispatcher<T> + ?Sized,
    {
        match self.base.reserve_and_poll(poller).await? {
            Ok((reserved, task)) => Ok(self.execute(reserved, task, dispatcher).await),
            Err(outcome) => Ok(outcome),
        }
    }

    /// Admit the run into the cache, then mark used, dispatch, release.
    ///
    /// Waits (holding the reservation) while the cache cannot take the run.
    pub async fn execute<T, D>(
        &self,
        reserved: ReservedSlot<WorkflowSlotKind>,
        task: T,
        dispatcher: &D,
    ) -> AdmissionOutcome
    where
        T: AdmissionTask<WorkflowSlotKind>,
        D: TaskDispatcher<T> + ?Sized,
    {
        let info = task.slot_info();
        let admission = self.cache.admit(info.run_id.clone()).await;
        if let Some(evicted) = &admission.evicted {
            dispatcher.evicted(evicted);
        }

        let used = reserved.mark_used(info);
        let result = dispatcher.dispatch(task).await;

        if let Some(evicted) = admission.lease.complete() {
            dispatcher.evicted(&evicted);
        }
        used.release(SlotReleaseReason::TaskComplete);
        dispatch_outcome::<WorkflowSlotKind>(result)
    }

    pub fn active_polls(&self) -> usize {
        self.base.active_polls()
    }

    pub fn reserved(&self) -> usize {
        self.base.reserved()
    }

    pub fn in_use(&self) -> usize {
        self.base.in_use()
    }

    pub fn used_slots(&self) -> UsedSlotsView<WorkflowSlotKind> {
        self.base.used_slots()
    }

    pub fn check_leaks(&self, threshold: Duration) -> Vec<PermitMisuseError> {
        self.base.check_leaks(threshold)
    }
}
