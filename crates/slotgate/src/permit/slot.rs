//! Typestate guards around a supplier permit.
//!
//! - `ReservedSlot` → `UsedSlot` via `mark_used()`
//! - `ReservedSlot` dropped → released as `NeverUsed`
//! - `UsedSlot` dropped → released as `Error` (the task was abandoned)
//! - `UsedSlot` → `ReservedSlot`: NOT POSSIBLE (no method exists)
//!
//! Every path goes through [`SlotTracker::release`], which checks the permit
//! against the ledger before the supplier ever sees it.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;

use super::{PermitId, PermitLedger, PermitMisuseError, SlotSupplierPermit};
use crate::kind::SlotKind;
use crate::supplier::{SlotReleaseReason, SlotReservationContext, SlotSupplier, UsedSlotsView};

/// Binds one supplier to the worker's ledger and tracks used-slot info.
pub(crate) struct SlotTracker<K: SlotKind> {
    supplier: Arc<dyn SlotSupplier<SlotKind = K>>,
    ledger: Arc<PermitLedger>,
    used: DashMap<PermitId, K::Info>,
}

impl<K: SlotKind> SlotTracker<K> {
    pub fn new(supplier: Arc<dyn SlotSupplier<SlotKind = K>>, ledger: Arc<PermitLedger>) -> Self {
        Self {
            supplier,
            ledger,
            used: DashMap::new(),
        }
    }

    pub fn supplier(&self) -> &Arc<dyn SlotSupplier<SlotKind = K>> {
        &self.supplier
    }

    pub fn ledger(&self) -> &Arc<PermitLedger> {
        &self.ledger
    }

    pub fn used_slots(&self) -> UsedSlotsView<K> {
        UsedSlotsView::new(self.used.iter().map(|e| e.value().clone()).collect())
    }

    pub fn context(&self, task_queue: &str, is_sticky: bool) -> SlotReservationContext<K> {
        SlotReservationContext::new(task_queue, is_sticky, self.used_slots())
    }

    /// Record a freshly granted permit and wrap it in a guard.
    pub fn track(
        self: &Arc<Self>,
        permit: SlotSupplierPermit,
    ) -> Result<ReservedSlot<K>, PermitMisuseError> {
        if let Err(e) = self.ledger.issue(permit.id(), K::KIND) {
            // The supplier already counts this id as outstanding under its
            // first issue; settling it here would release it twice.
            self.ledger.report(e.clone());
            return Err(e);
        }
        tracing::trace!(kind = %K::KIND, permit = %permit.id(), "Slot reserved");
        Ok(ReservedSlot {
            permit: Some(permit),
            tracker: Arc::clone(self),
        })
    }

    fn mark_used(&self, permit: &SlotSupplierPermit, info: &K::Info) {
        if let Err(e) = self.ledger.mark_used(permit.id(), K::KIND) {
            self.ledger.report(e);
            return;
        }
        self.used.insert(permit.id(), info.clone());
        contain_panic(K::KIND.as_str(), "mark_slot_used", || {
            self.supplier.mark_slot_used(permit, info)
        });
    }

    fn release(&self, permit: SlotSupplierPermit, reason: SlotReleaseReason) {
        let id = permit.id();
        if let Err(e) = self.ledger.release(id, K::KIND) {
            self.ledger.report(e);
            return;
        }
        self.used.remove(&id);
        tracing::trace!(kind = %K::KIND, permit = %id, %reason, "Slot released");
        contain_panic(K::KIND.as_str(), "release_slot", || {
            self.supplier.release_slot(permit, &reason)
        });
    }
}

fn contain_panic(kind: &str, op: &str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            kind,
            op,
            panic = panic_message(payload.as_ref()),
            "Slot policy panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}

/// A reserved permit not yet bound to a task.
///
/// On drop: released as `NeverUsed`.
pub struct ReservedSlot<K: SlotKind> {
    permit: Option<SlotSupplierPermit>,
    tracker: Arc<SlotTracker<K>>,
}

impl<K: SlotKind> ReservedSlot<K> {
    pub fn id(&self) -> PermitId {
        self.permit().id()
    }

    pub fn permit(&self) -> &SlotSupplierPermit {
        self.permit
            .as_ref()
            .unwrap_or_else(|| unreachable!("permit taken before drop"))
    }

    pub fn mark_used(mut self, info: K::Info) -> UsedSlot<K> {
        let permit = self
            .permit
            .take()
            .unwrap_or_else(|| unreachable!("permit taken before drop"));
        self.tracker.mark_used(&permit, &info);
        UsedSlot {
            permit: Some(permit),
            info,
            tracker: Arc::clone(&self.tracker),
        }
    }

    pub fn release(mut self, reason: SlotReleaseReason) {
        if let Some(permit) = self.permit.take() {
            self.tracker.release(permit, reason);
        }
    }
}

impl<K: SlotKind> Drop for ReservedSlot<K> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.tracker.release(permit, SlotReleaseReason::NeverUsed);
        }
    }
}

impl<K: SlotKind> std::fmt::Debug for ReservedSlot<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedSlot")
            .field("kind", &K::KIND)
            .field("permit", &self.permit)
            .finish()
    }
}

/// A permit bound to a task.
///
/// On drop without `release`: logged and released as `Error`.
pub struct UsedSlot<K: SlotKind> {
    permit: Option<SlotSupplierPermit>,
    info: K::Info,
    tracker: Arc<SlotTracker<K>>,
}

impl<K: SlotKind> UsedSlot<K> {
    pub fn id(&self) -> PermitId {
        self.permit
            .as_ref()
            .map(SlotSupplierPermit::id)
            .unwrap_or_else(|| unreachable!("permit taken before drop"))
    }

    pub fn info(&self) -> &K::Info {
        &self.info
    }

    pub fn release(mut self, reason: SlotReleaseReason) {
        if let Some(permit) = self.permit.take() {
            self.tracker.release(permit, reason);
        }
    }
}

impl<K: SlotKind> Drop for UsedSlot<K> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            tracing::warn!(
                kind = %K::KIND,
                permit = %permit.id(),
                "Used slot dropped without release"
            );
            self.tracker
                .release(permit, SlotReleaseReason::error("task abandoned"));
        }
    }
}

impl<K: SlotKind> std::fmt::Debug for UsedSlot<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsedSlot")
            .field("kind", &K::KIND)
            .field("permit", &self.permit)
            .field("info", &self.info)
            .finish()
    }
}
