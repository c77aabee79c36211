//! Admission-control policies.
//!
//! A [`SlotSupplier`] decides, for one slot kind, whether a poller may take on
//! another unit of work. Suppliers hand out [`SlotSupplierPermit`]s; the
//! coordinator wraps each permit in a guard that settles it exactly once.
//!
//! Only `reserve_slot` may suspend. Everything else is synchronous and must not
//! call back into `reserve_slot`.

mod fixed;
mod pauseable;
mod resource;

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bridge::CrossBoundaryValidationError;
use crate::kind::SlotKind;
use crate::permit::SlotSupplierPermit;

pub use fixed::FixedSizeSlotSupplier;
pub use pauseable::PauseableSlotSupplier;
pub use resource::{
    ResourceBasedKind, ResourceBasedOptions, ResourceBasedSlotSupplier, ResourceSampler,
    ResourceUsage, SystemResourceSampler,
};

#[async_trait]
pub trait SlotSupplier: Send + Sync {
    type SlotKind: SlotKind;

    /// Wait until a slot is available.
    ///
    /// Dropping the returned future must not leak capacity.
    async fn reserve_slot(
        &self,
        ctx: &SlotReservationContext<Self::SlotKind>,
    ) -> Result<SlotSupplierPermit, ReservationError>;

    /// Reserve without waiting. `Ok(None)` when no slot is free right now.
    fn try_reserve_slot(
        &self,
        ctx: &SlotReservationContext<Self::SlotKind>,
    ) -> Result<Option<SlotSupplierPermit>, ReservationError>;

    fn mark_slot_used(
        &self,
        permit: &SlotSupplierPermit,
        info: &<Self::SlotKind as SlotKind>::Info,
    );

    fn release_slot(&self, permit: SlotSupplierPermit, reason: &SlotReleaseReason);

    /// Advisory count of free slots, `None` if the policy cannot tell.
    fn available_slots(&self) -> Option<usize> {
        None
    }
}

#[async_trait]
impl<S: SlotSupplier + ?Sized> SlotSupplier for Arc<S> {
    type SlotKind = S::SlotKind;

    async fn reserve_slot(
        &self,
        ctx: &SlotReservationContext<Self::SlotKind>,
    ) -> Result<SlotSupplierPermit, ReservationError> {
        (**self).reserve_slot(ctx).await
    }

    fn try_reserve_slot(
        &self,
        ctx: &SlotReservationContext<Self::SlotKind>,
    ) -> Result<Option<SlotSupplierPermit>, ReservationError> {
        (**self).try_reserve_slot(ctx)
    }

    fn mark_slot_used(
        &self,
        permit: &SlotSupplierPermit,
        info: &<Self::SlotKind as SlotKind>::Info,
    ) {
        (**self).mark_slot_used(permit, info)
    }

    fn release_slot(&self, permit: SlotSupplierPermit, reason: &SlotReleaseReason) {
        (**self).release_slot(permit, reason)
    }

    fn available_slots(&self) -> Option<usize> {
        (**self).available_slots()
    }
}

/// What a supplier knows about the reservation it is asked for.
pub struct SlotReservationContext<K: SlotKind> {
    pub task_queue: String,
    pub is_sticky: bool,
    pub used_slots: UsedSlotsView<K>,
}

impl<K: SlotKind> SlotReservationContext<K> {
    pub fn new(task_queue: impl Into<String>, is_sticky: bool, used_slots: UsedSlotsView<K>) -> Self {
        Self {
            task_queue: task_queue.into(),
            is_sticky,
            used_slots,
        }
    }
}

impl<K: SlotKind> fmt::Debug for SlotReservationContext<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotReservationContext")
            .field("kind", &K::KIND)
            .field("task_queue", &self.task_queue)
            .field("is_sticky", &self.is_sticky)
            .field("used_slots", &self.used_slots.len())
            .finish()
    }
}

/// Point-in-time copy of the info of every used slot of one kind.
pub struct UsedSlotsView<K: SlotKind> {
    infos: Vec<K::Info>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: SlotKind> UsedSlotsView<K> {
    pub fn new(infos: Vec<K::Info>) -> Self {
        Self {
            infos,
            _kind: PhantomData,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &K::Info> {
        self.infos.iter()
    }

    pub fn infos(&self) -> &[K::Info] {
        &self.infos
    }

    pub fn into_infos(self) -> Vec<K::Info> {
        self.infos
    }
}

impl<K: SlotKind> Clone for UsedSlotsView<K> {
    fn clone(&self) -> Self {
        Self::new(self.infos.clone())
    }
}

impl<K: SlotKind> Default for UsedSlotsView<K> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<K: SlotKind> fmt::Debug for UsedSlotsView<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.infos.iter()).finish()
    }
}

/// Why a permit is being handed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "details", rename_all = "snake_case")]
pub enum SlotReleaseReason {
    TaskComplete,
    NeverUsed,
    Error(String),
}

impl SlotReleaseReason {
    pub fn error(details: impl Into<String>) -> Self {
        Self::Error(details.into())
    }
}

impl fmt::Display for SlotReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskComplete => f.write_str("task_complete"),
            Self::NeverUsed => f.write_str("never_used"),
            Self::Error(details) => write!(f, "error: {details}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("slot supplier is closed")]
    Closed,

    #[error("slot policy failed: {0}")]
    Policy(String),

    #[error("policy response rejected: {0}")]
    Validation(#[from] CrossBoundaryValidationError),
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{ActivitySlotInfo, ActivitySlotKind};

    #[test]
    fn release_reason_wire_format() {
        insta::assert_json_snapshot!(
            "release_reasons",
            vec![
                SlotReleaseReason::TaskComplete,
                SlotReleaseReason::NeverUsed,
                SlotReleaseReason::error("worker shut down"),
            ]
        );
    }

    #[test]
    fn used_slots_view_is_a_copy() {
        let info = ActivitySlotInfo {
            activity_type: "charge".into(),
            task_queue: "payments".into(),
        };
        let view = UsedSlotsView::<ActivitySlotKind>::new(vec![info.clone()]);
        let copy = view.clone();
        assert_eq!(copy.len(), 1);
        assert_eq!(copy.infos()[0], info);
        assert!(UsedSlotsView::<ActivitySlotKind>::empty().is_empty());
    }
}
