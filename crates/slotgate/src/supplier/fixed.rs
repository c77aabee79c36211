//! Fixed-capacity policy: a counting semaphore of N slots.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Semaphore, TryAcquireError};

use super::{ReservationError, SlotReleaseReason, SlotReservationContext, SlotSupplier};
use crate::kind::SlotKind;
use crate::permit::SlotSupplierPermit;

pub struct FixedSizeSlotSupplier<K> {
    semaphore: Semaphore,
    capacity: usize,
    outstanding: AtomicUsize,
    _kind: PhantomData<fn() -> K>,
}

impl<K: SlotKind> FixedSizeSlotSupplier<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            outstanding: AtomicUsize::new(0),
            _kind: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn grant(&self) -> SlotSupplierPermit {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        SlotSupplierPermit::new()
    }
}

#[async_trait]
impl<K: SlotKind> SlotSupplier for FixedSizeSlotSupplier<K> {
    type SlotKind = K;

    async fn reserve_slot(
        &self,
        _ctx: &SlotReservationContext<K>,
    ) -> Result<SlotSupplierPermit, ReservationError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ReservationError::Closed)?;
        // Capacity comes back through release_slot, not through the guard.
        permit.forget();
        Ok(self.grant())
    }

    fn try_reserve_slot(
        &self,
        _ctx: &SlotReservationContext<K>,
    ) -> Result<Option<SlotSupplierPermit>, ReservationError> {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(Some(self.grant()))
            }
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(ReservationError::Closed),
        }
    }

    fn mark_slot_used(&self, _permit: &SlotSupplierPermit, _info: &K::Info) {}

    fn release_slot(&self, permit: SlotSupplierPermit, reason: &SlotReleaseReason) {
        let released = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            tracing::error!(
                kind = %K::KIND,
                permit = %permit.id(),
                %reason,
                "Release refused: more permits released than were issued"
            );
            return;
        }
        self.semaphore.add_permits(1);
    }

    fn available_slots(&self) -> Option<usize> {
        Some(self.semaphore.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::kind::ActivitySlotKind;
    use crate::supplier::UsedSlotsView;

    fn ctx() -> SlotReservationContext<ActivitySlotKind> {
        SlotReservationContext::new("q", false, UsedSlotsView::empty())
    }

    #[tokio::test]
    async fn capacity_round_trip() {
        let supplier = FixedSizeSlotSupplier::<ActivitySlotKind>::new(3);

        let mut permits = Vec::new();
        for _ in 0..3 {
            permits.push(supplier.try_reserve_slot(&ctx()).unwrap().unwrap());
        }
        assert!(supplier.try_reserve_slot(&ctx()).unwrap().is_none());
        assert_eq!(supplier.available_slots(), Some(0));

        supplier.release_slot(permits.pop().unwrap(), &SlotReleaseReason::TaskComplete);
        assert!(supplier.try_reserve_slot(&ctx()).unwrap().is_some());
    }

    #[tokio::test]
    async fn reserve_waits_for_release() {
        let supplier = Arc::new(FixedSizeSlotSupplier::<ActivitySlotKind>::new(1));
        let held = supplier.reserve_slot(&ctx()).await.unwrap();

        let waiter = {
            let supplier = Arc::clone(&supplier);
            tokio::spawn(async move { supplier.reserve_slot(&ctx()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        supplier.release_slot(held, &SlotReleaseReason::NeverUsed);
        let granted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be granted")
            .unwrap();
        assert!(granted.is_ok());
    }

    #[tokio::test]
    async fn over_release_is_refused() {
        let supplier = FixedSizeSlotSupplier::<ActivitySlotKind>::new(1);
        let permit = supplier.try_reserve_slot(&ctx()).unwrap().unwrap();
        supplier.release_slot(permit, &SlotReleaseReason::TaskComplete);

        supplier.release_slot(SlotSupplierPermit::new(), &SlotReleaseReason::TaskComplete);
        assert_eq!(supplier.available_slots(), Some(1));
        assert_eq!(supplier.outstanding(), 0);
    }

    #[tokio::test]
    async fn cancelled_reserve_leaks_nothing() {
        let supplier = FixedSizeSlotSupplier::<ActivitySlotKind>::new(1);
        let held = supplier.try_reserve_slot(&ctx()).unwrap().unwrap();

        let c = ctx();
        let pending = tokio::time::timeout(Duration::from_millis(10), supplier.reserve_slot(&c));
        assert!(pending.await.is_err());

        supplier.release_slot(held, &SlotReleaseReason::NeverUsed);
        assert_eq!(supplier.available_slots(), Some(1));
    }
}
