//! Pause/resume decorator over any supplier.
//!
//! While paused, no new reservation reaches the inner supplier's callers. A
//! reservation that was already waiting on the inner supplier and resolves while
//! paused hands its permit straight back (`NeverUsed`) and keeps waiting.
//! Polls that already hold a permit are not interrupted.

use async_trait::async_trait;
use tokio::sync::watch;

use super::{ReservationError, SlotReleaseReason, SlotReservationContext, SlotSupplier};
use crate::kind::SlotKind;
use crate::permit::SlotSupplierPermit;

pub struct PauseableSlotSupplier<S> {
    inner: S,
    paused: watch::Sender<bool>,
}

impl<S: SlotSupplier> PauseableSlotSupplier<S> {
    pub fn new(inner: S) -> Self {
        let (paused, _) = watch::channel(false);
        Self { inner, paused }
    }

    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            tracing::info!(kind = %<S::SlotKind as SlotKind>::KIND, "Slot reservations paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            tracing::info!(kind = %<S::SlotKind as SlotKind>::KIND, "Slot reservations resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: SlotSupplier> SlotSupplier for PauseableSlotSupplier<S> {
    type SlotKind = S::SlotKind;

    async fn reserve_slot(
        &self,
        ctx: &SlotReservationContext<Self::SlotKind>,
    ) -> Result<SlotSupplierPermit, ReservationError> {
        let mut paused = self.paused.subscribe();
        loop {
            paused
                .wait_for(|paused| !*paused)
                .await
                .map_err(|_| ReservationError::Closed)?;

            let permit = self.inner.reserve_slot(ctx).await?;
            if !self.is_paused() {
                return Ok(permit);
            }
            tracing::debug!(
                kind = %<S::SlotKind as SlotKind>::KIND,
                permit = %permit.id(),
                "Slot granted while paused, returning it"
            );
            self.inner.release_slot(permit, &SlotReleaseReason::NeverUsed);
        }
    }

    fn try_reserve_slot(
        &self,
        ctx: &SlotReservationContext<Self::SlotKind>,
    ) -> Result<Option<SlotSupplierPermit>, ReservationError> {
        if self.is_paused() {
            return Ok(None);
        }
        self.inner.try_reserve_slot(ctx)
    }

    fn mark_slot_used(
        &self,
        permit: &SlotSupplierPermit,
        info: &<Self::SlotKind as SlotKind>::Info,
    ) {
        self.inner.mark_slot_used(permit, info);
    }

    fn release_slot(&self, permit: SlotSupplierPermit, reason: &SlotReleaseReason) {
        self.inner.release_slot(permit, reason);
    }

    fn available_slots(&self) -> Option<usize> {
        if self.is_paused() {
            return Some(0);
        }
        self.inner.available_slots()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::kind::ActivitySlotKind;
    use crate::supplier::testing::RecordingSupplier;
    use crate::supplier::{FixedSizeSlotSupplier, UsedSlotsView};

    type Recorded = RecordingSupplier<FixedSizeSlotSupplier<ActivitySlotKind>>;

    fn ctx() -> SlotReservationContext<ActivitySlotKind> {
        SlotReservationContext::new("q", false, UsedSlotsView::empty())
    }

    #[tokio::test]
    async fn try_reserve_returns_none_while_paused() {
        let supplier = PauseableSlotSupplier::new(FixedSizeSlotSupplier::<ActivitySlotKind>::new(1));
        supplier.pause();
        assert!(supplier.is_paused());
        assert!(supplier.try_reserve_slot(&ctx()).unwrap().is_none());
        assert_eq!(supplier.inner().available_slots(), Some(1));

        supplier.resume();
        assert!(supplier.try_reserve_slot(&ctx()).unwrap().is_some());
    }

    #[tokio::test]
    async fn reserve_blocks_until_resume() {
        let supplier = Arc::new(PauseableSlotSupplier::new(
            FixedSizeSlotSupplier::<ActivitySlotKind>::new(1),
        ));
        supplier.pause();

        let waiter = {
            let supplier = Arc::clone(&supplier);
            tokio::spawn(async move { supplier.reserve_slot(&ctx()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        supplier.resume();
        let permit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("resume should unblock the reservation")
            .unwrap();
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn grant_during_pause_goes_back_to_inner() {
        let supplier = Arc::new(PauseableSlotSupplier::new(Recorded::new(
            FixedSizeSlotSupplier::new(1),
        )));
        let held = supplier.reserve_slot(&ctx()).await.unwrap();

        // Waiter is parked on the inner supplier, past the pause check.
        let waiter = {
            let supplier = Arc::clone(&supplier);
            tokio::spawn(async move { supplier.reserve_slot(&ctx()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        supplier.pause();
        supplier.release_slot(held, &SlotReleaseReason::TaskComplete);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!waiter.is_finished());
        assert!(
            supplier
                .inner()
                .reasons()
                .contains(&SlotReleaseReason::NeverUsed)
        );
        assert_eq!(supplier.inner().available_slots(), Some(1));

        supplier.resume();
        let permit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be granted after resume")
            .unwrap();
        assert!(permit.is_ok());
        supplier.inner().assert_released_once();
    }
}
