//! Worker side of the policy bridge.
//!
//! [`BridgedSlotSupplier`] forwards every supplier call over a framed stream to
//! a policy hosted in another process, and checks each answer before it turns
//! into a permit. A granted permit that fails those checks goes straight back
//! to the host with an `Error` release.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{
    CrossBoundaryValidationError, PolicyRequest, PolicyResponse, ReservationId, WirePermit,
};
use crate::kind::{SlotKind, SlotKindType};
use crate::permit::{PermitId, SlotSupplierPermit};
use crate::supplier::{
    ReservationError, SlotReleaseReason, SlotReservationContext, SlotSupplier,
};

type Grant = Result<SlotSupplierPermit, ReservationError>;

struct Shared {
    outbound: mpsc::UnboundedSender<PolicyRequest>,
    pending: DashMap<ReservationId, oneshot::Sender<Grant>>,
    closed: AtomicBool,
}

impl Shared {
    fn send(&self, req: PolicyRequest) -> bool {
        if self.outbound.send(req).is_err() {
            self.closed.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn release(&self, kind: SlotKindType, permit: String, reason: SlotReleaseReason) {
        if !self.send(PolicyRequest::Release {
            kind,
            permit: permit.clone(),
            reason,
        }) {
            tracing::warn!(%permit, "Policy bridge closed; release not delivered");
        }
    }

    fn fail_all_pending(&self) {
        let ids: Vec<ReservationId> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(ReservationError::Closed));
            }
        }
    }
}

/// Slot supplier backed by a policy on the far end of a byte stream.
pub struct BridgedSlotSupplier<K: SlotKind> {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: SlotKind> BridgedSlotSupplier<K> {
    /// Start the reader and writer tasks. Must be called inside a tokio runtime.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outbound,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        let writer = tokio::spawn(write_loop(writer, rx, Arc::clone(&shared)));
        let reader = tokio::spawn(read_loop::<K, R>(reader, Arc::clone(&shared)));

        Self {
            shared,
            next_id: AtomicU64::new(1),
            reader,
            writer,
            _kind: PhantomData,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Reservations sent but not yet answered.
    pub fn pending_reservations(&self) -> usize {
        self.shared.pending.len()
    }
}

impl<K: SlotKind> Drop for BridgedSlotSupplier<K> {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn write_loop<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<PolicyRequest>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(writer, JsonCodec::<PolicyRequest>::new());
    while let Some(req) = rx.recv().await {
        if let Err(e) = sink.send(req).await {
            tracing::error!(error = %e, "Policy bridge write failed");
            break;
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.fail_all_pending();
}

async fn read_loop<K, R>(reader: R, shared: Arc<Shared>)
where
    K: SlotKind,
    R: AsyncRead + Unpin + Send + 'static,
{
    // Frames are decoded loosely first so one bad answer does not end the stream.
    let mut frames = FramedRead::new(reader, JsonCodec::<serde_json::Value>::new());
    loop {
        match frames.next().await {
            Some(Ok(value)) => handle_response::<K>(&shared, value),
            Some(Err(e)) => {
                tracing::error!(error = %e, "Policy bridge read failed");
                break;
            }
            None => {
                tracing::info!("Policy bridge closed by host");
                break;
            }
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.fail_all_pending();
}

fn handle_response<K: SlotKind>(shared: &Shared, value: serde_json::Value) {
    let resp: PolicyResponse = match serde_json::from_value(value.clone()) {
        Ok(resp) => resp,
        Err(e) => {
            let err = CrossBoundaryValidationError::UnexpectedResponse(e.to_string());
            tracing::warn!(error = %err, "Dropping undecodable policy response");
            if let Some(id) = value.get("id").and_then(serde_json::Value::as_u64)
                && let Some((_, tx)) = shared.pending.remove(&id)
            {
                let _ = tx.send(Err(err.into()));
            }
            return;
        }
    };

    match resp {
        PolicyResponse::Reserved { id, kind, permit } => {
            let grant = match validate::<K>(kind, &permit) {
                Ok(permit) => permit,
                Err(err) => {
                    tracing::warn!(reservation = id, error = %err, "Rejecting policy grant");
                    shared.release(kind, permit.id, SlotReleaseReason::error(err.to_string()));
                    if let Some((_, tx)) = shared.pending.remove(&id) {
                        let _ = tx.send(Err(err.into()));
                    }
                    return;
                }
            };
            deliver(shared, id, K::KIND, grant);
        }
        PolicyResponse::Failed { id, error } => match shared.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(Err(ReservationError::Policy(error)));
            }
            None => tracing::debug!(reservation = id, "Failure for abandoned reservation"),
        },
    }
}

/// Hand a granted permit to its waiter, or give it back if nobody is waiting.
fn deliver(shared: &Shared, id: ReservationId, kind: SlotKindType, permit: SlotSupplierPermit) {
    let unclaimed = match shared.pending.remove(&id) {
        Some((_, tx)) => match tx.send(Ok(permit)) {
            Ok(()) => None,
            Err(Ok(permit)) => Some(permit),
            Err(Err(_)) => None,
        },
        None => Some(permit),
    };
    if let Some(permit) = unclaimed {
        tracing::debug!(reservation = id, permit = %permit.id(), "Late grant, releasing");
        shared.release(kind, permit.id().to_string(), SlotReleaseReason::NeverUsed);
    }
}

fn validate<K: SlotKind>(
    kind: SlotKindType,
    permit: &WirePermit,
) -> Result<SlotSupplierPermit, CrossBoundaryValidationError> {
    if kind != K::KIND {
        return Err(CrossBoundaryValidationError::KindMismatch {
            expected: K::KIND,
            actual: kind,
        });
    }
    let id = PermitId::parse(&permit.id).map_err(|_| {
        CrossBoundaryValidationError::MalformedPermit {
            id: permit.id.clone(),
        }
    })?;
    let data = permit
        .user_data
        .clone()
        .map(|v| Box::new(v) as Box<dyn Any + Send + Sync>);
    Ok(SlotSupplierPermit::from_parts(id, data))
}

/// Outstanding reservation. Dropping it before an answer cancels it on the host.
struct PendingReservation<'a> {
    id: ReservationId,
    kind: SlotKindType,
    rx: oneshot::Receiver<Grant>,
    shared: &'a Shared,
    done: bool,
}

impl PendingReservation<'_> {
    async fn wait(mut self) -> Grant {
        let grant = (&mut self.rx).await;
        self.done = true;
        grant.unwrap_or(Err(ReservationError::Closed))
    }
}

impl Drop for PendingReservation<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.shared.pending.remove(&self.id).is_some() {
            self.shared.send(PolicyRequest::CancelReserve { id: self.id });
            return;
        }
        // The reader already claimed our sender. Whatever it sent is ours to return.
        self.rx.close();
        if let Ok(Ok(permit)) = self.rx.try_recv() {
            self.shared.release(
                self.kind,
                permit.id().to_string(),
                SlotReleaseReason::NeverUsed,
            );
        }
    }
}

#[async_trait]
impl<K: SlotKind> SlotSupplier for BridgedSlotSupplier<K> {
    type SlotKind = K;

    async fn reserve_slot(
        &self,
        ctx: &SlotReservationContext<K>,
    ) -> Result<SlotSupplierPermit, ReservationError> {
        if self.is_closed() {
            return Err(ReservationError::Closed);
        }

        let used_slots = ctx
            .used_slots
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ReservationError::Policy(format!("unserializable slot info: {e}")))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        // The reader may have drained `pending` between the check above and the insert.
        if self.is_closed() {
            self.shared.pending.remove(&id);
            return Err(ReservationError::Closed);
        }

        let sent = self.shared.send(PolicyRequest::Reserve {
            id,
            kind: K::KIND,
            task_queue: ctx.task_queue.clone(),
            is_sticky: ctx.is_sticky,
            used_slots,
        });
        if !sent {
            self.shared.pending.remove(&id);
            return Err(ReservationError::Closed);
        }

        PendingReservation {
            id,
            kind: K::KIND,
            rx,
            shared: &self.shared,
            done: false,
        }
        .wait()
        .await
    }

    /// The remote policy is only reachable asynchronously.
    fn try_reserve_slot(
        &self,
        _ctx: &SlotReservationContext<K>,
    ) -> Result<Option<SlotSupplierPermit>, ReservationError> {
        if self.is_closed() {
            return Err(ReservationError::Closed);
        }
        Ok(None)
    }

    fn mark_slot_used(&self, permit: &SlotSupplierPermit, info: &K::Info) {
        let info = match serde_json::to_value(info) {
            Ok(info) => info,
            Err(e) => {
                tracing::error!(permit = %permit.id(), error = %e, "Unserializable slot info");
                return;
            }
        };
        if !self.shared.send(PolicyRequest::MarkUsed {
            kind: K::KIND,
            permit: permit.id().to_string(),
            info,
        }) {
            tracing::warn!(permit = %permit.id(), "Policy bridge closed; mark_used not delivered");
        }
    }

    fn release_slot(&self, permit: SlotSupplierPermit, reason: &SlotReleaseReason) {
        self.shared
            .release(K::KIND, permit.id().to_string(), reason.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::kind::{ActivitySlotInfo, ActivitySlotKind};
    use crate::supplier::UsedSlotsView;

    const PERMIT: &str = "0b6f3c52-1a8e-4f0b-9d47-5e2c8a1f7b30";

    struct FakeHost {
        requests: FramedRead<ReadHalf<DuplexStream>, JsonCodec<PolicyRequest>>,
        responses: FramedWrite<WriteHalf<DuplexStream>, JsonCodec<serde_json::Value>>,
    }

    impl FakeHost {
        async fn next(&mut self) -> PolicyRequest {
            self.requests.next().await.unwrap().unwrap()
        }

        async fn next_reserve(&mut self) -> ReservationId {
            match self.next().await {
                PolicyRequest::Reserve { id, .. } => id,
                other => panic!("expected reserve, got {other:?}"),
            }
        }

        async fn reply(&mut self, value: serde_json::Value) {
            self.responses.send(value).await.unwrap();
        }
    }

    fn connect() -> (BridgedSlotSupplier<ActivitySlotKind>, FakeHost) {
        let (client_io, host_io) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client_io);
        let (hr, hw) = tokio::io::split(host_io);
        let supplier = BridgedSlotSupplier::connect(cr, cw);
        let host = FakeHost {
            requests: FramedRead::new(hr, JsonCodec::new()),
            responses: FramedWrite::new(hw, JsonCodec::new()),
        };
        (supplier, host)
    }

    fn ctx() -> SlotReservationContext<ActivitySlotKind> {
        SlotReservationContext::new("payments", false, UsedSlotsView::empty())
    }

    #[tokio::test]
    async fn valid_grant_carries_user_data() {
        let (supplier, mut host) = connect();
        let ctx = ctx();

        let (permit, ()) = tokio::join!(supplier.reserve_slot(&ctx), async {
            let id = host.next_reserve().await;
            host.reply(serde_json::json!({
                "type": "reserved",
                "id": id,
                "kind": "activity",
                "permit": {"id": PERMIT, "user_data": {"pool": "gpu"}},
            }))
            .await;
        });
        let permit = permit.unwrap();

        assert_eq!(permit.id().to_string(), PERMIT);
        assert_eq!(
            permit.user_data::<serde_json::Value>(),
            Some(&serde_json::json!({"pool": "gpu"}))
        );
        assert_eq!(supplier.pending_reservations(), 0);

        let info = ActivitySlotInfo {
            activity_type: "charge".to_string(),
            task_queue: "payments".to_string(),
        };
        supplier.mark_slot_used(&permit, &info);
        supplier.release_slot(permit, &SlotReleaseReason::TaskComplete);

        match host.next().await {
            PolicyRequest::MarkUsed { kind, permit, info } => {
                assert_eq!(kind, SlotKindType::Activity);
                assert_eq!(permit, PERMIT);
                assert_eq!(info["activity_type"], "charge");
            }
            other => panic!("expected mark_used, got {other:?}"),
        }
        assert_eq!(
            host.next().await,
            PolicyRequest::Release {
                kind: SlotKindType::Activity,
                permit: PERMIT.to_string(),
                reason: SlotReleaseReason::TaskComplete,
            }
        );
    }

    #[tokio::test]
    async fn wrong_kind_grant_is_rejected_and_returned() {
        let (supplier, mut host) = connect();
        let ctx = ctx();

        let (result, ()) = tokio::join!(supplier.reserve_slot(&ctx), async {
            let id = host.next_reserve().await;
            host.reply(serde_json::json!({
                "type": "reserved",
                "id": id,
                "kind": "workflow",
                "permit": {"id": PERMIT},
            }))
            .await;
        });

        match result {
            Err(ReservationError::Validation(CrossBoundaryValidationError::KindMismatch {
                expected,
                actual,
            })) => {
                assert_eq!(expected, SlotKindType::Activity);
                assert_eq!(actual, SlotKindType::Workflow);
            }
            other => panic!("expected kind mismatch, got {other:?}"),
        }

        match host.next().await {
            PolicyRequest::Release {
                kind,
                permit,
                reason: SlotReleaseReason::Error(_),
            } => {
                assert_eq!(kind, SlotKindType::Workflow);
                assert_eq!(permit, PERMIT);
            }
            other => panic!("expected error release, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_permit_id_is_rejected_and_returned() {
        let (supplier, mut host) = connect();
        let ctx = ctx();

        let (result, ()) = tokio::join!(supplier.reserve_slot(&ctx), async {
            let id = host.next_reserve().await;
            host.reply(serde_json::json!({
                "type": "reserved",
                "id": id,
                "kind": "activity",
                "permit": {"id": "slot-7"},
            }))
            .await;
        });

        assert!(matches!(
            result,
            Err(ReservationError::Validation(
                CrossBoundaryValidationError::MalformedPermit { ref id }
            )) if id == "slot-7"
        ));
        assert!(matches!(
            host.next().await,
            PolicyRequest::Release { ref permit, reason: SlotReleaseReason::Error(_), .. }
                if permit == "slot-7"
        ));
    }

    #[tokio::test]
    async fn undecodable_response_fails_its_reservation() {
        let (supplier, mut host) = connect();
        let ctx = ctx();

        let (result, ()) = tokio::join!(supplier.reserve_slot(&ctx), async {
            let id = host.next_reserve().await;
            host.reply(serde_json::json!({"type": "granted", "id": id}))
                .await;
        });

        assert!(matches!(
            result,
            Err(ReservationError::Validation(
                CrossBoundaryValidationError::UnexpectedResponse(_)
            ))
        ));
        assert!(!supplier.is_closed());
    }

    #[tokio::test]
    async fn policy_failure_is_reported() {
        let (supplier, mut host) = connect();
        let ctx = ctx();

        let (result, ()) = tokio::join!(supplier.reserve_slot(&ctx), async {
            let id = host.next_reserve().await;
            host.reply(serde_json::json!({"type": "failed", "id": id, "error": "quota"}))
                .await;
        });

        assert!(matches!(result, Err(ReservationError::Policy(ref e)) if e == "quota"));
    }

    #[tokio::test]
    async fn abandoned_reservation_is_cancelled_and_late_grant_released() {
        let (supplier, mut host) = connect();
        let ctx = ctx();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), supplier.reserve_slot(&ctx)).await;
        assert!(timed_out.is_err());
        assert_eq!(supplier.pending_reservations(), 0);

        let id = host.next_reserve().await;
        assert_eq!(host.next().await, PolicyRequest::CancelReserve { id });

        host.reply(serde_json::json!({
            "type": "reserved",
            "id": id,
            "kind": "activity",
            "permit": {"id": PERMIT},
        }))
        .await;

        assert_eq!(
            host.next().await,
            PolicyRequest::Release {
                kind: SlotKindType::Activity,
                permit: PERMIT.to_string(),
                reason: SlotReleaseReason::NeverUsed,
            }
        );
    }

    #[tokio::test]
    async fn transport_loss_fails_waiters() {
        let (supplier, mut host) = connect();
        let ctx = ctx();

        let (result, ()) = tokio::join!(supplier.reserve_slot(&ctx), async move {
            host.next_reserve().await;
            drop(host);
        });

        assert!(matches!(result, Err(ReservationError::Closed)));
        assert!(supplier.is_closed());
        assert!(matches!(
            supplier.reserve_slot(&ctx).await,
            Err(ReservationError::Closed)
        ));
        assert!(matches!(
            supplier.try_reserve_slot(&ctx),
            Err(ReservationError::Closed)
        ));
    }
}
