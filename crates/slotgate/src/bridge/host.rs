//! Policy side of the bridge: serve a local [`SlotSupplier`] to a remote worker.

use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::JsonCodec;
use super::protocol::{PolicyRequest, PolicyResponse, ReservationId, WirePermit};
use crate::kind::{SlotKind, SlotKindType};
use crate::permit::SlotSupplierPermit;
use crate::supplier::{SlotReleaseReason, SlotReservationContext, SlotSupplier, UsedSlotsView};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("policy bridge I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("policy bridge closed")]
    Closed,
}

struct HostState<S: SlotSupplier> {
    supplier: Arc<S>,
    issued: DashMap<String, SlotSupplierPermit>,
    inflight: DashMap<ReservationId, CancellationToken>,
    out: mpsc::UnboundedSender<PolicyResponse>,
}

/// Answer policy requests from `reader` until EOF or `shutdown`.
///
/// Permits still held by the worker when the loop ends are released with an
/// `Error` reason so the local supplier gets its capacity back.
pub async fn serve_policy<S, R, W>(
    supplier: Arc<S>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> Result<(), BridgeError>
where
    S: SlotSupplier + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let kind = <S::SlotKind as SlotKind>::KIND;
    let (out, mut out_rx) = mpsc::unbounded_channel::<PolicyResponse>();
    let state = Arc::new(HostState {
        supplier,
        issued: DashMap::new(),
        inflight: DashMap::new(),
        out,
    });

    let mut writer_task = tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, JsonCodec::<PolicyResponse>::new());
        while let Some(resp) = out_rx.recv().await {
            sink.send(resp).await?;
        }
        Ok::<_, io::Error>(())
    });

    tracing::info!(%kind, "Serving slot policy");
    let mut frames = FramedRead::new(reader, JsonCodec::<PolicyRequest>::new());

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            written = &mut writer_task => {
                break match written {
                    Ok(Err(e)) => Err(BridgeError::Io(e)),
                    _ => Err(BridgeError::Closed),
                };
            }
            frame = frames.next() => match frame {
                Some(Ok(req)) => handle_request(&state, req),
                Some(Err(e)) => break Err(BridgeError::Io(e)),
                None => break Ok(()),
            },
        }
    };

    for entry in state.inflight.iter() {
        entry.value().cancel();
    }
    let leftover: Vec<String> = state.issued.iter().map(|e| e.key().clone()).collect();
    for key in leftover {
        if let Some((_, permit)) = state.issued.remove(&key) {
            state
                .supplier
                .release_slot(permit, &SlotReleaseReason::error("policy bridge closed"));
        }
    }
    writer_task.abort();
    tracing::info!(%kind, ok = result.is_ok(), "Slot policy bridge stopped");
    result
}

fn handle_request<S: SlotSupplier + 'static>(state: &Arc<HostState<S>>, req: PolicyRequest) {
    let kind = <S::SlotKind as SlotKind>::KIND;
    match req {
        PolicyRequest::Reserve {
            id,
            kind: requested,
            task_queue,
            is_sticky,
            used_slots,
        } => {
            if requested != kind {
                tracing::warn!(reservation = id, %requested, served = %kind, "Wrong-kind reservation");
                let _ = state.out.send(PolicyResponse::Failed {
                    id,
                    error: format!("this policy serves {kind} slots, not {requested}"),
                });
                return;
            }
            let infos = match used_slots
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<<S::SlotKind as SlotKind>::Info>, _>>()
            {
                Ok(infos) => infos,
                Err(e) => {
                    let _ = state.out.send(PolicyResponse::Failed {
                        id,
                        error: format!("invalid used slot info: {e}"),
                    });
                    return;
                }
            };
            let ctx = SlotReservationContext::new(task_queue, is_sticky, UsedSlotsView::new(infos));
            let token = CancellationToken::new();
            state.inflight.insert(id, token.clone());
            tokio::spawn(reserve(Arc::clone(state), id, ctx, token));
        }
        PolicyRequest::CancelReserve { id } => {
            if let Some((_, token)) = state.inflight.remove(&id) {
                tracing::debug!(reservation = id, "Reservation cancelled by worker");
                token.cancel();
            }
        }
        PolicyRequest::MarkUsed {
            kind: requested,
            permit,
            info,
        } => {
            if !kind_matches(kind, requested, &permit) {
                return;
            }
            let info = match serde_json::from_value(info) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(%permit, error = %e, "Invalid slot info in mark_used");
                    return;
                }
            };
            match state.issued.get(&permit) {
                Some(p) => state.supplier.mark_slot_used(p.value(), &info),
                None => tracing::warn!(%permit, "mark_used for unknown permit"),
            }
        }
        PolicyRequest::Release {
            kind: requested,
            permit,
            reason,
        } => {
            if !kind_matches(kind, requested, &permit) {
                return;
            }
            match state.issued.remove(&permit) {
                Some((_, p)) => state.supplier.release_slot(p, &reason),
                None => tracing::warn!(%permit, "release for unknown permit"),
            }
        }
    }
}

fn kind_matches(served: SlotKindType, requested: SlotKindType, permit: &str) -> bool {
    if served != requested {
        tracing::warn!(%permit, %requested, %served, "Ignoring wrong-kind permit request");
        return false;
    }
    true
}

async fn reserve<S: SlotSupplier + 'static>(
    state: Arc<HostState<S>>,
    id: ReservationId,
    ctx: SlotReservationContext<S::SlotKind>,
    token: CancellationToken,
) {
    let kind = <S::SlotKind as SlotKind>::KIND;
    let result = tokio::select! {
        _ = token.cancelled() => return,
        result = state.supplier.reserve_slot(&ctx) => result,
    };
    state.inflight.remove(&id);

    let resp = match result {
        Ok(permit) => {
            let key = permit.id().to_string();
            let wire = WirePermit {
                id: key.clone(),
                user_data: permit.user_data::<serde_json::Value>().cloned(),
            };
            state.issued.insert(key, permit);
            PolicyResponse::Reserved {
                id,
                kind,
                permit: wire,
            }
        }
        Err(e) => PolicyResponse::Failed {
            id,
            error: e.to_string(),
        },
    };

    if let Err(mpsc::error::SendError(PolicyResponse::Reserved { permit, .. })) =
        state.out.send(resp)
        && let Some((_, permit)) = state.issued.remove(&permit.id)
    {
        state.supplier.release_slot(permit, &SlotReleaseReason::NeverUsed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bridge::BridgedSlotSupplier;
    use crate::kind::{ActivitySlotInfo, ActivitySlotKind};
    use crate::supplier::FixedSizeSlotSupplier;

    struct Harness {
        local: Arc<FixedSizeSlotSupplier<ActivitySlotKind>>,
        remote: BridgedSlotSupplier<ActivitySlotKind>,
        shutdown: CancellationToken,
        host: tokio::task::JoinHandle<Result<(), BridgeError>>,
    }

    fn harness(slots: usize) -> Harness {
        let local = Arc::new(FixedSizeSlotSupplier::<ActivitySlotKind>::new(slots));
        let (worker_io, policy_io) = tokio::io::duplex(64 * 1024);
        let (wr, ww) = tokio::io::split(worker_io);
        let (pr, pw) = tokio::io::split(policy_io);
        let shutdown = CancellationToken::new();
        let host = tokio::spawn(serve_policy(Arc::clone(&local), pr, pw, shutdown.clone()));
        Harness {
            local,
            remote: BridgedSlotSupplier::connect(wr, ww),
            shutdown,
            host,
        }
    }

    fn ctx() -> SlotReservationContext<ActivitySlotKind> {
        SlotReservationContext::new("payments", false, UsedSlotsView::empty())
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn remote_reserve_and_release_round_trip() {
        let h = harness(1);

        let permit = h.remote.reserve_slot(&ctx()).await.unwrap();
        assert_eq!(h.local.available_slots(), Some(0));

        h.remote.mark_slot_used(
            &permit,
            &ActivitySlotInfo {
                activity_type: "charge".to_string(),
                task_queue: "payments".to_string(),
            },
        );
        h.remote
            .release_slot(permit, &SlotReleaseReason::TaskComplete);

        settle(|| h.local.available_slots() == Some(1)).await;
    }

    #[tokio::test]
    async fn remote_waiter_is_woken_by_release() {
        let h = harness(1);
        let first = h.remote.reserve_slot(&ctx()).await.unwrap();

        let ctx = ctx();
        let (second, ()) = tokio::join!(h.remote.reserve_slot(&ctx), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.remote.release_slot(first, &SlotReleaseReason::NeverUsed);
        });

        assert!(second.is_ok());
        assert_eq!(h.local.available_slots(), Some(0));
    }

    #[tokio::test]
    async fn cancelled_remote_reservation_frees_nothing_and_leaks_nothing() {
        let h = harness(1);
        let held = h.remote.reserve_slot(&ctx()).await.unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), h.remote.reserve_slot(&ctx())).await;
        assert!(timed_out.is_err());

        h.remote.release_slot(held, &SlotReleaseReason::NeverUsed);
        settle(|| h.local.available_slots() == Some(1)).await;
    }

    #[tokio::test]
    async fn worker_disconnect_returns_outstanding_permits() {
        let h = harness(2);
        let _a = h.remote.reserve_slot(&ctx()).await.unwrap();
        let _b = h.remote.reserve_slot(&ctx()).await.unwrap();
        assert_eq!(h.local.available_slots(), Some(0));

        drop(h.remote);
        let result = h.host.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(h.local.available_slots(), Some(2));
    }

    #[tokio::test]
    async fn shutdown_stops_the_host() {
        let h = harness(1);
        h.shutdown.cancel();
        assert!(h.host.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wrong_kind_reservation_is_refused() {
        let local = Arc::new(FixedSizeSlotSupplier::<ActivitySlotKind>::new(1));
        let (worker_io, policy_io) = tokio::io::duplex(64 * 1024);
        let (wr, ww) = tokio::io::split(worker_io);
        let (pr, pw) = tokio::io::split(policy_io);
        tokio::spawn(serve_policy(
            Arc::clone(&local),
            pr,
            pw,
            CancellationToken::new(),
        ));

        let remote = BridgedSlotSupplier::<crate::kind::LocalActivitySlotKind>::connect(wr, ww);
        let ctx = SlotReservationContext::new("payments", false, UsedSlotsView::empty());
        let err = remote.reserve_slot(&ctx).await.unwrap_err();

        assert!(matches!(err, crate::supplier::ReservationError::Policy(_)));
        assert_eq!(local.available_slots(), Some(1));
    }
}
