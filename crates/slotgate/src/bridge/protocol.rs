//! Wire protocol between a worker and a slot policy hosted elsewhere.
//!
//! The worker sends [`PolicyRequest`]s and the host answers reservations with
//! [`PolicyResponse`]s. Mark-used and release are fire-and-forget.
//!
//! Permit ids travel as strings: the host owns them, and the worker checks that
//! what comes back is a UUID before trusting it.

use serde::{Deserialize, Serialize};

use crate::kind::SlotKindType;
use crate::supplier::SlotReleaseReason;

/// Correlates a `reserve` with its answer. Unique per connection.
pub type ReservationId = u64;

/// Worker → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyRequest {
    Reserve {
        id: ReservationId,
        kind: SlotKindType,
        task_queue: String,
        #[serde(default)]
        is_sticky: bool,
        /// Info of every used slot of `kind`, as of the request.
        #[serde(default)]
        used_slots: Vec<serde_json::Value>,
    },

    /// The worker gave up on reservation `id`.
    CancelReserve { id: ReservationId },

    MarkUsed {
        kind: SlotKindType,
        permit: String,
        info: serde_json::Value,
    },

    Release {
        kind: SlotKindType,
        permit: String,
        reason: SlotReleaseReason,
    },
}

/// Host → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyResponse {
    Reserved {
        id: ReservationId,
        kind: SlotKindType,
        permit: WirePermit,
    },

    Failed { id: ReservationId, error: String },
}

impl PolicyResponse {
    pub fn id(&self) -> ReservationId {
        match self {
            Self::Reserved { id, .. } | Self::Failed { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePermit {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

/// A policy answer that does not hold up on the worker side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CrossBoundaryValidationError {
    #[error("policy granted a {actual} slot, expected {expected}")]
    KindMismatch {
        expected: SlotKindType,
        actual: SlotKindType,
    },

    #[error("policy returned malformed permit id {id:?}")]
    MalformedPermit { id: String },

    #[error("unexpected policy response: {0}")]
    UnexpectedResponse(String),
}
