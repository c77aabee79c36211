//! Per-worker record of every outstanding permit.
//!
//! The ledger is the enforcement point for exactly-once release. Any
//! inconsistency it sees means a supplier handed out a permit it should not
//! have, or a permit was settled twice. Either way the admission invariants can
//! no longer be trusted, so the first such error is latched and the worker
//! reports itself defunct.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::PermitId;
use crate::kind::SlotKindType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitState {
    Reserved,
    Used,
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    kind: SlotKindType,
    state: PermitState,
    issued_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermitMisuseError {
    #[error("permit {permit} issued while already outstanding")]
    DuplicateIssue { permit: PermitId },

    #[error("permit {permit} is not outstanding (released twice or never issued)")]
    UnknownPermit { permit: PermitId },

    #[error("{actual} permit {permit} settled as a {expected} permit")]
    WrongKind {
        permit: PermitId,
        expected: SlotKindType,
        actual: SlotKindType,
    },

    #[error("permit {permit} marked used twice")]
    DoubleMarkUsed { permit: PermitId },

    #[error("{kind} permit {permit} outstanding for {held:?} without release")]
    Leaked {
        permit: PermitId,
        kind: SlotKindType,
        held: Duration,
    },
}

impl PermitMisuseError {
    pub fn permit(&self) -> PermitId {
        match self {
            Self::DuplicateIssue { permit }
            | Self::UnknownPermit { permit }
            | Self::WrongKind { permit, .. }
            | Self::DoubleMarkUsed { permit }
            | Self::Leaked { permit, .. } => *permit,
        }
    }
}

#[derive(Default)]
pub struct PermitLedger {
    entries: DashMap<PermitId, LedgerEntry>,
    fatal: OnceLock<PermitMisuseError>,
}

impl PermitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, permit: PermitId, kind: SlotKindType) -> Result<(), PermitMisuseError> {
        match self.entries.entry(permit) {
            Entry::Occupied(_) => Err(PermitMisuseError::DuplicateIssue { permit }),
            Entry::Vacant(slot) => {
                slot.insert(LedgerEntry {
                    kind,
                    state: PermitState::Reserved,
                    issued_at: Instant::now(),
                });
                Ok(())
            }
        }
    }

    pub fn mark_used(&self, permit: PermitId, kind: SlotKindType) -> Result<(), PermitMisuseError> {
        let mut entry = self
            .entries
            .get_mut(&permit)
            .ok_or(PermitMisuseError::UnknownPermit { permit })?;
        if entry.kind != kind {
            return Err(PermitMisuseError::WrongKind {
                permit,
                expected: kind,
                actual: entry.kind,
            });
        }
        if entry.state == PermitState::Used {
            return Err(PermitMisuseError::DoubleMarkUsed { permit });
        }
        entry.state = PermitState::Used;
        Ok(())
    }

    /// Remove the permit, returning the state it was released from.
    pub fn release(
        &self,
        permit: PermitId,
        kind: SlotKindType,
    ) -> Result<PermitState, PermitMisuseError> {
        let entry = self
            .entries
            .get(&permit)
            .map(|e| *e)
            .ok_or(PermitMisuseError::UnknownPermit { permit })?;
        if entry.kind != kind {
            return Err(PermitMisuseError::WrongKind {
                permit,
                expected: kind,
                actual: entry.kind,
            });
        }
        self.entries.remove(&permit);
        Ok(entry.state)
    }

    pub fn state(&self, permit: PermitId) -> Option<PermitState> {
        self.entries.get(&permit).map(|e| e.state)
    }

    pub fn outstanding(&self, kind: SlotKindType) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    pub fn in_use(&self, kind: SlotKindType) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == kind && e.state == PermitState::Used)
            .count()
    }

    /// Permits outstanding for longer than `threshold`.
    pub fn leaks(&self, threshold: Duration) -> Vec<PermitMisuseError> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter_map(|e| {
                let held = now.saturating_duration_since(e.issued_at);
                (held > threshold).then(|| PermitMisuseError::Leaked {
                    permit: *e.key(),
                    kind: e.kind,
                    held,
                })
            })
            .collect()
    }

    /// Log a misuse and latch it as the worker's fatal condition.
    pub fn report(&self, error: PermitMisuseError) {
        tracing::error!(permit = %error.permit(), error = %error, "Permit misuse detected");
        if self.fatal.set(error).is_ok() {
            tracing::error!("Worker is defunct: admission invariants can no longer be guaranteed");
        }
    }

    pub fn fatal(&self) -> Option<&PermitMisuseError> {
        self.fatal.get()
    }
}
