//! Permits and their lifecycle.
//!
//! A permit moves through typestate guards so the compiler rules out invalid
//! transitions:
//! - `ReservedSlot` → `UsedSlot` via `mark_used()`
//! - either guard → released exactly once, explicitly or on drop
//!
//! The [`PermitLedger`] catches what the type system cannot: a supplier that
//! hands out the same id twice, or a permit settled against the wrong kind.

mod ledger;
mod slot;
mod token;

pub use ledger::{PermitLedger, PermitMisuseError, PermitState};
pub(crate) use slot::SlotTracker;
pub use slot::{ReservedSlot, UsedSlot};
pub use token::{PermitId, SlotSupplierPermit};
