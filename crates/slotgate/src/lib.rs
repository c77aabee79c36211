//! slotgate: slot admission control and workflow cache coordination for task workers.

mod health;
mod version;

pub mod bridge;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod kind;
pub mod permit;
pub mod supplier;
pub mod telemetry;
pub mod transport;
pub mod tuner;

pub use cache::{
    BoundedCachePolicy, CacheAdmission, CacheLease, CachedWorkflowEntry, EvictedWorkflow,
    EvictionReason, WorkflowCacheManager, WorkflowCachePolicy, WorkflowSlotsInfo,
};
pub use config::{ConfigError, SlotSupplierConfig, TunerConfig};
pub use coordinator::{
    AdmissionCoordinator, AdmissionError, AdmissionOutcome, AdmissionTask, DispatchError,
    PollOutcome, TaskDispatcher, TaskPoller, WorkflowAdmissionCoordinator,
};
pub use health::AdmissionHealth;
pub use kind::{
    ActivitySlotInfo, ActivitySlotKind, LocalActivitySlotInfo, LocalActivitySlotKind, RunId,
    SlotKind, SlotKindType, WorkflowSlotInfo, WorkflowSlotKind,
};
pub use permit::{
    PermitId, PermitLedger, PermitMisuseError, ReservedSlot, SlotSupplierPermit, UsedSlot,
};
pub use supplier::{
    FixedSizeSlotSupplier, PauseableSlotSupplier, ReservationError, ResourceBasedOptions,
    ResourceBasedSlotSupplier, SlotReleaseReason, SlotReservationContext, SlotSupplier,
    UsedSlotsView,
};
pub use tuner::{AdmissionSnapshot, CacheSnapshot, KindSnapshot, WorkerTuner, WorkerTunerBuilder};
pub use version::{SLOTGATE_VERSION, VersionInfo};
