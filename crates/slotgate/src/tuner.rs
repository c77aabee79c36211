//! WorkerTuner: one worker's admission engine, assembled.
//!
//! Owns:
//! - One coordinator per slot kind, each behind a pause switch
//! - The workflow cache manager
//! - The permit ledger shared by all kinds
//!
//! Transports (the HTTP control surface, metrics readers) go through
//! [`WorkerTuner::snapshot`] and the pause/resume calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{BoundedCachePolicy, WorkflowCacheManager, WorkflowCachePolicy};
use crate::config::{ConfigError, SlotSupplierConfig, TunerConfig};
use crate::coordinator::{AdmissionCoordinator, WorkflowAdmissionCoordinator};
use crate::health::AdmissionHealth;
use crate::kind::{
    ActivitySlotKind, LocalActivitySlotKind, SlotKind, SlotKindType, WorkflowSlotKind,
};
use crate::permit::{PermitLedger, PermitMisuseError};
use crate::supplier::{
    FixedSizeSlotSupplier, PauseableSlotSupplier, ResourceBasedKind, ResourceBasedSlotSupplier,
    SlotSupplier,
};
use crate::version::VersionInfo;

type DynSupplier<K> = Arc<dyn SlotSupplier<SlotKind = K>>;
type Switch<K> = Arc<PauseableSlotSupplier<DynSupplier<K>>>;

/// Point-in-time view of admission state.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub taken_at: DateTime<Utc>,
    pub health: AdmissionHealth,
    pub kinds: Vec<KindSnapshot>,
    pub cache: CacheSnapshot,
}

impl AdmissionSnapshot {
    pub fn kind(&self, kind: SlotKindType) -> Option<&KindSnapshot> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindSnapshot {
    pub kind: SlotKindType,
    pub in_use: usize,
    pub reserved: usize,
    /// `None` when the policy cannot tell.
    pub available: Option<usize>,
    pub active_polls: usize,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSnapshot {
    pub cached: usize,
    pub max_cached: Option<usize>,
    pub buffered: usize,
}

pub struct WorkerTuner {
    ledger: Arc<PermitLedger>,
    workflow_switch: Switch<WorkflowSlotKind>,
    activity_switch: Switch<ActivitySlotKind>,
    local_activity_switch: Switch<LocalActivitySlotKind>,
    workflow: WorkflowAdmissionCoordinator,
    activity: AdmissionCoordinator<ActivitySlotKind>,
    local_activity: AdmissionCoordinator<LocalActivitySlotKind>,
    config: TunerConfig,
    version: VersionInfo,
}

impl WorkerTuner {
    pub fn builder() -> WorkerTunerBuilder {
        WorkerTunerBuilder::default()
    }

    pub fn from_config(config: TunerConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    pub fn workflow(&self) -> &WorkflowAdmissionCoordinator {
        &self.workflow
    }

    pub fn activity(&self) -> &AdmissionCoordinator<ActivitySlotKind> {
        &self.activity
    }

    pub fn local_activity(&self) -> &AdmissionCoordinator<LocalActivitySlotKind> {
        &self.local_activity
    }

    pub fn ledger(&self) -> &Arc<PermitLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    pub fn pause(&self, kind: SlotKindType) {
        match kind {
            SlotKindType::Workflow => self.workflow_switch.pause(),
            SlotKindType::Activity => self.activity_switch.pause(),
            SlotKindType::LocalActivity => self.local_activity_switch.pause(),
        }
    }

    pub fn resume(&self, kind: SlotKindType) {
        match kind {
            SlotKindType::Workflow => self.workflow_switch.resume(),
            SlotKindType::Activity => self.activity_switch.resume(),
            SlotKindType::LocalActivity => self.local_activity_switch.resume(),
        }
    }

    pub fn is_paused(&self, kind: SlotKindType) -> bool {
        match kind {
            SlotKindType::Workflow => self.workflow_switch.is_paused(),
            SlotKindType::Activity => self.activity_switch.is_paused(),
            SlotKindType::LocalActivity => self.local_activity_switch.is_paused(),
        }
    }

    pub fn health(&self) -> AdmissionHealth {
        if self.ledger.fatal().is_some() {
            AdmissionHealth::Defunct
        } else if SlotKindType::ALL.iter().any(|k| self.is_paused(*k)) {
            AdmissionHealth::Paused
        } else {
            AdmissionHealth::Running
        }
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let workflow = KindSnapshot {
            kind: SlotKindType::Workflow,
            in_use: self.workflow.in_use(),
            reserved: self.workflow.reserved(),
            available: self.workflow.cache().available_slots(),
            active_polls: self.workflow.active_polls(),
            paused: self.workflow_switch.is_paused(),
        };
        let cache = self.workflow.cache();
        AdmissionSnapshot {
            taken_at: Utc::now(),
            health: self.health(),
            kinds: vec![
                workflow,
                kind_snapshot(&self.activity, &self.activity_switch),
                kind_snapshot(&self.local_activity, &self.local_activity_switch),
            ],
            cache: CacheSnapshot {
                cached: cache.num_cached(),
                max_cached: cache.max_cached(),
                buffered: cache.buffered(),
            },
        }
    }

    /// Permits of any kind held for longer than `threshold`.
    pub fn check_leaks(&self, threshold: Duration) -> Vec<PermitMisuseError> {
        self.ledger.leaks(threshold)
    }

    /// Log suspected leaks every `interval` until `shutdown` fires.
    ///
    /// Leaks are warnings only; a slow task looks the same as a lost permit.
    pub fn spawn_leak_watchdog(
        self: &Arc<Self>,
        interval: Duration,
        threshold: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let tuner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for leak in tuner.check_leaks(threshold) {
                            if let PermitMisuseError::Leaked { permit, kind, held } = leak {
                                tracing::warn!(
                                    %permit,
                                    %kind,
                                    held_ms = held.as_millis() as u64,
                                    "Permit outstanding past leak threshold"
                                );
                            }
                        }
                    }
                }
            }
            tracing::debug!("Leak watchdog stopped");
        })
    }
}

fn kind_snapshot<K: SlotKind>(
    coordinator: &AdmissionCoordinator<K>,
    switch: &Switch<K>,
) -> KindSnapshot {
    KindSnapshot {
        kind: K::KIND,
        in_use: coordinator.in_use(),
        reserved: coordinator.reserved(),
        available: switch.available_slots(),
        active_polls: coordinator.active_polls(),
        paused: switch.is_paused(),
    }
}

/// Explicit suppliers win over the config; anything unset comes from `config`.
#[derive(Default)]
pub struct WorkerTunerBuilder {
    config: TunerConfig,
    workflow: Option<DynSupplier<WorkflowSlotKind>>,
    activity: Option<DynSupplier<ActivitySlotKind>>,
    local_activity: Option<DynSupplier<LocalActivitySlotKind>>,
    cache_policy: Option<Arc<dyn WorkflowCachePolicy>>,
    version: VersionInfo,
}

impl WorkerTunerBuilder {
    pub fn config(mut self, config: TunerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workflow_supplier(mut self, supplier: DynSupplier<WorkflowSlotKind>) -> Self {
        self.workflow = Some(supplier);
        self
    }

    pub fn activity_supplier(mut self, supplier: DynSupplier<ActivitySlotKind>) -> Self {
        self.activity = Some(supplier);
        self
    }

    pub fn local_activity_supplier(mut self, supplier: DynSupplier<LocalActivitySlotKind>) -> Self {
        self.local_activity = Some(supplier);
        self
    }

    pub fn cache_policy(mut self, policy: Arc<dyn WorkflowCachePolicy>) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    pub fn version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn build(self) -> Result<WorkerTuner, ConfigError> {
        self.config.validate()?;

        let workflow = match self.workflow {
            Some(s) => s,
            None => fixed_from(&self.config.workflow, SlotKindType::Workflow)?,
        };
        let activity = match self.activity {
            Some(s) => s,
            None => supplier_from::<ActivitySlotKind>(&self.config.activity),
        };
        let local_activity = match self.local_activity {
            Some(s) => s,
            None => supplier_from::<LocalActivitySlotKind>(&self.config.local_activity),
        };
        let policy = self.cache_policy.unwrap_or_else(|| {
            Arc::new(BoundedCachePolicy::new(self.config.max_cached_workflows))
        });

        let ledger = Arc::new(PermitLedger::new());
        let workflow_switch = Arc::new(PauseableSlotSupplier::new(workflow));
        let activity_switch = Arc::new(PauseableSlotSupplier::new(activity));
        let local_activity_switch = Arc::new(PauseableSlotSupplier::new(local_activity));

        let cache = Arc::new(WorkflowCacheManager::new(
            workflow_switch.clone() as DynSupplier<WorkflowSlotKind>,
            policy,
        ));

        tracing::info!(
            max_cached_workflows = ?cache.max_cached(),
            "Worker tuner ready"
        );

        Ok(WorkerTuner {
            workflow: WorkflowAdmissionCoordinator::new(cache, Arc::clone(&ledger)),
            activity: AdmissionCoordinator::new(
                activity_switch.clone() as DynSupplier<ActivitySlotKind>,
                Arc::clone(&ledger),
            ),
            local_activity: AdmissionCoordinator::new(
                local_activity_switch.clone() as DynSupplier<LocalActivitySlotKind>,
                Arc::clone(&ledger),
            ),
            ledger,
            workflow_switch,
            activity_switch,
            local_activity_switch,
            config: self.config,
            version: self.version,
        })
    }
}

fn fixed_from<K: SlotKind>(
    config: &SlotSupplierConfig,
    kind: SlotKindType,
) -> Result<DynSupplier<K>, ConfigError> {
    match config {
        SlotSupplierConfig::Fixed { slots } => Ok(Arc::new(FixedSizeSlotSupplier::<K>::new(*slots))),
        SlotSupplierConfig::ResourceBased(_) => Err(ConfigError::Invalid(format!(
            "{kind} slots cannot be resource based"
        ))),
    }
}

fn supplier_from<K: ResourceBasedKind>(config: &SlotSupplierConfig) -> DynSupplier<K> {
    match config {
        SlotSupplierConfig::Fixed { slots } => Arc::new(FixedSizeSlotSupplier::<K>::new(*slots)),
        SlotSupplierConfig::ResourceBased(options) => {
            Arc::new(ResourceBasedSlotSupplier::<K>::new(options.clone()))
        }
    }
}
