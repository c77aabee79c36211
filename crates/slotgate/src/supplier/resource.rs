//! Resource-based policy: grant while sampled CPU and memory stay under target.
//!
//! Only activity kinds may use it. A workflow slot pins a cache entry for the
//! life of the run, so letting host load decide how many of them exist would
//! make the cache bound meaningless.
//!
//! Host usage is sampled on a background task every `poll_interval` and kept in
//! a [`UsageGauge`]. Grant decisions only read the gauge, so `try_reserve_slot`
//! never waits on a sysinfo refresh.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ReservationError, SlotReleaseReason, SlotReservationContext, SlotSupplier};
use crate::config::duration_millis;
use crate::kind::{ActivitySlotKind, LocalActivitySlotKind, SlotKind};
use crate::permit::SlotSupplierPermit;

/// Kinds that may be admitted by host resource usage.
pub trait ResourceBasedKind: SlotKind {}

impl ResourceBasedKind for ActivitySlotKind {}
impl ResourceBasedKind for LocalActivitySlotKind {}

/// Host usage as fractions in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Samples the whole host through `sysinfo`.
pub struct SystemResourceSampler {
    system: Mutex<System>,
}

impl SystemResourceSampler {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        // First CPU reading is always zero; prime it so the next sample has a baseline.
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemResourceSampler {
    fn sample(&self) -> ResourceUsage {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64
        };
        ResourceUsage {
            cpu: f64::from(system.global_cpu_usage()) / 100.0,
            memory,
        }
    }
}

/// Latest host usage, written by the sampling task and read by grants.
struct UsageGauge {
    sampler: Arc<dyn ResourceSampler>,
    cpu: AtomicU64,
    memory: AtomicU64,
    sampling: AtomicBool,
}

impl UsageGauge {
    fn new(sampler: Arc<dyn ResourceSampler>) -> Self {
        let gauge = Self {
            sampler,
            cpu: AtomicU64::new(0),
            memory: AtomicU64::new(0),
            sampling: AtomicBool::new(false),
        };
        gauge.store(gauge.sampler.sample());
        gauge
    }

    fn store(&self, usage: ResourceUsage) {
        self.cpu.store(usage.cpu.to_bits(), Ordering::Release);
        self.memory.store(usage.memory.to_bits(), Ordering::Release);
    }

    fn load(&self) -> ResourceUsage {
        ResourceUsage {
            cpu: f64::from_bits(self.cpu.load(Ordering::Acquire)),
            memory: f64::from_bits(self.memory.load(Ordering::Acquire)),
        }
    }

    /// Start the sampling task once, if a runtime is available.
    fn ensure_sampling(self: &Arc<Self>, interval: Duration) {
        if self.sampling.load(Ordering::Acquire) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.sampling.swap(true, Ordering::AcqRel) {
            return;
        }
        handle.spawn(sample_loop(Arc::downgrade(self), interval));
    }
}

/// Refresh the gauge until its supplier is dropped.
async fn sample_loop(gauge: Weak<UsageGauge>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(sampler) = gauge.upgrade().map(|g| Arc::clone(&g.sampler)) else {
            return;
        };
        let usage = match tokio::task::spawn_blocking(move || sampler.sample()).await {
            Ok(usage) => usage,
            Err(e) => {
                tracing::debug!(error = %e, "Resource sampling stopped");
                return;
            }
        };
        match gauge.upgrade() {
            Some(gauge) => gauge.store(usage),
            None => return,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceBasedOptions {
    pub target_cpu: f64,
    pub target_memory: f64,
    /// Granted without sampling.
    pub min_slots: usize,
    pub max_slots: usize,
    /// Minimum spacing between grants above `min_slots`.
    #[serde(with = "duration_millis")]
    pub ramp_throttle: Duration,
    /// How often host usage is sampled and a blocked reservation retries.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for ResourceBasedOptions {
    fn default() -> Self {
        Self {
            target_cpu: 0.9,
            target_memory: 0.8,
            min_slots: 1,
            max_slots: 500,
            ramp_throttle: Duration::from_millis(50),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Default)]
struct GrantState {
    issued: usize,
    last_grant: Option<Instant>,
}

pub struct ResourceBasedSlotSupplier<K> {
    options: ResourceBasedOptions,
    gauge: Arc<UsageGauge>,
    state: Mutex<GrantState>,
    released: Notify,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ResourceBasedKind> ResourceBasedSlotSupplier<K> {
    pub fn new(options: ResourceBasedOptions) -> Self {
        Self::with_sampler(options, Arc::new(SystemResourceSampler::new()))
    }

    pub fn with_sampler(options: ResourceBasedOptions, sampler: Arc<dyn ResourceSampler>) -> Self {
        Self {
            options,
            gauge: Arc::new(UsageGauge::new(sampler)),
            state: Mutex::new(GrantState::default()),
            released: Notify::new(),
            _kind: PhantomData,
        }
    }

    pub fn options(&self) -> &ResourceBasedOptions {
        &self.options
    }

    pub fn issued(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .issued
    }

    fn try_grant(&self) -> Option<SlotSupplierPermit> {
        self.gauge.ensure_sampling(self.options.poll_interval);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.issued >= self.options.max_slots {
            return None;
        }
        if state.issued >= self.options.min_slots {
            if let Some(last) = state.last_grant
                && last.elapsed() < self.options.ramp_throttle
            {
                return None;
            }
            let usage = self.gauge.load();
            if usage.cpu >= self.options.target_cpu || usage.memory >= self.options.target_memory {
                tracing::trace!(
                    kind = %K::KIND,
                    cpu = usage.cpu,
                    memory = usage.memory,
                    "Resource targets reached, holding reservations"
                );
                return None;
            }
        }
        state.issued += 1;
        state.last_grant = Some(Instant::now());
        Some(SlotSupplierPermit::new())
    }
}

#[async_trait]
impl<K: ResourceBasedKind> SlotSupplier for ResourceBasedSlotSupplier<K> {
    type SlotKind = K;

    async fn reserve_slot(
        &self,
        _ctx: &SlotReservationContext<K>,
    ) -> Result<SlotSupplierPermit, ReservationError> {
        loop {
            let released = self.released.notified();
            if let Some(permit) = self.try_grant() {
                return Ok(permit);
            }
            tokio::select! {
                _ = released => {}
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }

    fn try_reserve_slot(
        &self,
        _ctx: &SlotReservationContext<K>,
    ) -> Result<Option<SlotSupplierPermit>, ReservationError> {
        Ok(self.try_grant())
    }

    fn mark_slot_used(&self, _permit: &SlotSupplierPermit, _info: &K::Info) {}

    fn release_slot(&self, permit: SlotSupplierPermit, reason: &SlotReleaseReason) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(issued) = state.issued.checked_sub(1) else {
                tracing::error!(
                    kind = %K::KIND,
                    permit = %permit.id(),
                    %reason,
                    "Release refused: more permits released than were issued"
                );
                return;
            };
            state.issued = issued;
        }
        self.released.notify_one();
    }
}
