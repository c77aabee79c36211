//! Workflow cache coordination.
//!
//! Workflow tasks need their run's state resident in memory. The cache bounds
//! how many runs are resident, and [`WorkflowCacheManager`] ties that bound to
//! workflow slot admission: a workflow slot is only ever handed out when the
//! cache has room for the run it will serve.

mod manager;

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::kind::RunId;

pub use manager::{CacheAdmission, CacheLease, WorkflowCacheManager};

/// Lock-free view of workflow slot and cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSlotsInfo {
    pub used_slots: usize,
    pub num_cached_workflows: usize,
    pub max_cache_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEntryState {
    /// Resident, no task in flight. Evictable.
    Idle,
    /// A task for this run is being processed.
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedWorkflowEntry {
    pub run_id: RunId,
    pub state: CacheEntryState,
    pub last_touched: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "details", rename_all = "snake_case")]
pub enum EvictionReason {
    /// Made room for a run that was not yet cached.
    CacheFull,
    /// Asked for through `request_eviction`.
    Requested(String),
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheFull => f.write_str("cache full"),
            Self::Requested(reason) => write!(f, "requested: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictedWorkflow {
    pub run_id: RunId,
    #[serde(flatten)]
    pub reason: EvictionReason,
}

/// Decides how many workflows stay resident and which one goes first.
///
/// Callbacks run while the cache is locked. They may read
/// [`WorkflowCacheManager::slots_info`] but must never call back into the cache.
pub trait WorkflowCachePolicy: Send + Sync {
    /// Asked only for runs that are not cached yet.
    fn can_allow_additional_workflow(&self, slots: &WorkflowSlotsInfo) -> bool;

    /// Pick a victim from `evictable` (Idle entries, least recently touched
    /// first). `None` or an id not in the list means LRU.
    fn eviction_hint(&self, _evictable: &[CachedWorkflowEntry]) -> Option<RunId> {
        None
    }

    fn evicted_workflow(&self, _evicted: &EvictedWorkflow) {}

    fn max_cached_workflows(&self) -> Option<usize>;
}

/// Admit while the cache is under its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedCachePolicy {
    max_cached: Option<usize>,
}

impl BoundedCachePolicy {
    pub fn new(max_cached: Option<usize>) -> Self {
        Self { max_cached }
    }

    pub fn unbounded() -> Self {
        Self { max_cached: None }
    }
}

impl WorkflowCachePolicy for BoundedCachePolicy {
    fn can_allow_additional_workflow(&self, slots: &WorkflowSlotsInfo) -> bool {
        match self.max_cached {
            Some(max) => slots.num_cached_workflows < max,
            None => true,
        }
    }

    fn max_cached_workflows(&self) -> Option<usize> {
        self.max_cached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_policy_allows_below_max() {
        let policy = BoundedCachePolicy::new(Some(2));
        let mut slots = WorkflowSlotsInfo {
            used_slots: 0,
            num_cached_workflows: 1,
            max_cache_size: Some(2),
        };
        assert!(policy.can_allow_additional_workflow(&slots));
        slots.num_cached_workflows = 2;
        assert!(!policy.can_allow_additional_workflow(&slots));

        slots.num_cached_workflows = 10_000;
        assert!(BoundedCachePolicy::unbounded().can_allow_additional_workflow(&slots));
    }

    #[test]
    fn evicted_workflow_wire_format() {
        insta::assert_json_snapshot!(
            "evicted_workflows",
            vec![
                EvictedWorkflow {
                    run_id: RunId::from("run-a"),
                    reason: EvictionReason::CacheFull,
                },
                EvictedWorkflow {
                    run_id: RunId::from("run-b"),
                    reason: EvictionReason::Requested("run completed".into()),
                },
            ]
        );
    }
}
