//! Slot kinds and the per-kind info payloads handed to policy code.
//!
//! Each task kind gets a zero-sized marker type implementing [`SlotKind`]. The
//! associated `Info` type fixes which payload accompanies `mark_slot_used` and
//! the used-slots view, so a workflow supplier can never be handed activity info.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Runtime tag for a slot kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKindType {
    Workflow,
    Activity,
    LocalActivity,
}

impl SlotKindType {
    pub const ALL: [SlotKindType; 3] = [Self::Workflow, Self::Activity, Self::LocalActivity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Activity => "activity",
            Self::LocalActivity => "local_activity",
        }
    }
}

impl fmt::Display for SlotKindType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown slot kind: {0}")]
pub struct UnknownSlotKind(pub String);

impl FromStr for SlotKindType {
    type Err = UnknownSlotKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(Self::Workflow),
            "activity" => Ok(Self::Activity),
            "local_activity" | "local-activity" => Ok(Self::LocalActivity),
            other => Err(UnknownSlotKind(other.to_string())),
        }
    }
}

/// Type-level slot kind.
pub trait SlotKind: Send + Sync + 'static {
    type Info: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static;

    const KIND: SlotKindType;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowSlotKind;

#[derive(Debug, Clone, Copy, Default)]
pub struct ActivitySlotKind;

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalActivitySlotKind;

impl SlotKind for WorkflowSlotKind {
    type Info = WorkflowSlotInfo;
    const KIND: SlotKindType = SlotKindType::Workflow;
}

impl SlotKind for ActivitySlotKind {
    type Info = ActivitySlotInfo;
    const KIND: SlotKindType = SlotKindType::Activity;
}

impl SlotKind for LocalActivitySlotKind {
    type Info = LocalActivitySlotInfo;
    const KIND: SlotKindType = SlotKindType::LocalActivity;
}

/// Identifier of a workflow run, the key of the workflow cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSlotInfo {
    pub workflow_type: String,
    pub run_id: RunId,
    pub task_queue: String,
    /// Task was delivered on the worker's sticky queue.
    #[serde(default)]
    pub is_sticky: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySlotInfo {
    pub activity_type: String,
    pub task_queue: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalActivitySlotInfo {
    pub activity_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_from_path_segment() {
        assert_eq!(
            "workflow".parse::<SlotKindType>().unwrap(),
            SlotKindType::Workflow
        );
        assert_eq!(
            "local-activity".parse::<SlotKindType>().unwrap(),
            SlotKindType::LocalActivity
        );
        assert!("nexus".parse::<SlotKindType>().is_err());
    }

    #[test]
    fn kind_display_matches_serde() {
        for kind in SlotKindType::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn marker_types_carry_their_tag() {
        assert_eq!(WorkflowSlotKind::KIND, SlotKindType::Workflow);
        assert_eq!(ActivitySlotKind::KIND, SlotKindType::Activity);
        assert_eq!(LocalActivitySlotKind::KIND, SlotKindType::LocalActivity);
    }

    #[test]
    fn workflow_info_sticky_defaults_false() {
        let info: WorkflowSlotInfo = serde_json::from_value(serde_json::json!({
            "workflow_type": "order",
            "run_id": "run-1",
            "task_queue": "orders",
        }))
        .unwrap();
        assert!(!info.is_sticky);
        assert_eq!(info.run_id.as_str(), "run-1");
    }
}
