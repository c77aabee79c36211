//! Health status of a worker's admission engine.

use serde::{Deserialize, Serialize};

/// Health of the admission engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionHealth {
    /// Admitting work for every kind
    #[default]
    Running,
    /// At least one kind is paused
    Paused,
    /// A permit misuse was detected; admission invariants no longer hold
    Defunct,
}

impl AdmissionHealth {
    pub fn is_defunct(&self) -> bool {
        matches!(self, Self::Defunct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_default_is_running() {
        assert_eq!(AdmissionHealth::default(), AdmissionHealth::Running);
    }

    #[test]
    fn health_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            "health_all_variants",
            [
                AdmissionHealth::Running,
                AdmissionHealth::Paused,
                AdmissionHealth::Defunct,
            ]
        );
    }

    #[test]
    fn health_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<AdmissionHealth>("\"DEFUNCT\"").unwrap(),
            AdmissionHealth::Defunct
        );
        assert!(serde_json::from_str::<AdmissionHealth>("\"defunct\"").is_err());
    }
}
