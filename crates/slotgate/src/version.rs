//! Version information for slotgate.

/// Slotgate version from Cargo.toml
pub const SLOTGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the control surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub slotgate: &'static str,
    /// Version of the embedding worker (if it reports one).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            slotgate: SLOTGATE_VERSION,
            worker: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, version: impl Into<String>) -> Self {
        self.worker = Some(version.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.slotgate, SLOTGATE_VERSION);
        assert!(info.worker.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            slotgate: "0.1.0",
            worker: None,
        };
        insta::assert_json_snapshot!("version_minimal", info);
    }

    #[test]
    fn version_info_serializes_full() {
        let info = VersionInfo::new().with_worker("2.4.1");
        let info = VersionInfo {
            slotgate: "0.1.0",
            ..info
        };
        insta::assert_json_snapshot!("version_full", info);
    }
}
