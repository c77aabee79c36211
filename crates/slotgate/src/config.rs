//! Tuner configuration.
//!
//! Loaded from JSON (every field optional), from `SLOTGATE_*` environment
//! variables, or built in code with the `with_*` methods. Durations are
//! milliseconds on the wire.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::supplier::ResourceBasedOptions;

pub const ENV_CONFIG_FILE: &str = "SLOTGATE_CONFIG";
pub const ENV_WORKFLOW_SLOTS: &str = "SLOTGATE_WORKFLOW_SLOTS";
pub const ENV_ACTIVITY_SLOTS: &str = "SLOTGATE_ACTIVITY_SLOTS";
pub const ENV_LOCAL_ACTIVITY_SLOTS: &str = "SLOTGATE_LOCAL_ACTIVITY_SLOTS";
pub const ENV_MAX_CACHED_WORKFLOWS: &str = "SLOTGATE_MAX_CACHED_WORKFLOWS";
pub const ENV_LEAK_THRESHOLD_MS: &str = "SLOTGATE_LEAK_THRESHOLD_MS";
pub const ENV_LEAK_CHECK_INTERVAL_MS: &str = "SLOTGATE_LEAK_CHECK_INTERVAL_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid value for {var}: {value:?}")]
    Parse { var: String, value: String },

    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which policy admits slots of one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotSupplierConfig {
    Fixed { slots: usize },
    /// Activity kinds only.
    ResourceBased(ResourceBasedOptions),
}

impl SlotSupplierConfig {
    pub fn fixed(slots: usize) -> Self {
        Self::Fixed { slots }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub workflow: SlotSupplierConfig,
    pub activity: SlotSupplierConfig,
    pub local_activity: SlotSupplierConfig,

    /// `None` for an unbounded workflow cache.
    pub max_cached_workflows: Option<usize>,

    /// How long a permit may stay outstanding before it is reported as leaked.
    #[serde(with = "duration_millis")]
    pub leak_threshold: Duration,

    #[serde(with = "duration_millis")]
    pub leak_check_interval: Duration,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            workflow: SlotSupplierConfig::fixed(100),
            activity: SlotSupplierConfig::fixed(100),
            local_activity: SlotSupplierConfig::fixed(100),
            max_cached_workflows: Some(1000),
            leak_threshold: Duration::from_secs(600),
            leak_check_interval: Duration::from_secs(60),
        }
    }
}

impl TunerConfig {
    pub fn with_workflow_slots(mut self, slots: usize) -> Self {
        self.workflow = SlotSupplierConfig::fixed(slots);
        self
    }

    pub fn with_activity_slots(mut self, slots: usize) -> Self {
        self.activity = SlotSupplierConfig::fixed(slots);
        self
    }

    pub fn with_local_activity_slots(mut self, slots: usize) -> Self {
        self.local_activity = SlotSupplierConfig::fixed(slots);
        self
    }

    pub fn with_activity_supplier(mut self, supplier: SlotSupplierConfig) -> Self {
        self.activity = supplier;
        self
    }

    pub fn with_local_activity_supplier(mut self, supplier: SlotSupplierConfig) -> Self {
        self.local_activity = supplier;
        self
    }

    pub fn with_max_cached_workflows(mut self, max: Option<usize>) -> Self {
        self.max_cached_workflows = max;
        self
    }

    pub fn with_leak_threshold(mut self, threshold: Duration) -> Self {
        self.leak_threshold = threshold;
        self
    }

    pub fn with_leak_check_interval(mut self, interval: Duration) -> Self {
        self.leak_check_interval = interval;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from `lookup`: a JSON file named by `SLOTGATE_CONFIG` (if set),
    /// then individual `SLOTGATE_*` overrides.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(ENV_CONFIG_FILE) {
            Some(path) => {
                let path = PathBuf::from(path);
                let json = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Io { path, source })?;
                serde_json::from_str(&json)?
            }
            None => Self::default(),
        };

        if let Some(slots) = parse_var(&lookup, ENV_WORKFLOW_SLOTS)? {
            config.workflow = SlotSupplierConfig::fixed(slots);
        }
        if let Some(slots) = parse_var(&lookup, ENV_ACTIVITY_SLOTS)? {
            config.activity = SlotSupplierConfig::fixed(slots);
        }
        if let Some(slots) = parse_var(&lookup, ENV_LOCAL_ACTIVITY_SLOTS)? {
            config.local_activity = SlotSupplierConfig::fixed(slots);
        }
        if let Some(value) = lookup(ENV_MAX_CACHED_WORKFLOWS) {
            config.max_cached_workflows = match value.trim().to_ascii_lowercase().as_str() {
                "" | "none" | "unbounded" => None,
                n => Some(n.parse().map_err(|_| ConfigError::Parse {
                    var: ENV_MAX_CACHED_WORKFLOWS.to_string(),
                    value: value.clone(),
                })?),
            };
        }
        if let Some(ms) = parse_var(&lookup, ENV_LEAK_THRESHOLD_MS)? {
            config.leak_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, ENV_LEAK_CHECK_INTERVAL_MS)? {
            config.leak_check_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.workflow, SlotSupplierConfig::ResourceBased(_)) {
            return Err(ConfigError::Invalid(
                "workflow slots cannot be resource based".to_string(),
            ));
        }
        validate_supplier("workflow", &self.workflow)?;
        validate_supplier("activity", &self.activity)?;
        validate_supplier("local_activity", &self.local_activity)?;

        if self.max_cached_workflows == Some(0) {
            return Err(ConfigError::Invalid(
                "max_cached_workflows must be at least 1 (omit it for an unbounded cache)"
                    .to_string(),
            ));
        }
        if self.leak_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "leak_check_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value.trim().parse().map(Some).map_err(|_| ConfigError::Parse {
        var: var.to_string(),
        value,
    })
}

fn validate_supplier(kind: &str, supplier: &SlotSupplierConfig) -> Result<(), ConfigError> {
    match supplier {
        SlotSupplierConfig::Fixed { slots: 0 } => Err(ConfigError::Invalid(format!(
            "{kind} slots must be at least 1"
        ))),
        SlotSupplierConfig::Fixed { .. } => Ok(()),
        SlotSupplierConfig::ResourceBased(opts) => {
            let in_range = |v: f64| v > 0.0 && v <= 1.0;
            if !in_range(opts.target_cpu) || !in_range(opts.target_memory) {
                return Err(ConfigError::Invalid(format!(
                    "{kind} resource targets must be in (0, 1]"
                )));
            }
            if opts.max_slots == 0 || opts.min_slots > opts.max_slots {
                return Err(ConfigError::Invalid(format!(
                    "{kind} slot range {}..={} is empty",
                    opts.min_slots, opts.max_slots
                )));
            }
            if opts.poll_interval.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{kind} poll_interval must be non-zero"
                )));
            }
            Ok(())
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| vars.get(k).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = TunerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.workflow, SlotSupplierConfig::fixed(100));
        assert_eq!(config.max_cached_workflows, Some(1000));
    }

    #[test]
    fn json_fields_are_optional() {
        let config = TunerConfig::from_json(
            r#"{
                "activity": {"type": "resource_based", "target_cpu": 0.7, "max_slots": 50},
                "max_cached_workflows": null,
                "leak_threshold": 1500
            }"#,
        )
        .unwrap();

        let SlotSupplierConfig::ResourceBased(opts) = &config.activity else {
            panic!("expected resource based activity supplier");
        };
        assert_eq!(opts.target_cpu, 0.7);
        assert_eq!(opts.max_slots, 50);
        assert_eq!(opts.min_slots, ResourceBasedOptions::default().min_slots);
        assert_eq!(config.max_cached_workflows, None);
        assert_eq!(config.leak_threshold, Duration::from_millis(1500));
        assert_eq!(config.local_activity, SlotSupplierConfig::fixed(100));
    }

    #[test]
    fn resource_based_workflow_is_rejected() {
        let err = TunerConfig::from_json(r#"{"workflow": {"type": "resource_based"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(TunerConfig::default().with_activity_slots(0).validate().is_err());
        assert!(
            TunerConfig::default()
                .with_max_cached_workflows(Some(0))
                .validate()
                .is_err()
        );
        assert!(
            TunerConfig::default()
                .with_leak_check_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn env_overrides_defaults() {
        let config = TunerConfig::from_lookup(lookup(&[
            (ENV_WORKFLOW_SLOTS, "8"),
            (ENV_ACTIVITY_SLOTS, " 16 "),
            (ENV_MAX_CACHED_WORKFLOWS, "unbounded"),
            (ENV_LEAK_THRESHOLD_MS, "2500"),
        ]))
        .unwrap();

        assert_eq!(config.workflow, SlotSupplierConfig::fixed(8));
        assert_eq!(config.activity, SlotSupplierConfig::fixed(16));
        assert_eq!(config.local_activity, SlotSupplierConfig::fixed(100));
        assert_eq!(config.max_cached_workflows, None);
        assert_eq!(config.leak_threshold, Duration::from_millis(2500));
    }

    #[test]
    fn env_parse_errors_name_the_variable() {
        let err = TunerConfig::from_lookup(lookup(&[(ENV_ACTIVITY_SLOTS, "lots")])).unwrap_err();
        match err {
            ConfigError::Parse { var, value } => {
                assert_eq!(var, ENV_ACTIVITY_SLOTS);
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_config_file_is_an_io_error() {
        let err = TunerConfig::from_lookup(lookup(&[(
            ENV_CONFIG_FILE,
            "/nonexistent/slotgate.json",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn durations_serialize_as_millis() {
        let json = serde_json::to_value(TunerConfig::default()).unwrap();
        assert_eq!(json["leak_threshold"], 600_000);
        assert_eq!(json["workflow"]["type"], "fixed");
        assert_eq!(json["workflow"]["slots"], 100);
    }
}
