//! Worker configuration types.
//!
//! `WorkerConfig` represents `taskloom.toml`, the file a worker process reads
//! at startup. All fields have defaults so an empty file is valid.

use serde::{Deserialize, Serialize};

use crate::workflow::Priority;

/// Configuration for one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name reported to the engine.
    #[serde(default = "default_name")]
    pub name: String,

    /// Maximum task assignments executed concurrently.
    #[serde(default = "default_slots")]
    pub slots: usize,

    /// Optional namespace prefixed to workflow names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Priority used when neither run, task nor workflow declares one.
    #[serde(default)]
    pub default_priority: Priority,

    /// Seconds to wait for in-flight assignments on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Export spans through OpenTelemetry.
    #[serde(default)]
    pub otel: bool,
}

fn default_name() -> String {
    "taskloom-worker".to_string()
}

fn default_slots() -> usize {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            slots: default_slots(),
            namespace: None,
            default_priority: Priority::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            otel: false,
        }
    }
}

impl WorkerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Apply the namespace prefix, if any.
    pub fn namespaced(&self, name: &str) -> String {
        match &self.namespace {
            Some(ns) if !ns.is_empty() && !name.starts_with(ns.as_str()) => format!("{ns}{name}"),
            _ => name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.name, "taskloom-worker");
        assert_eq!(config.slots, 10);
        assert_eq!(config.default_priority, Priority::Low);
        assert!(!config.otel);
    }

    #[test]
    fn test_worker_config_empty_toml_uses_defaults() {
        let config: WorkerConfig = toml::from_str("").unwrap();
        assert_eq!(config, WorkerConfig::default());
    }

    #[test]
    fn test_worker_config_with_values() {
        let toml_str = r#"
name = "billing"
slots = 4
namespace = "prod-"
default_priority = "MEDIUM"
shutdown_grace_secs = 5
otel = true
"#;
        let config: WorkerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.name, "billing");
        assert_eq!(config.slots, 4);
        assert_eq!(config.namespace.as_deref(), Some("prod-"));
        assert_eq!(config.default_priority, Priority::Medium);
        assert_eq!(config.shutdown_grace_secs, 5);
        assert!(config.otel);
    }

    #[test]
    fn test_namespaced_names() {
        let mut config = WorkerConfig::default();
        assert_eq!(config.namespaced("wf"), "wf");
        config.namespace = Some("prod-".into());
        assert_eq!(config.namespaced("wf"), "prod-wf");
        assert_eq!(config.namespaced("prod-wf"), "prod-wf");
    }
}
