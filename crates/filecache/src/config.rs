//! Repair configuration loaded from a JSON file.
//!
//! Keys are camelCase (`deleteOrphans`); snake_case (`delete_orphans`) is
//! accepted on read. Missing keys take their defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checker::CheckOptions;
use crate::store::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairConfig {
    /// Mount groups with more rows than this are collapsed to one.
    #[serde(alias = "mount_dedup_threshold", default = "default_dedup_threshold")]
    pub mount_dedup_threshold: usize,
    #[serde(alias = "delete_orphans", default)]
    pub delete_orphans: bool,
    /// Skip one-time steps that already left a completion marker.
    #[serde(alias = "skip_completed_steps", default = "default_skip_completed")]
    pub skip_completed_steps: bool,
    #[serde(alias = "max_depth", default)]
    pub max_depth: Option<usize>,
}

fn default_dedup_threshold() -> usize {
    1
}

fn default_skip_completed() -> bool {
    true
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            mount_dedup_threshold: default_dedup_threshold(),
            delete_orphans: false,
            skip_completed_steps: default_skip_completed(),
            max_depth: None,
        }
    }
}

impl RepairConfig {
    /// Load from `path`. Returns defaults if the file doesn't exist or can't be parsed.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                log::debug!("Repair config: {} not readable ({e}), using defaults", path.display());
                return Self::default();
            }
        };
        match Self::from_json_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Repair config: {e}, using defaults");
                Self::default()
            }
        }
    }

    /// Strict parse; malformed JSON or wrongly typed values are an error.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn check_options(&self) -> CheckOptions {
        CheckOptions {
            delete_orphans: self.delete_orphans,
            max_depth: self.max_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CacheError;

    #[test]
    fn empty_object_gives_defaults() {
        assert_eq!(RepairConfig::from_json_str("{}").unwrap(), RepairConfig::default());
    }

    #[test]
    fn camel_and_snake_case_keys() {
        let camel = RepairConfig::from_json_str(r#"{"mountDedupThreshold": 2, "deleteOrphans": true}"#).unwrap();
        assert_eq!(camel.mount_dedup_threshold, 2);
        assert!(camel.delete_orphans);
        assert!(camel.skip_completed_steps);

        let snake = RepairConfig::from_json_str(r#"{"skip_completed_steps": false, "max_depth": 64}"#).unwrap();
        assert!(!snake.skip_completed_steps);
        assert_eq!(snake.max_depth, Some(64));
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let config = RepairConfig {
            delete_orphans: true,
            max_depth: Some(8),
            ..Default::default()
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "mountDedupThreshold": 1,
                "deleteOrphans": true,
                "skipCompletedSteps": true,
                "maxDepth": 8,
            })
        );

        let written = serde_json::to_string(&config).unwrap();
        assert_eq!(RepairConfig::from_json_str(&written).unwrap(), config);
    }

    #[test]
    fn strict_parse_rejects_bad_types() {
        let err = RepairConfig::from_json_str(r#"{"deleteOrphans": "yes"}"#).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.json");
        assert_eq!(RepairConfig::load(&missing), RepairConfig::default());

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        assert_eq!(RepairConfig::load(&broken), RepairConfig::default());

        let good = dir.path().join("repair.json");
        fs::write(&good, r#"{"deleteOrphans": true}"#).unwrap();
        assert!(RepairConfig::load(&good).delete_orphans);
    }

    #[test]
    fn check_options_follow_config() {
        let config = RepairConfig {
            delete_orphans: true,
            max_depth: Some(10),
            ..Default::default()
        };
        let options = config.check_options();
        assert!(options.delete_orphans);
        assert_eq!(options.max_depth, Some(10));
    }
}
