//! Engine configuration, persisted as TOML.
//!
//! The hard ceilings here are what keep adversarial path queries bounded:
//! the validator rejects `max_hops` above `max_hops_ceiling`, and the matcher
//! stops enumerating after `max_path_instances` paths.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Largest `max_hops` a path query may request.
    #[serde(default = "default_max_hops_ceiling")]
    pub max_hops_ceiling: usize,
    /// Path instances enumerated per query before results are truncated.
    #[serde(default = "default_max_path_instances")]
    pub max_path_instances: usize,
    /// Longest regex literal accepted by the validator.
    #[serde(default = "default_max_regex_len")]
    pub max_regex_len: usize,
    /// Execute batch entries on the rayon pool.
    #[serde(default = "default_parallel_batch")]
    pub parallel_batch: bool,
    /// Limit applied when a query does not set one.
    #[serde(default)]
    pub default_limit: Option<usize>,
}

fn default_max_hops_ceiling() -> usize {
    10
}
fn default_max_path_instances() -> usize {
    10_000
}
fn default_max_regex_len() -> usize {
    200
}
fn default_parallel_batch() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_hops_ceiling: default_max_hops_ceiling(),
            max_path_instances: default_max_path_instances(),
            max_regex_len: default_max_regex_len(),
            parallel_batch: default_parallel_batch(),
            default_limit: None,
        }
    }
}

impl EngineConfig {
    /// The validator-facing subset of this config.
    pub fn limits(&self) -> QueryLimits {
        QueryLimits {
            max_hops_ceiling: self.max_hops_ceiling,
            max_regex_len: self.max_regex_len,
        }
    }

    /// Reject settings that would disable the traversal bounds.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_hops_ceiling == 0 {
            return Err(ConfigError::Invalid {
                message: "max_hops_ceiling must be > 0".into(),
            });
        }
        if self.max_path_instances == 0 {
            return Err(ConfigError::Invalid {
                message: "max_path_instances must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}

/// Bounds the validator enforces while parsing a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub max_hops_ceiling: usize,
    pub max_regex_len: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        EngineConfig::default().limits()
    }
}
