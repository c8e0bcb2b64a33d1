//! Engine Configuration
//!
//! Loaded from a YAML file; every field has a default so an empty file (or
//! no file at all) is a valid configuration.
//!
//! # Example
//!
//! ```yaml
//! max_attempts: 3
//! backend: local
//! max_running: 8
//! default_resources:
//!   memory_mb: 7600
//! resources:
//!   jterator:
//!     cpus: 2
//!     duration: "06:00:00"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::execution::backend::Resources;
use crate::execution::retry::RetryPolicy;

/// Which backend jobs are dispatched to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Child processes on this machine
    #[default]
    Local,
    /// Print invocations, run nothing
    DryRun,
    /// Slurm scheduler through `sbatch`
    Slurm,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Total submissions per job, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub backend: BackendKind,

    /// Concurrent processes of the local backend
    #[serde(default = "num_cpus::get")]
    pub max_running: usize,

    #[serde(default)]
    pub default_resources: Resources,

    /// Per-step overrides of `default_resources`
    #[serde(default)]
    pub resources: HashMap<String, Resources>,

    /// Write per-job descriptors before submission
    #[serde(default = "default_true")]
    pub write_descriptors: bool,

    /// Program the job arguments are passed to
    #[serde(default)]
    pub program: Option<String>,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            backend: BackendKind::default(),
            max_running: num_cpus::get(),
            default_resources: Resources::default(),
            resources: HashMap::new(),
            write_descriptors: true,
            program: None,
        }
    }
}

impl EngineConfig {
    /// Loads and checks a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Yaml { source, .. } => ConfigError::Yaml {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes as null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: EngineConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Yaml {
                path: String::new(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.max_running == 0 {
            return Err(ConfigError::Invalid("max_running must be at least 1".into()));
        }
        for (step, resources) in std::iter::once(("default", &self.default_resources))
            .chain(self.resources.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if resources.cpus == 0 || resources.memory_mb == 0 {
                return Err(ConfigError::Invalid(format!(
                    "resources of '{}' must be non-zero",
                    step
                )));
            }
        }
        Ok(())
    }

    /// Resources for a step, falling back to the defaults.
    pub fn resources_for(&self, step: &str) -> &Resources {
        self.resources.get(step).unwrap_or(&self.default_resources)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }
}
