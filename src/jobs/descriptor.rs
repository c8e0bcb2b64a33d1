//! Per-job descriptors
//!
//! Before a job is handed to the backend its descriptor is written to
//! `<root>/<step>/<job name>.json`. The worker process the backend launches
//! reads it to find out what to do.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::model::{Job, JobKind, Phase, Task};
use crate::error::DescriptorError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub name: String,
    pub step: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub submission_id: u64,
    pub arguments: Vec<String>,
    pub payload: Map<String, Value>,
    pub output_dir: PathBuf,
}

impl JobDescriptor {
    pub fn from_job(job: &Job) -> Self {
        let (job_id, index) = match job.kind() {
            JobKind::Run { job_id, index } => (Some(job_id), index),
            _ => (None, None),
        };
        Self {
            name: job.name().to_string(),
            step: job.step_name().to_string(),
            phase: job.phase(),
            job_id,
            index,
            submission_id: job.submission_id(),
            arguments: job.arguments().to_vec(),
            payload: job.payload().clone(),
            output_dir: job.output_dir().clone(),
        }
    }

    /// Checks that the descriptor can be handed to a worker.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let malformed = |reason: &str| DescriptorError::Malformed {
            job: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.step.trim().is_empty() {
            return Err(malformed("empty step name"));
        }
        if self.name.trim().is_empty() {
            return Err(malformed("empty job name"));
        }
        if self.arguments.is_empty() {
            return Err(malformed("empty argument vector"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(malformed("empty output directory"));
        }
        if self.phase == Phase::Run && self.job_id.is_none() {
            return Err(malformed("run job without job id"));
        }
        Ok(())
    }

    /// Path of the descriptor below `root`.
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.step).join(format!("{}.json", self.name))
    }

    /// Validates and writes the descriptor, returning its path.
    pub fn write(&self, root: &Path) -> Result<PathBuf, DescriptorError> {
        self.validate()?;

        let path = self.path(root);
        let io_error = |source| DescriptorError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| DescriptorError::Encode {
            job: self.name.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(io_error)?;

        debug!("Descriptor written: {}", path.display());
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self, DescriptorError> {
        let content = fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| DescriptorError::Encode {
            job: path.display().to_string(),
            source,
        })
    }
}
