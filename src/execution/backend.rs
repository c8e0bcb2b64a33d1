//! Cluster Backend Interface
//!
//! The backend runs processes; the engine only tells it what to run and
//! asks how things are going.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::jobs::BackendStatus;

/// Resource hints for one job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resources {
    #[serde(default = "default_cpus")]
    pub cpus: usize,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// Wall time as `HH:MM:SS`
    #[serde(default = "default_duration")]
    pub duration: String,
}

fn default_cpus() -> usize {
    1
}

fn default_memory_mb() -> u64 {
    3800
}

fn default_duration() -> String {
    "02:00:00".to_string()
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
            duration: default_duration(),
        }
    }
}

/// Everything a backend needs to dispatch one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub job_name: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resources: Resources,
    /// Accounting identity usage is attributed to
    pub account: String,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl Invocation {
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("")
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or(&[])
    }
}

/// Opaque identifier the backend hands out on submission.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendHandle(pub String);

impl std::fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait ClusterBackend {
    /// Dispatches a job. An error means the backend refused it.
    fn submit(&mut self, invocation: &Invocation) -> Result<BackendHandle, BackendError>;

    fn poll(&mut self, handle: &BackendHandle) -> Result<BackendStatus, BackendError>;

    /// Requests termination; the job still has to be polled to terminated.
    fn cancel(&mut self, handle: &BackendHandle) -> Result<(), BackendError>;
}

/// Prints invocations instead of running them; every job succeeds.
#[derive(Debug, Default)]
pub struct DryRunBackend {
    submitted: HashMap<BackendHandle, String>,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.len()
    }
}

impl ClusterBackend for DryRunBackend {
    fn submit(&mut self, invocation: &Invocation) -> Result<BackendHandle, BackendError> {
        println!();
        println!("[DRY RUN] Job: {}", invocation.job_name);
        println!("  Command: {}", invocation.command.join(" "));
        println!("  Account: {}", invocation.account);
        println!(
            "  Resources: {} cpu(s), {} MB, {}",
            invocation.resources.cpus, invocation.resources.memory_mb, invocation.resources.duration
        );
        println!("  Log: {}", invocation.stdout.display());

        let handle = BackendHandle(format!("dry-run-{}", self.submitted.len() + 1));
        self.submitted
            .insert(handle.clone(), invocation.job_name.clone());
        Ok(handle)
    }

    fn poll(&mut self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        if self.submitted.contains_key(handle) {
            Ok(BackendStatus::Finished {
                exit_code: 0,
                stderr: String::new(),
            })
        } else {
            Err(BackendError::UnknownHandle(handle.0.clone()))
        }
    }

    fn cancel(&mut self, _handle: &BackendHandle) -> Result<(), BackendError> {
        Ok(())
    }
}
