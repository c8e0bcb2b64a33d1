//! Cluster Submission Adapters
//!
//! Translate a job into a backend invocation. This is the only place that
//! knows how a particular backend wants its arguments ordered, including
//! where the accounting identity goes.

use std::collections::BTreeMap;

use crate::jobs::{Job, Task};

use super::backend::{Invocation, Resources};

/// Environment variable carrying the accounting identity.
pub const ACCOUNT_ENV: &str = "TMFLOW_ACCOUNT";

/// Environment variable carrying the submission id.
pub const SUBMISSION_ENV: &str = "TMFLOW_SUBMISSION_ID";

pub trait SubmissionAdapter {
    fn invocation(&self, job: &Job, resources: &Resources) -> Invocation;
}

fn job_env(job: &Job) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(ACCOUNT_ENV.to_string(), job.user_name().to_string());
    env.insert(SUBMISSION_ENV.to_string(), job.submission_id().to_string());
    env
}

/// Quotes a word for `/bin/sh` unless it only has safe characters.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Prepends an optional program to the job's argument vector.
fn job_command(program: Option<&str>, job: &Job) -> Vec<String> {
    program
        .map(str::to_string)
        .into_iter()
        .chain(job.arguments().iter().cloned())
        .collect()
}

/// Submits through `sbatch`, wrapping the job command. Pair with
/// [`SlurmBackend`](super::slurm::SlurmBackend), which reads the job id
/// `--parsable` prints.
#[derive(Debug, Clone)]
pub struct SlurmAdapter {
    sbatch: String,
    program: Option<String>,
}

impl Default for SlurmAdapter {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            program: None,
        }
    }
}

impl SlurmAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submission command, `sbatch` unless set.
    pub fn with_sbatch(mut self, sbatch: impl Into<String>) -> Self {
        self.sbatch = sbatch.into();
        self
    }

    /// Program the job arguments are passed to on the compute node.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }
}

impl SubmissionAdapter for SlurmAdapter {
    fn invocation(&self, job: &Job, resources: &Resources) -> Invocation {
        let wrapped = job_command(self.program.as_deref(), job)
            .iter()
            .map(|w| shell_quote(w))
            .collect::<Vec<_>>()
            .join(" ");

        let mut command = vec![
            self.sbatch.clone(),
            // Job id only, for the backend to track
            "--parsable".to_string(),
            "--job-name".to_string(),
            job.name().to_string(),
            "--output".to_string(),
            job.stdout_path().display().to_string(),
            "--error".to_string(),
            job.stderr_path().display().to_string(),
            "--cpus-per-task".to_string(),
            resources.cpus.to_string(),
            "--mem".to_string(),
            format!("{}M", resources.memory_mb),
            "--time".to_string(),
            resources.duration.clone(),
            "--wrap".to_string(),
            wrapped,
        ];
        // Account goes right after the program name
        command.splice(
            1..1,
            ["--account".to_string(), job.user_name().to_string()],
        );

        Invocation {
            job_name: job.name().to_string(),
            command,
            env: job_env(job),
            resources: resources.clone(),
            account: job.user_name().to_string(),
            stdout: job.stdout_path(),
            stderr: job.stderr_path(),
        }
    }
}

/// Runs the job's argument vector directly on this machine.
#[derive(Debug, Clone, Default)]
pub struct LocalAdapter {
    program: Option<String>,
}

impl LocalAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }
}

impl SubmissionAdapter for LocalAdapter {
    fn invocation(&self, job: &Job, resources: &Resources) -> Invocation {
        Invocation {
            job_name: job.name().to_string(),
            command: job_command(self.program.as_deref(), job),
            env: job_env(job),
            resources: resources.clone(),
            account: job.user_name().to_string(),
            stdout: job.stdout_path(),
            stderr: job.stderr_path(),
        }
    }
}
