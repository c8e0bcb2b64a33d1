//! Error Types
//!
//! One enum per concern. [`SubmissionError`] is what the engine and the
//! binary ultimately report.

use thiserror::Error;

use crate::jobs::{JobFailure, Phase};
use crate::workflow::ValidationError;

/// Reading or writing a workflow description file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Cannot access workflow description '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in '{path}': {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid workflow description: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("Illegal state transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Job '{job}' cannot be resubmitted from state {state}")]
    NotRetryable { job: String, state: &'static str },
}

/// Building a job tree from parts that do not fit together.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompositionError {
    #[error("Job '{job}' is a {found} job, expected a {expected} job")]
    WrongJobKind {
        job: String,
        expected: &'static str,
        found: Phase,
    },

    #[error("'{member}' belongs to step '{found}', collection '{collection}' holds step '{expected}'")]
    StepMismatch {
        collection: String,
        member: String,
        expected: String,
        found: String,
    },

    #[error("Job '{job}' has phase index {found:?}, collection '{collection}' holds index {expected:?}")]
    IndexMismatch {
        collection: String,
        job: String,
        expected: Option<u32>,
        found: Option<u32>,
    },

    #[error("Collection '{collection}' already contains '{member}'")]
    Duplicate { collection: String, member: String },

    #[error("Step '{0}' is not part of the registry")]
    UnknownStep(String),
}

/// Failures reported by a cluster backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend rejected job '{job}': {reason}")]
    Rejected { job: String, reason: String },

    #[error("Unknown backend handle '{0}'")]
    UnknownHandle(String),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' failed: {reason}")]
    Query { program: String, reason: String },

    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Planning the run phase of a step.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("No run plan for step '{0}'")]
    Missing(String),

    #[error("Cannot read run plan '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed run plan '{path}': {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Composition(#[from] CompositionError),
}

/// Per-job descriptor handoff.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("Descriptor for '{job}' is malformed: {reason}")]
    Malformed { job: String, reason: String },

    #[error("Cannot write descriptor '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot encode descriptor for '{job}': {source}")]
    Encode {
        job: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config '{path}': {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Outcome of driving a submission that did not succeed.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Submission failed: {}", format_failures(.0))]
    Failed(Vec<JobFailure>),

    #[error("Submission cancelled")]
    Cancelled,

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Cannot write submission report: {0}")]
    Report(String),
}

fn format_failures(failures: &[JobFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::retry::FailureReason;
    use crate::jobs::FailureCause;

    #[test]
    fn test_failed_submission_names_jobs() {
        let err = SubmissionError::Failed(vec![
            JobFailure {
                job: "align_run_000002".into(),
                step: "align".into(),
                cause: FailureCause::Runtime(FailureReason::Exception),
                attempts: 1,
            },
            JobFailure {
                job: "align_run_000003".into(),
                step: "align".into(),
                cause: FailureCause::Runtime(FailureReason::Memory),
                attempts: 2,
            },
        ]);
        let message = err.to_string();
        assert!(message.contains("align_run_000002 failed (Exception) after 1 attempt(s)"));
        assert!(message.contains("align_run_000003 failed (Memory) after 2 attempt(s)"));
    }

    #[test]
    fn test_wrong_kind_message() {
        let err = CompositionError::WrongJobKind {
            job: "align_collect".into(),
            expected: "run",
            found: Phase::Collect,
        };
        assert_eq!(
            err.to_string(),
            "Job 'align_collect' is a collect job, expected a run job"
        );
    }
}
