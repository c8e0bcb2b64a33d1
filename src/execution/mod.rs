//! Submission and Execution Module
//!
//! Maps job trees onto a cluster backend, tracks job states from backend
//! reports and retries transient failures.
//!
//! # Architecture
//!
//! - [`engine`]: Drives a job tree against a backend
//! - [`backend`]: Backend interface and the dry-run backend
//! - [`local`]: Backend running jobs as local child processes
//! - [`slurm`]: Backend submitting to a Slurm scheduler
//! - [`adapter`]: Translates jobs into backend invocations
//! - [`retry`]: Failure classification and retry policy
//! - [`report`]: Audit record of a submission

pub mod adapter;
pub mod backend;
pub mod engine;
pub mod local;
pub mod report;
pub mod retry;
pub mod slurm;

pub use adapter::{LocalAdapter, SlurmAdapter, SubmissionAdapter};
pub use backend::{BackendHandle, ClusterBackend, DryRunBackend, Invocation, Resources};
pub use engine::{CancelToken, SubmissionEngine};
pub use local::LocalBackend;
pub use report::SubmissionReport;
pub use retry::{classify, FailureReason, RetryDecision, RetryPolicy};
pub use slurm::SlurmBackend;
