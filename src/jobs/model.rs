//! Job Data Model
//!
//! A job is one schedulable unit of a workflow step. All three phases share
//! a single flat record; the [`JobKind`] tag decides the name and which
//! collections the job may join.
//!
//! # Naming
//!
//! ```text
//! Init                 <step>_init
//! Run                  <step>_run_<job_id:06>
//! Run (phase index)    <step>_run-<index:02>_<job_id:06>
//! Collect              <step>_collect
//! ```
//!
//! Names double as uniqueness keys and as log file stems.

use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::state::{JobState, Outcome};
use crate::error::{CompositionError, StateError};
use crate::execution::retry::{classify, FailureReason};

/// Format of the submission timestamp embedded in log file names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Phase of a workflow step a job belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Run,
    Collect,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Run => "run",
            Phase::Collect => "collect",
        };
        write!(f, "{}", name)
    }
}

/// Kind tag with the run-specific fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Init,
    Run {
        /// One-based, unique within its parallel group
        job_id: u32,
        /// Set when the step has more than one run phase
        index: Option<u32>,
    },
    Collect,
}

impl JobKind {
    pub fn phase(&self) -> Phase {
        match self {
            JobKind::Init => Phase::Init,
            JobKind::Run { .. } => Phase::Run,
            JobKind::Collect => Phase::Collect,
        }
    }
}

/// Derives the job name from step and kind.
pub fn job_name(step_name: &str, kind: &JobKind) -> String {
    match kind {
        JobKind::Init => format!("{}_init", step_name),
        JobKind::Run {
            job_id,
            index: None,
        } => format!("{}_run_{:06}", step_name, job_id),
        JobKind::Run {
            job_id,
            index: Some(index),
        } => format!("{}_run-{:02}_{:06}", step_name, index, job_id),
        JobKind::Collect => format!("{}_collect", step_name),
    }
}

/// Anything with a name and an execution state: jobs and job collections.
pub trait Task {
    fn name(&self) -> &str;

    fn state(&self) -> JobState;

    fn is_new(&self) -> bool {
        matches!(self.state(), JobState::New)
    }

    fn is_submitted(&self) -> bool {
        matches!(self.state(), JobState::Submitted)
    }

    fn is_running(&self) -> bool {
        matches!(self.state(), JobState::Running)
    }

    fn is_stopped(&self) -> bool {
        matches!(self.state(), JobState::Stopped)
    }

    fn is_terminated(&self) -> bool {
        matches!(self.state(), JobState::Terminated(_))
    }
}

/// Why a job (or the planning of its phase) failed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    /// Job terminated unsuccessfully
    Runtime(FailureReason),
    /// Backend refused the job at dispatch
    Rejected(String),
    /// Run phase could not be planned after the init phase
    Planning(String),
}

/// A failed job with its identity and classification.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub job: String,
    pub step: String,
    pub cause: FailureCause,
    pub attempts: u32,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            FailureCause::Runtime(reason) => write!(
                f,
                "{} failed ({:?}) after {} attempt(s)",
                self.job, reason, self.attempts
            ),
            FailureCause::Rejected(reason) => {
                write!(f, "{} rejected by backend: {}", self.job, reason)
            }
            FailureCause::Planning(reason) => {
                write!(f, "{} could not be planned: {}", self.job, reason)
            }
        }
    }
}

/// A single schedulable unit of work.
///
/// Everything except the state and the attempt counter is fixed at
/// construction. Both are updated by the submission engine only.
#[derive(Debug, Clone)]
pub struct Job {
    step_name: String,
    kind: JobKind,
    name: String,
    arguments: Vec<String>,
    output_dir: PathBuf,
    submission_id: u64,
    user_name: String,
    timestamp: String,
    payload: Map<String, Value>,
    state: JobState,
    attempt: u32,
}

impl Job {
    /// Creates a job of any kind.
    ///
    /// # Arguments
    ///
    /// * `step_name` - Name of the workflow step
    /// * `kind` - Phase tag (with job id and phase index for run jobs)
    /// * `arguments` - Command line arguments
    /// * `output_dir` - Directory where log reports are stored
    /// * `submission_id` - ID of the owning submission
    /// * `user_name` - Submitting user, used as accounting identity
    pub fn new(
        step_name: impl Into<String>,
        kind: JobKind,
        arguments: Vec<String>,
        output_dir: impl Into<PathBuf>,
        submission_id: u64,
        user_name: impl Into<String>,
    ) -> Self {
        let step_name = step_name.into();
        let name = job_name(&step_name, &kind);
        Self {
            step_name,
            kind,
            name,
            arguments,
            output_dir: output_dir.into(),
            submission_id,
            user_name: user_name.into(),
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            payload: Map::new(),
            state: JobState::New,
            attempt: 1,
        }
    }

    /// Creates an init job.
    pub fn init(
        step_name: impl Into<String>,
        arguments: Vec<String>,
        output_dir: impl Into<PathBuf>,
        submission_id: u64,
        user_name: impl Into<String>,
    ) -> Self {
        Self::new(step_name, JobKind::Init, arguments, output_dir, submission_id, user_name)
    }

    /// Creates a run job.
    ///
    /// # Example
    ///
    /// ```
    /// use tmflow::jobs::{Job, Task};
    ///
    /// let job = Job::run("align", vec![], "/tmp/log", 3, Some(1), 1, "alice");
    /// assert_eq!(job.name(), "align_run-01_000003");
    /// ```
    pub fn run(
        step_name: impl Into<String>,
        arguments: Vec<String>,
        output_dir: impl Into<PathBuf>,
        job_id: u32,
        index: Option<u32>,
        submission_id: u64,
        user_name: impl Into<String>,
    ) -> Self {
        Self::new(
            step_name,
            JobKind::Run { job_id, index },
            arguments,
            output_dir,
            submission_id,
            user_name,
        )
    }

    /// Creates a collect job.
    pub fn collect(
        step_name: impl Into<String>,
        arguments: Vec<String>,
        output_dir: impl Into<PathBuf>,
        submission_id: u64,
        user_name: impl Into<String>,
    ) -> Self {
        Self::new(step_name, JobKind::Collect, arguments, output_dir, submission_id, user_name)
    }

    /// Sets the submission timestamp used in log file names.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Attaches the batch payload handed to the worker process.
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn phase(&self) -> Phase {
        self.kind.phase()
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.output_dir
    }

    pub fn submission_id(&self) -> u64 {
        self.submission_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Current attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Path of the captured standard output.
    pub fn stdout_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.out", self.name, self.timestamp))
    }

    /// Path of the captured standard error.
    pub fn stderr_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.err", self.name, self.timestamp))
    }

    /// Applies a state reported by the backend.
    pub(crate) fn update_state(&mut self, next: JobState) -> Result<(), StateError> {
        self.state = self.state.transition(next)?;
        Ok(())
    }

    /// Marks the job as refused by the backend at dispatch.
    pub(crate) fn reject(&mut self, reason: impl Into<String>) -> Result<(), StateError> {
        self.update_state(JobState::Terminated(Outcome::Rejected {
            reason: reason.into(),
        }))
    }

    /// Resets a failed job for another attempt with the same identity.
    pub(crate) fn resubmit(&mut self) -> Result<(), StateError> {
        match self.state {
            JobState::Terminated(Outcome::Failure { .. }) => {
                self.state = JobState::New;
                self.attempt += 1;
                Ok(())
            }
            _ => Err(StateError::NotRetryable {
                job: self.name.clone(),
                state: self.state.label(),
            }),
        }
    }

    /// Describes the failure if the job terminated unsuccessfully.
    pub fn failure(&self) -> Option<JobFailure> {
        let cause = match self.state.outcome()? {
            Outcome::Success => return None,
            Outcome::Failure { diagnostic, .. } => FailureCause::Runtime(classify(diagnostic)),
            Outcome::Rejected { reason } => FailureCause::Rejected(reason.clone()),
        };
        Some(JobFailure {
            job: self.name.clone(),
            step: self.step_name.clone(),
            cause,
            attempts: self.attempt,
        })
    }
}

impl Task for Job {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> JobState {
        self.state.clone()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Job(name={:?}, submission_id={})>",
            self.name, self.submission_id
        )
    }
}

/// Declares a wrapper that only holds jobs of one kind.
macro_rules! role_wrapper {
    ($(#[$meta:meta])* $wrapper:ident, $label:literal, $pattern:pat) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $wrapper(Job);

        impl $wrapper {
            pub fn as_job(&self) -> &Job {
                &self.0
            }

            pub fn into_job(self) -> Job {
                self.0
            }

            pub(crate) fn job_mut(&mut self) -> &mut Job {
                &mut self.0
            }
        }

        impl TryFrom<Job> for $wrapper {
            type Error = CompositionError;

            fn try_from(job: Job) -> Result<Self, Self::Error> {
                match job.kind {
                    $pattern => Ok(Self(job)),
                    _ => Err(CompositionError::WrongJobKind {
                        job: job.name.clone(),
                        expected: $label,
                        found: job.phase(),
                    }),
                }
            }
        }

        impl Deref for $wrapper {
            type Target = Job;

            fn deref(&self) -> &Job {
                &self.0
            }
        }

        impl Task for $wrapper {
            fn name(&self) -> &str {
                &self.0.name
            }

            fn state(&self) -> JobState {
                self.0.state.clone()
            }
        }
    };
}

role_wrapper!(
    /// Init job: plans the run and collect phases of a step.
    InitJob,
    "init",
    JobKind::Init
);
role_wrapper!(
    /// Run job: one of many parallel units of a run phase.
    RunJob,
    "run",
    JobKind::Run { .. }
);
role_wrapper!(
    /// Collect job: aggregates results once all run jobs succeeded.
    CollectJob,
    "collect",
    JobKind::Collect
);

impl RunJob {
    pub fn job_id(&self) -> u32 {
        match self.0.kind {
            JobKind::Run { job_id, .. } => job_id,
            _ => 0,
        }
    }

    pub fn index(&self) -> Option<u32> {
        match self.0.kind {
            JobKind::Run { index, .. } => index,
            _ => None,
        }
    }
}
