//! Job State Machine
//!
//! ```text
//! NEW -> SUBMITTED -> RUNNING -> TERMINATED
//!            |          ^  |        ^
//!            |          |  v        |
//!            +------> STOPPED ------+
//! ```
//!
//! A submitted job may also terminate directly (it finished between two
//! polls), and a new job terminates as `Rejected` when the backend refuses
//! it at dispatch. States only change in response to backend reports.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Terminal outcome of a job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Process ended unsuccessfully; `diagnostic` is the captured stderr
    Failure {
        exit_code: Option<i32>,
        diagnostic: String,
    },
    /// Backend refused the job at dispatch
    Rejected { reason: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Execution state of a job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    New,
    Submitted,
    Running,
    Stopped,
    Terminated(Outcome),
}

impl Default for JobState {
    fn default() -> Self {
        JobState::New
    }
}

impl JobState {
    /// Short upper-case label, as used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::Submitted => "SUBMITTED",
            JobState::Running => "RUNNING",
            JobState::Stopped => "STOPPED",
            JobState::Terminated(_) => "TERMINATED",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, JobState::Terminated(_))
    }

    /// Submitted, running or stopped: the backend knows about the job.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Submitted | JobState::Running | JobState::Stopped
        )
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            JobState::Terminated(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Checks whether moving to `next` is a legal transition.
    ///
    /// Reporting the current state again is accepted as a no-op.
    pub fn can_transition(&self, next: &JobState) -> bool {
        use JobState::*;

        if std::mem::discriminant(self) == std::mem::discriminant(next) && !self.is_terminated() {
            return true;
        }
        match (self, next) {
            (New, Submitted) => true,
            (New, Terminated(Outcome::Rejected { .. })) => true,
            (Submitted, Running | Stopped) => true,
            (Submitted, Terminated(o)) => !matches!(o, Outcome::Rejected { .. }),
            (Running, Stopped) => true,
            (Running, Terminated(o)) | (Stopped, Terminated(o)) => {
                !matches!(o, Outcome::Rejected { .. })
            }
            (Stopped, Running) => true,
            _ => false,
        }
    }

    /// Returns the next state or an error for an illegal transition.
    pub fn transition(&self, next: JobState) -> Result<JobState, StateError> {
        if self.can_transition(&next) {
            Ok(next)
        } else {
            Err(StateError::InvalidTransition {
                from: self.label(),
                to: next.label(),
            })
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Terminated(Outcome::Success) => write!(f, "TERMINATED (success)"),
            JobState::Terminated(Outcome::Failure { exit_code, .. }) => match exit_code {
                Some(code) => write!(f, "TERMINATED (failure, exit code {})", code),
                None => write!(f, "TERMINATED (failure)"),
            },
            JobState::Terminated(Outcome::Rejected { .. }) => write!(f, "TERMINATED (rejected)"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Status reported by the cluster backend for a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendStatus {
    /// Accepted, waiting for resources
    Queued,
    Running,
    /// Suspended or held by the backend
    Stopped,
    /// Process exited; `stderr` is the captured standard error
    Finished { exit_code: i32, stderr: String },
}

impl BackendStatus {
    /// Maps the backend status onto the job state machine.
    pub fn to_state(&self) -> JobState {
        match self {
            BackendStatus::Queued => JobState::Submitted,
            BackendStatus::Running => JobState::Running,
            BackendStatus::Stopped => JobState::Stopped,
            BackendStatus::Finished { exit_code: 0, .. } => JobState::Terminated(Outcome::Success),
            BackendStatus::Finished { exit_code, stderr } => {
                JobState::Terminated(Outcome::Failure {
                    exit_code: Some(*exit_code),
                    diagnostic: stderr.clone(),
                })
            }
        }
    }
}
