//! Retry Policy
//!
//! Failed jobs are classified by scanning their captured standard error.
//! Only environment-dependent failures (timeouts, memory kills) are worth
//! another attempt; errors raised by the step itself are not.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static EXCEPTION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(FAILED|Traceback)").expect("valid exception pattern"));
static TIMEOUT_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^TIMEOUT").expect("valid timeout pattern"));
static MEMORY_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[0-9]*\s*\bKilled\b").expect("valid memory pattern"));

/// Classification of a failed job's diagnostic output.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// An error trace was raised by the step
    Exception,
    /// Wall time limit exceeded
    Timeout,
    /// Killed, typically out of memory
    Memory,
    Unknown,
}

impl FailureReason {
    /// Transient failures that may succeed when resubmitted.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureReason::Timeout | FailureReason::Memory)
    }
}

/// Classifies captured standard error. Markers are checked in order
/// exception, timeout, memory.
pub fn classify(stderr: &str) -> FailureReason {
    if EXCEPTION_MARKER.is_match(stderr) {
        FailureReason::Exception
    } else if TIMEOUT_MARKER.is_match(stderr) {
        FailureReason::Timeout
    } else if MEMORY_MARKER.is_match(stderr) {
        FailureReason::Memory
    } else {
        FailureReason::Unknown
    }
}

/// What to do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Resubmit,
    Propagate,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total submissions per job, including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Decides whether a job that failed on `attempt` is resubmitted.
    pub fn decide(&self, reason: FailureReason, attempt: u32) -> RetryDecision {
        if reason.is_transient() && attempt < self.max_attempts {
            RetryDecision::Resubmit
        } else {
            RetryDecision::Propagate
        }
    }
}
