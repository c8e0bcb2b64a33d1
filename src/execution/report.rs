//! Submission Report
//!
//! Audit record of one submission: every job that was part of it, its last
//! known state, how many attempts it took, and a timestamped event log.
//!
//! Reports are saved to `<dir>/.tmflow/submission_<id>.json` and kept after
//! the submission finished.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::SubmissionError;
use crate::jobs::{Job, JobFailure, JobState, Phase, Task};

/// Directory holding saved reports.
pub const REPORT_DIR: &str = ".tmflow";

/// Kind of a report event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Submitted,
    StateChanged,
    Resubmitted,
    Rejected,
    CancelRequested,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReportEvent {
    pub job: String,
    pub event_type: EventType,
    pub detail: String,
    pub timestamp: DateTime<Local>,
}

/// Last known state of one job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub step: String,
    pub phase: Phase,
    pub state: JobState,
    pub attempts: u32,
    pub failure: Option<JobFailure>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmissionReport {
    pub submission_id: u64,
    pub user_name: String,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub jobs: BTreeMap<String, JobRecord>,
    pub events: Vec<ReportEvent>,
}

impl SubmissionReport {
    pub fn new(submission_id: u64, user_name: impl Into<String>) -> Self {
        Self {
            submission_id,
            user_name: user_name.into(),
            started_at: Local::now(),
            finished_at: None,
            jobs: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Updates the record of a job from its current state.
    pub fn record(&mut self, job: &Job) {
        self.jobs.insert(
            job.name().to_string(),
            JobRecord {
                step: job.step_name().to_string(),
                phase: job.phase(),
                state: job.state(),
                attempts: job.attempt(),
                failure: job.failure(),
            },
        );
    }

    /// Records a job and appends an event for it.
    pub fn add_event(&mut self, job: &Job, event_type: EventType, detail: impl Into<String>) {
        self.record(job);
        self.events.push(ReportEvent {
            job: job.name().to_string(),
            event_type,
            detail: detail.into(),
            timestamp: Local::now(),
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Local::now());
    }

    pub fn events_for(&self, job: &str) -> Vec<&ReportEvent> {
        self.events.iter().filter(|e| e.job == job).collect()
    }

    /// Counts jobs per state label.
    pub fn state_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for record in self.jobs.values() {
            *counts.entry(record.state.label()).or_insert(0) += 1;
        }
        counts
    }

    /// Renders a per-step overview.
    pub fn summary(&self) -> String {
        let mut steps: BTreeMap<&str, (usize, usize, usize)> = BTreeMap::new();
        for record in self.jobs.values() {
            let entry = steps.entry(record.step.as_str()).or_insert((0, 0, 0));
            entry.0 += 1;
            match &record.state {
                JobState::Terminated(outcome) if outcome.is_success() => entry.1 += 1,
                JobState::Terminated(_) => entry.2 += 1,
                _ => {}
            }
        }

        let mut output = format!("Submission {} ({})\n\n", self.submission_id, self.user_name);
        output.push_str(&format!("{:14} {:>6} {:>6} {:>6}\n", "Step", "Jobs", "Done", "Failed"));
        for (step, (total, done, failed)) in steps {
            output.push_str(&format!("{:14} {:>6} {:>6} {:>6}\n", step, total, done, failed));
        }
        if let Some(finished) = self.finished_at {
            let elapsed = finished.signed_duration_since(self.started_at);
            output.push_str(&format!("\nTotal: {} ms\n", elapsed.num_milliseconds()));
        }
        output
    }

    /// Path of the saved report for a submission.
    pub fn path_for(dir: &Path, submission_id: u64) -> PathBuf {
        dir.join(REPORT_DIR)
            .join(format!("submission_{}.json", submission_id))
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf, SubmissionError> {
        let path = Self::path_for(dir, self.submission_id);
        let report_error = |e: &dyn std::fmt::Display| {
            SubmissionError::Report(format!("{}: {}", path.display(), e))
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| report_error(&e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| report_error(&e))?;
        fs::write(&path, json).map_err(|e| report_error(&e))?;

        info!("Saved submission report to {}", path.display());
        Ok(path)
    }

    pub fn load(dir: &Path, submission_id: u64) -> Result<Self, SubmissionError> {
        let path = Self::path_for(dir, submission_id);
        let content = fs::read_to_string(&path)
            .map_err(|e| SubmissionError::Report(format!("{}: {}", path.display(), e)))?;
        let report: SubmissionReport = serde_json::from_str(&content)
            .map_err(|e| SubmissionError::Report(format!("{}: {}", path.display(), e)))?;

        info!("Loaded submission report from {}", path.display());
        Ok(report)
    }
}
