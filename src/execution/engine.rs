//! Submission Engine
//!
//! Drives a job tree against a cluster backend:
//! - Submits jobs that became eligible, writing their descriptors first
//! - Polls submitted jobs and applies the reported state
//! - Classifies failures and resubmits transient ones
//! - Propagates cancellation through the tree
//!
//! The engine is single-threaded. Parallelism lives in the tree: every
//! member of a parallel collection is submitted in the same tick and the
//! backend runs them side by side.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{PlanError, SubmissionError};
use crate::jobs::{
    CollectJob, Composer, Dispatch, Drive, FailureCause, Job, JobDescriptor, JobState, Outcome,
    Progress, RunJobCollection, StepPlanner, Task,
};

use super::adapter::{LocalAdapter, SubmissionAdapter};
use super::backend::{BackendHandle, ClusterBackend};
use super::report::{EventType, SubmissionReport};
use super::retry::{FailureReason, RetryDecision, RetryPolicy};

/// Shared flag requesting cancellation of a running submission.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Drives the job tree of one submission.
///
/// # Example
///
/// ```rust,no_run
/// use tmflow::config::EngineConfig;
/// use tmflow::execution::{LocalBackend, SubmissionEngine};
/// use tmflow::jobs::{Composer, ManifestPlanner, SubmissionContext};
/// use tmflow::workflow::load_description;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let description = load_description("workflow.yaml")?;
///     let context = SubmissionContext::new(1, "alice", "/data/experiment");
///     let composer = Composer::new(context);
///     let mut tree = composer.workflow_collection(&description)?;
///
///     let mut engine = SubmissionEngine::new(
///         LocalBackend::default(),
///         composer,
///         ManifestPlanner::new("/data/experiment"),
///         EngineConfig::default(),
///     );
///     engine.run(&mut tree)?;
///     Ok(())
/// }
/// ```
pub struct SubmissionEngine<B: ClusterBackend> {
    backend: B,
    adapter: Box<dyn SubmissionAdapter>,
    policy: RetryPolicy,
    composer: Composer,
    planner: Box<dyn StepPlanner>,
    config: EngineConfig,
    descriptor_root: Option<PathBuf>,
    handles: HashMap<String, BackendHandle>,
    cancel_requested: HashSet<String>,
    cancelling: bool,
    token: CancelToken,
    report: SubmissionReport,
}

impl<B: ClusterBackend> SubmissionEngine<B> {
    /// Creates an engine; jobs run through a [`LocalAdapter`] unless
    /// another adapter is set.
    pub fn new(
        backend: B,
        composer: Composer,
        planner: impl StepPlanner + 'static,
        config: EngineConfig,
    ) -> Self {
        let context = composer.context();
        let report = SubmissionReport::new(context.submission_id, context.user_name.clone());
        let adapter = match &config.program {
            Some(program) => LocalAdapter::new().with_program(program.clone()),
            None => LocalAdapter::new(),
        };
        Self {
            backend,
            adapter: Box::new(adapter),
            policy: config.retry_policy(),
            composer,
            planner: Box::new(planner),
            config,
            descriptor_root: None,
            handles: HashMap::new(),
            cancel_requested: HashSet::new(),
            cancelling: false,
            token: CancelToken::new(),
            report,
        }
    }

    pub fn with_adapter(mut self, adapter: impl SubmissionAdapter + 'static) -> Self {
        self.adapter = Box::new(adapter);
        self
    }

    /// Writes a descriptor for every job below `root` before submitting it.
    pub fn with_descriptor_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.descriptor_root = Some(root.into());
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.token = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn report(&self) -> &SubmissionReport {
        &self.report
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Advances the tree once.
    ///
    /// After cancellation was requested, returns `Cancelled` once no job
    /// of the tree is known to the backend any more.
    pub fn tick(&mut self, tree: &mut dyn Drive) -> Result<Progress, SubmissionError> {
        if self.token.is_cancelled() && !self.cancelling {
            warn!("Cancelling submission {}", self.report.submission_id);
            self.cancelling = true;
            tree.cancel(self);
        }

        let progress = tree.advance(self);

        if self.cancelling {
            let mut active = 0;
            tree.visit_jobs(&mut |job| {
                if job.state().is_active() {
                    active += 1;
                }
            });
            if active == 0 {
                return Err(SubmissionError::Cancelled);
            }
            debug!("Waiting for {} cancelled job(s) to terminate", active);
            return Ok(Progress::Pending);
        }
        Ok(progress)
    }

    /// Ticks until the tree reaches a terminal outcome.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Every job succeeded
    /// * `Err(SubmissionError::Failed)` - Failing jobs with their classification
    /// * `Err(SubmissionError::Cancelled)` - Cancelled through the token
    pub fn run(&mut self, tree: &mut dyn Drive) -> Result<(), SubmissionError> {
        let start_time = Instant::now();
        info!(
            "Starting submission {} of '{}' ({} job(s) known up front, max attempts: {})",
            self.report.submission_id,
            tree.name(),
            tree.job_count(),
            self.policy.max_attempts
        );
        self.record_all(tree);

        let result = loop {
            match self.tick(tree) {
                Ok(Progress::Pending) => thread::sleep(self.config.poll_interval()),
                Ok(Progress::Succeeded) => break Ok(()),
                Ok(Progress::Failed(failures)) => break Err(SubmissionError::Failed(failures)),
                Err(e) => break Err(e),
            }
        };

        self.record_all(tree);
        self.report.finish();
        match &result {
            Ok(()) => info!(
                "Submission {} completed in {:.2?}",
                self.report.submission_id,
                start_time.elapsed()
            ),
            Err(e) => error!("{}", e),
        }
        result
    }

    fn record_all(&mut self, tree: &dyn Drive) {
        let report = &mut self.report;
        tree.visit_jobs(&mut |job| report.record(job));
    }

    fn submit(&mut self, job: &mut Job) -> Progress {
        if let Some(root) = &self.descriptor_root {
            if let Err(e) = JobDescriptor::from_job(job).write(root) {
                return self.reject(job, e.to_string());
            }
        }

        let resources = self.config.resources_for(job.step_name()).clone();
        let invocation = self.adapter.invocation(job, &resources);

        match self.backend.submit(&invocation) {
            Ok(handle) => {
                if let Err(e) = job.update_state(JobState::Submitted) {
                    warn!("Job '{}': {}", job.name(), e);
                }
                info!(
                    "Submitted job '{}' (attempt {}, handle {})",
                    job.name(),
                    job.attempt(),
                    handle
                );
                self.report
                    .add_event(job, EventType::Submitted, handle.to_string());
                self.handles.insert(job.name().to_string(), handle);
                Progress::Pending
            }
            Err(e) => self.reject(job, e.to_string()),
        }
    }

    fn reject(&mut self, job: &mut Job, reason: String) -> Progress {
        error!("Job '{}' rejected: {}", job.name(), reason);
        if let Err(e) = job.reject(reason.clone()) {
            warn!("Job '{}': {}", job.name(), e);
        }
        self.report.add_event(job, EventType::Rejected, reason);
        Progress::Failed(job.failure().into_iter().collect())
    }

    fn poll(&mut self, job: &mut Job) -> Progress {
        let Some(handle) = self.handles.get(job.name()).cloned() else {
            warn!("No backend handle for submitted job '{}'", job.name());
            return Progress::Pending;
        };

        let status = match self.backend.poll(&handle) {
            Ok(status) => status,
            Err(e) => {
                warn!("Could not poll job '{}': {}", job.name(), e);
                return Progress::Pending;
            }
        };

        let next = status.to_state();
        if next != job.state() {
            match job.update_state(next) {
                Ok(()) => {
                    debug!("Job '{}' is now {}", job.name(), job.state());
                    self.report
                        .add_event(job, EventType::StateChanged, job.state().to_string());
                }
                Err(e) => warn!("Ignoring status of job '{}': {}", job.name(), e),
            }
        }

        match job.state() {
            JobState::Terminated(Outcome::Success) => Progress::Succeeded,
            JobState::Terminated(_) => self.handle_failure(job),
            _ => Progress::Pending,
        }
    }

    fn handle_failure(&mut self, job: &mut Job) -> Progress {
        let Some(failure) = job.failure() else {
            return Progress::Succeeded;
        };
        let reason = match failure.cause {
            FailureCause::Runtime(reason) => reason,
            _ => FailureReason::Unknown,
        };

        let decision = if self.cancelling {
            RetryDecision::Propagate
        } else {
            self.policy.decide(reason, job.attempt())
        };

        match decision {
            RetryDecision::Resubmit => {
                warn!(
                    "Job '{}' failed ({:?}), resubmitting (attempt {} of {})",
                    job.name(),
                    reason,
                    job.attempt() + 1,
                    self.policy.max_attempts
                );
                self.handles.remove(job.name());
                if let Err(e) = job.resubmit() {
                    warn!("Job '{}': {}", job.name(), e);
                    return Progress::Failed(vec![failure]);
                }
                self.report
                    .add_event(job, EventType::Resubmitted, format!("{:?}", reason));
                self.submit(job)
            }
            RetryDecision::Propagate => {
                error!("Job '{}' failed: {:?}", job.name(), reason);
                Progress::Failed(vec![failure])
            }
        }
    }
}

impl<B: ClusterBackend> Dispatch for SubmissionEngine<B> {
    fn advance_job(&mut self, job: &mut Job) -> Progress {
        match job.state() {
            // Nothing new goes out once cancellation started
            JobState::New if self.cancelling => Progress::Pending,
            JobState::New => self.submit(job),
            JobState::Submitted | JobState::Running | JobState::Stopped => self.poll(job),
            JobState::Terminated(Outcome::Success) => Progress::Succeeded,
            JobState::Terminated(_) => Progress::Failed(job.failure().into_iter().collect()),
        }
    }

    fn cancel_job(&mut self, job: &Job) {
        if !self.cancel_requested.insert(job.name().to_string()) {
            return;
        }
        let Some(handle) = self.handles.get(job.name()) else {
            return;
        };
        info!("Cancelling job '{}'", job.name());
        if let Err(e) = self.backend.cancel(handle) {
            warn!("Could not cancel job '{}': {}", job.name(), e);
        }
        self.report.add_event(job, EventType::CancelRequested, "");
    }

    fn plan_run(
        &mut self,
        step: &str,
    ) -> Result<(RunJobCollection, Option<CollectJob>), PlanError> {
        let plan = self.planner.plan(step)?;
        info!(
            "Step '{}': {} run phase(s), {} job(s)",
            step,
            plan.phases.len(),
            plan.job_count()
        );
        Ok(self.composer.plan_step(step, plan)?)
    }
}
