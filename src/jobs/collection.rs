//! Job Collections
//!
//! Composes jobs into the execution tree of a submission:
//!
//! ```text
//! WorkflowJobCollection                 sequential, abort on error
//! └── StepJobCollection                 init -> run -> collect
//!     ├── InitJob
//!     ├── RunJobCollection
//!     │   ├── SingleRunJobCollection    parallel
//!     │   └── MultiRunJobCollection     sequential, abort on error
//!     │       └── SingleRunJobCollection
//!     └── CollectJob
//! ```
//!
//! Collections never talk to a backend. They decide *which* jobs are
//! eligible and hand them to a [`Dispatch`] implementation (the submission
//! engine), which submits, polls and retries individual jobs.

use std::fmt;

use log::{debug, warn};

use super::model::{CollectJob, FailureCause, InitJob, Job, JobFailure, RunJob, Task};
use super::state::{JobState, Outcome};
use crate::error::{CompositionError, PlanError};

/// Result of advancing a job or collection once.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Not yet terminal
    Pending,
    Succeeded,
    /// Terminal failure with every failing job
    Failed(Vec<JobFailure>),
}

impl Progress {
    pub fn is_pending(&self) -> bool {
        matches!(self, Progress::Pending)
    }
}

/// Per-job operations provided by the submission engine.
pub trait Dispatch {
    /// Submits a new job, polls a submitted one or applies the retry
    /// policy to a failed one. Terminated jobs are reported as-is.
    fn advance_job(&mut self, job: &mut Job) -> Progress;

    /// Requests backend termination of a submitted job.
    fn cancel_job(&mut self, job: &Job);

    /// Plans the run phase (and collect job) of a step once its init job
    /// has succeeded.
    fn plan_run(
        &mut self,
        step: &str,
    ) -> Result<(RunJobCollection, Option<CollectJob>), PlanError>;
}

/// A node of the execution tree.
pub trait Drive: Task {
    /// Advances every eligible job once and returns the aggregate outcome.
    fn advance(&mut self, dispatch: &mut dyn Dispatch) -> Progress;

    /// Recursively requests termination of every submitted, unterminated job.
    fn cancel(&mut self, dispatch: &mut dyn Dispatch);

    /// Visits every job of the subtree in execution order.
    fn visit_jobs(&self, visitor: &mut dyn FnMut(&Job));

    /// Number of jobs in the subtree.
    fn job_count(&self) -> usize {
        let mut count = 0;
        self.visit_jobs(&mut |_| count += 1);
        count
    }
}

impl Drive for Job {
    fn advance(&mut self, dispatch: &mut dyn Dispatch) -> Progress {
        dispatch.advance_job(self)
    }

    fn cancel(&mut self, dispatch: &mut dyn Dispatch) {
        if self.state().is_active() {
            dispatch.cancel_job(self);
        }
    }

    fn visit_jobs(&self, visitor: &mut dyn FnMut(&Job)) {
        visitor(self)
    }
}

/// Aggregate state of members running side by side.
fn parallel_state(states: Vec<JobState>) -> JobState {
    if states.iter().all(|s| s.is_terminated()) {
        let failed = states
            .iter()
            .filter(|s| !matches!(s, JobState::Terminated(Outcome::Success)))
            .count();
        return if failed == 0 {
            JobState::Terminated(Outcome::Success)
        } else {
            JobState::Terminated(Outcome::Failure {
                exit_code: None,
                diagnostic: format!("{} of {} members failed", failed, states.len()),
            })
        };
    }
    if states.iter().any(|s| matches!(s, JobState::Running)) {
        JobState::Running
    } else if states.iter().any(|s| matches!(s, JobState::Stopped)) {
        JobState::Stopped
    } else if states.iter().all(|s| matches!(s, JobState::New)) {
        JobState::New
    } else {
        JobState::Submitted
    }
}

/// Aggregate state of members running one after another: the state of the
/// first element that has not succeeded.
fn sequential_state(states: impl IntoIterator<Item = JobState>) -> JobState {
    states
        .into_iter()
        .find(|s| !matches!(s, JobState::Terminated(Outcome::Success)))
        .unwrap_or(JobState::Terminated(Outcome::Success))
}

fn check_step(collection: &str, expected: &str, member: &str, found: &str) -> Result<(), CompositionError> {
    if expected == found {
        Ok(())
    } else {
        Err(CompositionError::StepMismatch {
            collection: collection.to_string(),
            member: member.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}

/// Run jobs of one step sharing a phase index; all members run in parallel.
#[derive(Debug, Clone)]
pub struct SingleRunJobCollection {
    step: String,
    name: String,
    index: Option<u32>,
    submission_id: u64,
    jobs: Vec<RunJob>,
}

impl SingleRunJobCollection {
    pub fn new(step: impl Into<String>, index: Option<u32>, submission_id: u64) -> Self {
        let step = step.into();
        let name = match index {
            None => format!("{}_run", step),
            Some(index) => format!("{}_run-{:02}", step, index),
        };
        Self {
            step,
            name,
            index,
            submission_id,
            jobs: Vec::new(),
        }
    }

    /// Adds a run job of the same step and phase index.
    pub fn add(&mut self, job: RunJob) -> Result<(), CompositionError> {
        check_step(&self.name, &self.step, job.name(), job.step_name())?;
        if job.index() != self.index {
            return Err(CompositionError::IndexMismatch {
                collection: self.name.clone(),
                job: job.name().to_string(),
                expected: self.index,
                found: job.index(),
            });
        }
        if self.jobs.iter().any(|j| j.name() == job.name()) {
            return Err(CompositionError::Duplicate {
                collection: self.name.clone(),
                member: job.name().to_string(),
            });
        }
        self.jobs.push(job);
        Ok(())
    }

    /// Adds a job of unknown kind; anything but a run job is rejected.
    pub fn try_add(&mut self, job: Job) -> Result<(), CompositionError> {
        self.add(RunJob::try_from(job)?)
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn index(&self) -> Option<u32> {
        self.index
    }

    pub fn jobs(&self) -> &[RunJob] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Task for SingleRunJobCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> JobState {
        parallel_state(self.jobs.iter().map(|j| j.state()).collect())
    }
}

impl Drive for SingleRunJobCollection {
    fn advance(&mut self, dispatch: &mut dyn Dispatch) -> Progress {
        let mut pending = false;
        let mut failures = Vec::new();
        // No short-circuit: a failing sibling never holds back the others.
        for job in &mut self.jobs {
            match dispatch.advance_job(job.job_mut()) {
                Progress::Pending => pending = true,
                Progress::Succeeded => {}
                Progress::Failed(f) => failures.extend(f),
            }
        }
        if pending {
            Progress::Pending
        } else if failures.is_empty() {
            Progress::Succeeded
        } else {
            Progress::Failed(failures)
        }
    }

    fn cancel(&mut self, dispatch: &mut dyn Dispatch) {
        for job in &mut self.jobs {
            job.job_mut().cancel(dispatch);
        }
    }

    fn visit_jobs(&self, visitor: &mut dyn FnMut(&Job)) {
        for job in &self.jobs {
            visitor(job.as_job());
        }
    }
}

impl fmt::Display for SingleRunJobCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<SingleRunJobCollection(name={:?}, n={}, submission_id={})>",
            self.name,
            self.jobs.len(),
            self.submission_id
        )
    }
}

/// Successive run phases of one step, executed in order.
///
/// A phase is only advanced once the previous one succeeded; the first
/// failing phase ends the collection.
#[derive(Debug, Clone)]
pub struct MultiRunJobCollection {
    step: String,
    name: String,
    submission_id: u64,
    phases: Vec<SingleRunJobCollection>,
}

impl MultiRunJobCollection {
    pub fn new(step: impl Into<String>, submission_id: u64) -> Self {
        let step = step.into();
        let name = format!("{}_run", step);
        Self {
            step,
            name,
            submission_id,
            phases: Vec::new(),
        }
    }

    /// Appends a phase of the same step.
    pub fn add(&mut self, phase: SingleRunJobCollection) -> Result<(), CompositionError> {
        check_step(&self.name, &self.step, phase.name(), phase.step())?;
        if self.phases.iter().any(|p| p.name() == phase.name()) {
            return Err(CompositionError::Duplicate {
                collection: self.name.clone(),
                member: phase.name().to_string(),
            });
        }
        self.phases.push(phase);
        Ok(())
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn phases(&self) -> &[SingleRunJobCollection] {
        &self.phases
    }
}

impl Task for MultiRunJobCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> JobState {
        sequential_state(self.phases.iter().map(|p| p.state()))
    }
}

impl Drive for MultiRunJobCollection {
    fn advance(&mut self, dispatch: &mut dyn Dispatch) -> Progress {
        for phase in &mut self.phases {
            match phase.advance(dispatch) {
                Progress::Succeeded => {}
                other => return other,
            }
        }
        Progress::Succeeded
    }

    fn cancel(&mut self, dispatch: &mut dyn Dispatch) {
        for phase in &mut self.phases {
            phase.cancel(dispatch);
        }
    }

    fn visit_jobs(&self, visitor: &mut dyn FnMut(&Job)) {
        for phase in &self.phases {
            phase.visit_jobs(visitor);
        }
    }
}

impl fmt::Display for MultiRunJobCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<MultiRunJobCollection(name={:?}, n={}, submission_id={})>",
            self.name,
            self.phases.len(),
            self.submission_id
        )
    }
}

/// The run phase of a step, with one or several phase indices.
#[derive(Debug, Clone)]
pub enum RunJobCollection {
    Single(SingleRunJobCollection),
    Multi(MultiRunJobCollection),
}

impl RunJobCollection {
    pub fn step(&self) -> &str {
        match self {
            RunJobCollection::Single(c) => c.step(),
            RunJobCollection::Multi(c) => c.step(),
        }
    }

    fn as_drive(&self) -> &dyn Drive {
        match self {
            RunJobCollection::Single(c) => c,
            RunJobCollection::Multi(c) => c,
        }
    }

    fn as_drive_mut(&mut self) -> &mut dyn Drive {
        match self {
            RunJobCollection::Single(c) => c,
            RunJobCollection::Multi(c) => c,
        }
    }
}

impl From<SingleRunJobCollection> for RunJobCollection {
    fn from(collection: SingleRunJobCollection) -> Self {
        RunJobCollection::Single(collection)
    }
}

impl From<MultiRunJobCollection> for RunJobCollection {
    fn from(collection: MultiRunJobCollection) -> Self {
        RunJobCollection::Multi(collection)
    }
}

impl Task for RunJobCollection {
    fn name(&self) -> &str {
        self.as_drive().name()
    }

    fn state(&self) -> JobState {
        self.as_drive().state()
    }
}

impl Drive for RunJobCollection {
    fn advance(&mut self, dispatch: &mut dyn Dispatch) -> Progress {
        self.as_drive_mut().advance(dispatch)
    }

    fn cancel(&mut self, dispatch: &mut dyn Dispatch) {
        self.as_drive_mut().cancel(dispatch)
    }

    fn visit_jobs(&self, visitor: &mut dyn FnMut(&Job)) {
        self.as_drive().visit_jobs(visitor)
    }
}

/// Run phase followed by the collect job, for manual re-runs of one step.
#[derive(Debug, Clone)]
pub struct CliJobCollection {
    step: String,
    submission_id: u64,
    run: RunJobCollection,
    collect: Option<CollectJob>,
}

impl CliJobCollection {
    pub fn new(
        step: impl Into<String>,
        submission_id: u64,
        run: RunJobCollection,
        collect: Option<CollectJob>,
    ) -> Result<Self, CompositionError> {
        let step = step.into();
        check_step(&step, &step, run.name(), run.step())?;
        if let Some(collect) = &collect {
            check_step(&step, &step, collect.name(), collect.step_name())?;
        }
        Ok(Self {
            step,
            submission_id,
            run,
            collect,
        })
    }

    pub fn run(&self) -> &RunJobCollection {
        &self.run
    }

    pub fn collect(&self) -> Option<&CollectJob> {
        self.collect.as_ref()
    }
}

impl Task for CliJobCollection {
    fn name(&self) -> &str {
        &self.step
    }

    fn state(&self) -> JobState {
        let collect = self.collect.as_ref().map(|c| c.state());
        sequential_state(std::iter::once(self.run.state()).chain(collect))
    }
}

impl Drive for CliJobCollection {
    fn advance(&mut self, dispatch: &mut dyn Dispatch) -> Progress {
        match self.run.advance(dispatch) {
            Progress::Succeeded => {}
            other => return other,
        }
        match &mut self.collect {
            Some(collect) => dispatch.advance_job(collect.job_mut()),
            None => Progress::Succeeded,
        }
    }

    fn cancel(&mut self, dispatch: &mut dyn Dispatch) {
        self.run.cancel(dispatch);
        if let Some(collect) = &mut self.collect {
            collect.job_mut().cancel(dispatch);
        }
    }

    fn visit_jobs(&self, visitor: &mut dyn FnMut(&Job)) {
        self.run.visit_jobs(visitor);
        if let Some(collect) = &self.collect {
            visitor(collect.as_job());
        }
    }
}

impl fmt::Display for CliJobCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<CliJobCollection(name={:?}, submission_id={})>",
            self.step, self.submission_id
        )
    }
}

/// The init -> run -> collect sequence of one step.
///
/// The run phase usually depends on what the init job planned, so it may
/// be left out at construction and is then requested from the dispatcher
/// once the init job has succeeded.
#[derive(Debug, Clone)]
pub struct StepJobCollection {
    step: String,
    submission_id: u64,
    init: InitJob,
    run: Option<RunJobCollection>,
    collect: Option<CollectJob>,
    planning_failure: Option<JobFailure>,
}

impl StepJobCollection {
    pub fn new(init: InitJob) -> Self {
        Self {
            step: init.step_name().to_string(),
            submission_id: init.submission_id(),
            init,
            run: None,
            collect: None,
            planning_failure: None,
        }
    }

    /// Sets the run phase up front instead of planning it lazily.
    pub fn with_run(
        mut self,
        run: RunJobCollection,
        collect: Option<CollectJob>,
    ) -> Result<Self, CompositionError> {
        check_step(&self.step, &self.step, run.name(), run.step())?;
        if let Some(collect) = &collect {
            check_step(&self.step, &self.step, collect.name(), collect.step_name())?;
        }
        self.run = Some(run);
        self.collect = collect;
        Ok(self)
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn submission_id(&self) -> u64 {
        self.submission_id
    }

    pub fn init(&self) -> &InitJob {
        &self.init
    }

    /// Run phase, once planned.
    pub fn run(&self) -> Option<&RunJobCollection> {
        self.run.as_ref()
    }

    pub fn collect(&self) -> Option<&CollectJob> {
        self.collect.as_ref()
    }

    fn plan(&mut self, dispatch: &mut dyn Dispatch) -> Result<(), JobFailure> {
        match dispatch.plan_run(&self.step) {
            Ok((run, collect)) => {
                debug!("Planned run phase of step '{}': {} job(s)", self.step, run.job_count());
                self.run = Some(run);
                self.collect = collect;
                Ok(())
            }
            Err(e) => {
                warn!("Could not plan run phase of step '{}': {}", self.step, e);
                let failure = JobFailure {
                    job: format!("{}_run", self.step),
                    step: self.step.clone(),
                    cause: FailureCause::Planning(e.to_string()),
                    attempts: 1,
                };
                self.planning_failure = Some(failure.clone());
                Err(failure)
            }
        }
    }
}

impl Task for StepJobCollection {
    fn name(&self) -> &str {
        &self.step
    }

    fn state(&self) -> JobState {
        if let Some(failure) = &self.planning_failure {
            return JobState::Terminated(Outcome::Failure {
                exit_code: None,
                diagnostic: failure.to_string(),
            });
        }
        // An unplanned run phase counts as a new element.
        let run = self.run.as_ref().map_or(JobState::New, |r| r.state());
        let collect = self.collect.as_ref().map(|c| c.state());
        sequential_state([self.init.state(), run].into_iter().chain(collect))
    }
}

impl Drive for StepJobCollection {
    fn advance(&mut self, dispatch: &mut dyn Dispatch) -> Progress {
        if let Some(failure) = &self.planning_failure {
            return Progress::Failed(vec![failure.clone()]);
        }
        match dispatch.advance_job(self.init.job_mut()) {
            Progress::Succeeded => {}
            other => return other,
        }
        if self.run.is_none() {
            if let Err(failure) = self.plan(dispatch) {
                return Progress::Failed(vec![failure]);
            }
        }
        if let Some(run) = &mut self.run {
            match run.advance(dispatch) {
                Progress::Succeeded => {}
                other => return other,
            }
        }
        match &mut self.collect {
            Some(collect) => dispatch.advance_job(collect.job_mut()),
            None => Progress::Succeeded,
        }
    }

    fn cancel(&mut self, dispatch: &mut dyn Dispatch) {
        self.init.job_mut().cancel(dispatch);
        if let Some(run) = &mut self.run {
            run.cancel(dispatch);
        }
        if let Some(collect) = &mut self.collect {
            collect.job_mut().cancel(dispatch);
        }
    }

    fn visit_jobs(&self, visitor: &mut dyn FnMut(&Job)) {
        visitor(self.init.as_job());
        if let Some(run) = &self.run {
            run.visit_jobs(visitor);
        }
        if let Some(collect) = &self.collect {
            visitor(collect.as_job());
        }
    }
}

impl fmt::Display for StepJobCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<StepJobCollection(name={:?}, submission_id={})>",
            self.step, self.submission_id
        )
    }
}

/// All steps of one submission in canonical order.
#[derive(Debug, Clone)]
pub struct WorkflowJobCollection {
    name: String,
    submission_id: u64,
    steps: Vec<StepJobCollection>,
}

impl WorkflowJobCollection {
    pub fn new(submission_id: u64) -> Self {
        Self {
            name: format!("workflow_{}", submission_id),
            submission_id,
            steps: Vec::new(),
        }
    }

    pub fn add(&mut self, step: StepJobCollection) -> Result<(), CompositionError> {
        if self.steps.iter().any(|s| s.step() == step.step()) {
            return Err(CompositionError::Duplicate {
                collection: self.name.clone(),
                member: step.step().to_string(),
            });
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn submission_id(&self) -> u64 {
        self.submission_id
    }

    pub fn steps(&self) -> &[StepJobCollection] {
        &self.steps
    }
}

impl Task for WorkflowJobCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> JobState {
        sequential_state(self.steps.iter().map(|s| s.state()))
    }
}

impl Drive for WorkflowJobCollection {
    fn advance(&mut self, dispatch: &mut dyn Dispatch) -> Progress {
        for step in &mut self.steps {
            match step.advance(dispatch) {
                Progress::Succeeded => {}
                other => return other,
            }
        }
        Progress::Succeeded
    }

    fn cancel(&mut self, dispatch: &mut dyn Dispatch) {
        for step in &mut self.steps {
            step.cancel(dispatch);
        }
    }

    fn visit_jobs(&self, visitor: &mut dyn FnMut(&Job)) {
        for step in &self.steps {
            step.visit_jobs(visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::state::BackendStatus;
    use std::collections::HashMap;

    /// Submits new jobs, then terminates them on the next call with the
    /// scripted exit code (0 unless listed).
    #[derive(Default)]
    struct ScriptedDispatch {
        exit_codes: HashMap<String, i32>,
        submitted: Vec<String>,
        cancelled: Vec<String>,
        planned: Vec<String>,
        plans: HashMap<String, (RunJobCollection, Option<CollectJob>)>,
    }

    impl ScriptedDispatch {
        fn failing(mut self, job: &str, code: i32) -> Self {
            self.exit_codes.insert(job.to_string(), code);
            self
        }
    }

    impl Dispatch for ScriptedDispatch {
        fn advance_job(&mut self, job: &mut Job) -> Progress {
            match job.state() {
                JobState::New => {
                    self.submitted.push(job.name().to_string());
                    job.update_state(JobState::Submitted).unwrap();
                    Progress::Pending
                }
                JobState::Submitted | JobState::Running | JobState::Stopped => {
                    let exit_code = *self.exit_codes.get(job.name()).unwrap_or(&0);
                    let status = BackendStatus::Finished {
                        exit_code,
                        stderr: "FAILED\n".into(),
                    };
                    job.update_state(status.to_state()).unwrap();
                    self.advance_job(job)
                }
                JobState::Terminated(Outcome::Success) => Progress::Succeeded,
                JobState::Terminated(_) => Progress::Failed(job.failure().into_iter().collect()),
            }
        }

        fn cancel_job(&mut self, job: &Job) {
            self.cancelled.push(job.name().to_string());
        }

        fn plan_run(
            &mut self,
            step: &str,
        ) -> Result<(RunJobCollection, Option<CollectJob>), PlanError> {
            self.planned.push(step.to_string());
            self.plans
                .remove(step)
                .ok_or_else(|| PlanError::Missing(step.to_string()))
        }
    }

    fn run_job(step: &str, job_id: u32, index: Option<u32>) -> RunJob {
        RunJob::try_from(Job::run(step, vec![], "/log", job_id, index, 1, "alice")).unwrap()
    }

    fn single(step: &str, index: Option<u32>, n: u32) -> SingleRunJobCollection {
        let mut collection = SingleRunJobCollection::new(step, index, 1);
        for job_id in 1..=n {
            collection.add(run_job(step, job_id, index)).unwrap();
        }
        collection
    }

    fn collect_job(step: &str) -> CollectJob {
        CollectJob::try_from(Job::collect(step, vec![], "/log", 1, "alice")).unwrap()
    }

    fn init_job(step: &str) -> InitJob {
        InitJob::try_from(Job::init(step, vec![], "/log", 1, "alice")).unwrap()
    }

    fn drive(tree: &mut dyn Drive, dispatch: &mut ScriptedDispatch) -> Progress {
        for _ in 0..20 {
            let progress = tree.advance(dispatch);
            if !progress.is_pending() {
                return progress;
            }
        }
        Progress::Pending
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(SingleRunJobCollection::new("align", None, 1).name(), "align_run");
        assert_eq!(SingleRunJobCollection::new("align", Some(2), 1).name(), "align_run-02");
        assert_eq!(MultiRunJobCollection::new("align", 1).name(), "align_run");
    }

    #[test]
    fn test_single_rejects_other_step() {
        let mut collection = SingleRunJobCollection::new("align", None, 1);
        let err = collection.add(run_job("corilla", 1, None)).unwrap_err();
        assert!(matches!(err, CompositionError::StepMismatch { .. }));
        assert!(collection.is_empty());
    }

    #[test]
    fn test_single_rejects_other_index() {
        let mut collection = SingleRunJobCollection::new("align", Some(0), 1);
        let err = collection.add(run_job("align", 1, Some(1))).unwrap_err();
        assert!(matches!(err, CompositionError::IndexMismatch { .. }));
    }

    #[test]
    fn test_single_rejects_duplicates() {
        let mut collection = single("align", None, 1);
        let err = collection.add(run_job("align", 1, None)).unwrap_err();
        assert!(matches!(err, CompositionError::Duplicate { .. }));
    }

    #[test]
    fn test_try_add_rejects_collect_job() {
        let mut collection = SingleRunJobCollection::new("align", None, 1);
        let err = collection
            .try_add(Job::collect("align", vec![], "/log", 1, "alice"))
            .unwrap_err();
        assert!(matches!(err, CompositionError::WrongJobKind { expected: "run", .. }));
        assert_eq!(collection.len(), 0);
    }

    #[test]
    fn test_parallel_aggregation_reports_all_failures() {
        let mut collection = single("align", None, 4);
        let mut dispatch = ScriptedDispatch::default()
            .failing("align_run_000002", 1)
            .failing("align_run_000004", 1);

        let progress = drive(&mut collection, &mut dispatch);

        // Siblings of failing jobs still ran to completion
        assert_eq!(dispatch.submitted.len(), 4);
        match progress {
            Progress::Failed(failures) => {
                let names: Vec<_> = failures.iter().map(|f| f.job.as_str()).collect();
                assert_eq!(names, vec!["align_run_000002", "align_run_000004"]);
            }
            other => panic!("unexpected progress {:?}", other),
        }
        assert!(matches!(
            collection.state(),
            JobState::Terminated(Outcome::Failure { .. })
        ));
    }

    #[test]
    fn test_parallel_success() {
        let mut collection = single("align", None, 3);
        let mut dispatch = ScriptedDispatch::default();
        assert_eq!(drive(&mut collection, &mut dispatch), Progress::Succeeded);
        assert_eq!(collection.state(), JobState::Terminated(Outcome::Success));
    }

    #[test]
    fn test_empty_collection_succeeds() {
        let mut collection = SingleRunJobCollection::new("align", None, 1);
        let mut dispatch = ScriptedDispatch::default();
        assert_eq!(collection.advance(&mut dispatch), Progress::Succeeded);
        assert!(collection.is_terminated());
    }

    #[test]
    fn test_multi_run_aborts_after_failed_phase() {
        let mut multi = MultiRunJobCollection::new("jterator", 1);
        multi.add(single("jterator", Some(0), 2)).unwrap();
        multi.add(single("jterator", Some(1), 2)).unwrap();
        let mut dispatch = ScriptedDispatch::default().failing("jterator_run-00_000001", 1);

        let progress = drive(&mut multi, &mut dispatch);

        assert!(matches!(progress, Progress::Failed(ref f) if f.len() == 1));
        assert!(dispatch.submitted.iter().all(|n| n.starts_with("jterator_run-00_")));
        assert!(multi.phases()[1].is_new());
        assert!(multi.is_terminated());
    }

    #[test]
    fn test_multi_run_phases_in_order() {
        let mut multi = MultiRunJobCollection::new("jterator", 1);
        multi.add(single("jterator", Some(0), 2)).unwrap();
        multi.add(single("jterator", Some(1), 1)).unwrap();
        let mut dispatch = ScriptedDispatch::default();

        // First tick only submits the first phase
        assert!(multi.advance(&mut dispatch).is_pending());
        assert_eq!(dispatch.submitted, vec!["jterator_run-00_000001", "jterator_run-00_000002"]);

        assert_eq!(drive(&mut multi, &mut dispatch), Progress::Succeeded);
        assert_eq!(dispatch.submitted.last().unwrap(), "jterator_run-01_000001");
    }

    #[test]
    fn test_multi_rejects_other_step() {
        let mut multi = MultiRunJobCollection::new("jterator", 1);
        assert!(multi.add(single("align", Some(0), 1)).is_err());
    }

    #[test]
    fn test_cli_collection_runs_collect_last() {
        let run = RunJobCollection::from(single("align", None, 2));
        let mut cli = CliJobCollection::new("align", 1, run, Some(collect_job("align"))).unwrap();
        let mut dispatch = ScriptedDispatch::default();

        assert_eq!(drive(&mut cli, &mut dispatch), Progress::Succeeded);
        assert_eq!(dispatch.submitted.last().unwrap(), "align_collect");
        assert_eq!(cli.name(), "align");
        assert_eq!(cli.job_count(), 3);
    }

    #[test]
    fn test_cli_collection_rejects_foreign_collect() {
        let run = RunJobCollection::from(single("align", None, 1));
        let err = CliJobCollection::new("align", 1, run, Some(collect_job("corilla"))).unwrap_err();
        assert!(matches!(err, CompositionError::StepMismatch { .. }));
    }

    #[test]
    fn test_cli_collection_skips_collect_after_failure() {
        let run = RunJobCollection::from(single("align", None, 2));
        let mut cli = CliJobCollection::new("align", 1, run, Some(collect_job("align"))).unwrap();
        let mut dispatch = ScriptedDispatch::default().failing("align_run_000001", 1);

        assert!(matches!(drive(&mut cli, &mut dispatch), Progress::Failed(_)));
        assert!(!dispatch.submitted.contains(&"align_collect".to_string()));
    }

    #[test]
    fn test_step_plans_run_after_init() {
        let mut step = StepJobCollection::new(init_job("align"));
        let mut dispatch = ScriptedDispatch::default();
        dispatch.plans.insert(
            "align".into(),
            (single("align", None, 2).into(), Some(collect_job("align"))),
        );

        assert!(step.advance(&mut dispatch).is_pending());
        assert!(dispatch.planned.is_empty());
        assert!(step.run().is_none());

        assert_eq!(drive(&mut step, &mut dispatch), Progress::Succeeded);
        assert_eq!(dispatch.planned, vec!["align"]);
        assert_eq!(
            dispatch.submitted,
            vec!["align_init", "align_run_000001", "align_run_000002", "align_collect"]
        );
    }

    #[test]
    fn test_step_collection_carries_submission_id() {
        let step = StepJobCollection::new(init_job("align"));
        assert_eq!(step.submission_id(), 1);
        assert_eq!(
            step.to_string(),
            "<StepJobCollection(name=\"align\", submission_id=1)>"
        );
    }

    #[test]
    fn test_step_planning_failure() {
        let mut step = StepJobCollection::new(init_job("corilla"));
        let mut dispatch = ScriptedDispatch::default();

        match drive(&mut step, &mut dispatch) {
            Progress::Failed(failures) => {
                assert_eq!(failures[0].job, "corilla_run");
                assert!(matches!(failures[0].cause, FailureCause::Planning(_)));
            }
            other => panic!("unexpected progress {:?}", other),
        }
        assert!(step.is_terminated());
        // Not planned twice
        step.advance(&mut dispatch);
        assert_eq!(dispatch.planned.len(), 1);
    }

    #[test]
    fn test_step_with_run_rejects_foreign_run() {
        let step = StepJobCollection::new(init_job("align"));
        assert!(step.with_run(single("corilla", None, 1).into(), None).is_err());
    }

    #[test]
    fn test_workflow_aborts_on_failed_step() {
        let mut workflow = WorkflowJobCollection::new(1);
        workflow
            .add(StepJobCollection::new(init_job("corilla")).with_run(single("corilla", None, 1).into(), None).unwrap())
            .unwrap();
        workflow
            .add(StepJobCollection::new(init_job("align")).with_run(single("align", None, 1).into(), None).unwrap())
            .unwrap();
        let mut dispatch = ScriptedDispatch::default().failing("corilla_init", 1);

        assert!(matches!(drive(&mut workflow, &mut dispatch), Progress::Failed(_)));
        assert_eq!(dispatch.submitted, vec!["corilla_init"]);
        assert!(workflow.is_terminated());
    }

    #[test]
    fn test_workflow_rejects_duplicate_step() {
        let mut workflow = WorkflowJobCollection::new(1);
        workflow.add(StepJobCollection::new(init_job("align"))).unwrap();
        assert!(workflow.add(StepJobCollection::new(init_job("align"))).is_err());
    }

    #[test]
    fn test_cancel_only_active_jobs() {
        let mut collection = single("align", None, 3);
        let mut dispatch = ScriptedDispatch::default();

        // Submit all, then terminate the first one only
        collection.advance(&mut dispatch);
        dispatch.advance_job(collection.jobs[0].job_mut());
        collection.add(run_job("align", 4, None)).unwrap();

        collection.cancel(&mut dispatch);
        assert_eq!(dispatch.cancelled, vec!["align_run_000002", "align_run_000003"]);
    }

    #[test]
    fn test_aggregate_states() {
        assert_eq!(parallel_state(vec![JobState::New, JobState::New]), JobState::New);
        assert_eq!(parallel_state(vec![JobState::New, JobState::Running]), JobState::Running);
        assert_eq!(parallel_state(vec![JobState::Submitted, JobState::Stopped]), JobState::Stopped);
        assert_eq!(parallel_state(vec![]), JobState::Terminated(Outcome::Success));
        assert_eq!(
            sequential_state(vec![JobState::Terminated(Outcome::Success), JobState::Running]),
            JobState::Running
        );
    }
}
