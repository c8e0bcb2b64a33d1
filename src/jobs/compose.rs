//! Job Tree Composition
//!
//! Turns a validated workflow description into the job tree of one
//! submission. Only init jobs can be built up front: what the run phase of
//! a step looks like is decided by its init job, so run collections are
//! built from a [`RunPlan`] once the init job has succeeded.
//!
//! # Layout
//!
//! ```text
//! <workflow_dir>/<step>/log/                    job logs
//! <workflow_dir>/<step>/batches/manifest.json   run plan written by init
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::collection::{
    CliJobCollection, MultiRunJobCollection, RunJobCollection, SingleRunJobCollection,
    StepJobCollection, WorkflowJobCollection,
};
use super::model::{CollectJob, InitJob, Job, RunJob, TIMESTAMP_FORMAT};
use crate::error::{CompositionError, PlanError};
use crate::workflow::{Registry, StepDescription, WorkflowDescription};

/// Payload of one run job as decided by the step's init phase.
pub type Batch = Map<String, Value>;

/// Identity shared by every job of one submission.
#[derive(Debug, Clone)]
pub struct SubmissionContext {
    pub submission_id: u64,
    pub user_name: String,
    pub workflow_dir: PathBuf,
    /// Stamped into every log file name
    pub timestamp: String,
}

impl SubmissionContext {
    pub fn new(
        submission_id: u64,
        user_name: impl Into<String>,
        workflow_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            submission_id,
            user_name: user_name.into(),
            workflow_dir: workflow_dir.into(),
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }
}

/// Batches of the run phases of one step.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunPlan {
    /// One entry per run phase, each a list of batches
    #[serde(rename = "run")]
    pub phases: Vec<Vec<Batch>>,
}

impl RunPlan {
    /// A single run phase.
    pub fn single(batches: Vec<Batch>) -> Self {
        Self {
            phases: vec![batches],
        }
    }

    /// A single run phase of `n` jobs without payload.
    pub fn uniform(n: usize) -> Self {
        Self::single(vec![Batch::new(); n])
    }

    pub fn job_count(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }
}

/// Source of run plans, implemented by whatever knows a step's batches.
pub trait StepPlanner {
    fn plan(&self, step: &str) -> Result<RunPlan, PlanError>;
}

/// In-memory plans, optionally with a fallback for unlisted steps.
#[derive(Debug, Clone, Default)]
pub struct StaticPlanner {
    plans: HashMap<String, RunPlan>,
    default: Option<RunPlan>,
}

impl StaticPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, step: impl Into<String>, plan: RunPlan) -> Self {
        self.plans.insert(step.into(), plan);
        self
    }

    pub fn with_default(mut self, plan: RunPlan) -> Self {
        self.default = Some(plan);
        self
    }
}

impl StepPlanner for StaticPlanner {
    fn plan(&self, step: &str) -> Result<RunPlan, PlanError> {
        self.plans
            .get(step)
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| PlanError::Missing(step.to_string()))
    }
}

/// Reads the manifest an init job leaves in the step's batch directory.
#[derive(Debug, Clone)]
pub struct ManifestPlanner {
    workflow_dir: PathBuf,
}

impl ManifestPlanner {
    pub fn new(workflow_dir: impl Into<PathBuf>) -> Self {
        Self {
            workflow_dir: workflow_dir.into(),
        }
    }

    pub fn manifest_path(&self, step: &str) -> PathBuf {
        self.workflow_dir
            .join(step)
            .join("batches")
            .join("manifest.json")
    }
}

impl StepPlanner for ManifestPlanner {
    fn plan(&self, step: &str) -> Result<RunPlan, PlanError> {
        let path = self.manifest_path(step);
        debug!("Reading run plan from: {}", path.display());

        let content = fs::read_to_string(&path).map_err(|source| PlanError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| PlanError::Malformed {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Renders step arguments as command line options.
///
/// `true` becomes a bare flag, `false` and unset values are left out.
pub fn format_arguments(args: &std::collections::BTreeMap<String, Value>) -> Vec<String> {
    let mut out = Vec::new();
    for (name, value) in args {
        let flag = format!("--{}", name);
        match value {
            Value::Null | Value::Bool(false) => {}
            Value::Bool(true) => out.push(flag),
            Value::String(s) => {
                out.push(flag);
                out.push(s.clone());
            }
            other => {
                out.push(flag);
                out.push(other.to_string());
            }
        }
    }
    out
}

/// Builds the jobs and collections of one submission.
#[derive(Debug, Clone)]
pub struct Composer {
    context: SubmissionContext,
    registry: Registry,
}

impl Composer {
    /// Creates a composer for the canonical registry.
    pub fn new(context: SubmissionContext) -> Self {
        Self {
            context,
            registry: Registry::canonical().clone(),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn context(&self) -> &SubmissionContext {
        &self.context
    }

    /// Directory holding the log files of a step's jobs.
    pub fn output_dir(&self, step: &str) -> PathBuf {
        self.context.workflow_dir.join(step).join("log")
    }

    fn job(&self, job: Job) -> Job {
        job.with_timestamp(self.context.timestamp.clone())
    }

    pub fn init_job(&self, step: &StepDescription) -> Result<InitJob, CompositionError> {
        let mut arguments = vec![step.name().to_string(), "init".to_string()];
        arguments.extend(format_arguments(step.resolved_args()));
        let job = Job::init(
            step.name(),
            arguments,
            self.output_dir(step.name()),
            self.context.submission_id,
            self.context.user_name.as_str(),
        );
        InitJob::try_from(self.job(job))
    }

    pub fn run_job(
        &self,
        step: &str,
        job_id: u32,
        index: Option<u32>,
        batch: Batch,
    ) -> Result<RunJob, CompositionError> {
        let mut arguments = vec![
            step.to_string(),
            "run".to_string(),
            "--job".to_string(),
            job_id.to_string(),
        ];
        if let Some(index) = index {
            arguments.push("--index".to_string());
            arguments.push(index.to_string());
        }
        let job = Job::run(
            step,
            arguments,
            self.output_dir(step),
            job_id,
            index,
            self.context.submission_id,
            self.context.user_name.as_str(),
        )
        .with_payload(batch);
        RunJob::try_from(self.job(job))
    }

    pub fn collect_job(&self, step: &str) -> Result<CollectJob, CompositionError> {
        let job = Job::collect(
            step,
            vec![step.to_string(), "collect".to_string()],
            self.output_dir(step),
            self.context.submission_id,
            self.context.user_name.as_str(),
        );
        CollectJob::try_from(self.job(job))
    }

    fn single_collection(
        &self,
        step: &str,
        index: Option<u32>,
        batches: Vec<Batch>,
    ) -> Result<SingleRunJobCollection, CompositionError> {
        let mut collection =
            SingleRunJobCollection::new(step, index, self.context.submission_id);
        for (job_id, batch) in (1u32..).zip(batches) {
            collection.add(self.run_job(step, job_id, index, batch)?)?;
        }
        Ok(collection)
    }

    /// Builds the run collection of a step and its collect job, if the
    /// registry says the step has one.
    pub fn plan_step(
        &self,
        step: &str,
        plan: RunPlan,
    ) -> Result<(RunJobCollection, Option<CollectJob>), CompositionError> {
        let spec = self
            .registry
            .find_step(step)
            .ok_or_else(|| CompositionError::UnknownStep(step.to_string()))?;

        let run = if plan.phases.len() <= 1 {
            let batches = plan.phases.into_iter().next().unwrap_or_default();
            RunJobCollection::from(self.single_collection(step, None, batches)?)
        } else {
            let mut multi = MultiRunJobCollection::new(step, self.context.submission_id);
            for (index, batches) in (0u32..).zip(plan.phases) {
                multi.add(self.single_collection(step, Some(index), batches)?)?;
            }
            RunJobCollection::from(multi)
        };

        let collect = if spec.has_collect {
            Some(self.collect_job(step)?)
        } else {
            None
        };
        Ok((run, collect))
    }

    /// Builds the init-first collection of a step; the run phase is
    /// planned once the init job has succeeded.
    pub fn step_collection(
        &self,
        step: &StepDescription,
    ) -> Result<StepJobCollection, CompositionError> {
        Ok(StepJobCollection::new(self.init_job(step)?))
    }

    /// Builds the tree of a whole workflow, one step collection per step.
    pub fn workflow_collection(
        &self,
        description: &WorkflowDescription,
    ) -> Result<WorkflowJobCollection, CompositionError> {
        let mut workflow = WorkflowJobCollection::new(self.context.submission_id);
        for step in description.steps() {
            workflow.add(self.step_collection(step)?)?;
        }
        info!(
            "Composed workflow of {} steps for submission {}",
            workflow.steps().len(),
            self.context.submission_id
        );
        Ok(workflow)
    }

    /// Builds a run + collect pairing for a manual re-run of one step.
    pub fn cli_collection(
        &self,
        step: &str,
        plan: RunPlan,
    ) -> Result<CliJobCollection, CompositionError> {
        let (run, collect) = self.plan_step(step, plan)?;
        CliJobCollection::new(step, self.context.submission_id, run, collect)
    }
}

/// Location of a step's batch manifest under a workflow directory.
pub fn manifest_path(workflow_dir: &Path, step: &str) -> PathBuf {
    ManifestPlanner::new(workflow_dir).manifest_path(step)
}
