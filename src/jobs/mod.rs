//! Jobs and Job Collections
//!
//! # Structure
//!
//! - [`state`]: Job state machine and backend status mapping
//! - [`model`]: Jobs, naming and typed role wrappers
//! - [`collection`]: Parallel and sequential job collections
//! - [`compose`]: Building the job tree of a submission
//! - [`descriptor`]: Per-job descriptors handed to workers

pub mod collection;
pub mod compose;
pub mod descriptor;
pub mod model;
pub mod state;

pub use collection::{
    CliJobCollection, Dispatch, Drive, MultiRunJobCollection, Progress, RunJobCollection,
    SingleRunJobCollection, StepJobCollection, WorkflowJobCollection,
};
pub use compose::{
    Batch, Composer, ManifestPlanner, RunPlan, StaticPlanner, StepPlanner, SubmissionContext,
};
pub use descriptor::JobDescriptor;
pub use model::{
    job_name, CollectJob, FailureCause, InitJob, Job, JobFailure, JobKind, Phase, RunJob, Task,
};
pub use state::{BackendStatus, JobState, Outcome};
