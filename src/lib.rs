//! tmflow - Workflow Job-Tree Compiler and Submission Engine
//!
//! Turns a declarative description of an image-analysis workflow into a
//! hierarchical tree of cluster jobs and drives that tree to completion,
//! honoring stage and step ordering, retrying transient failures and
//! keeping an audit report of every state change.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Step registry, workflow descriptions and their validation
//! - [`jobs`]: Job model, lifecycle states and the job-tree collections
//! - [`execution`]: Backends, retry policy and the submission engine
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use tmflow::config::EngineConfig;
//! use tmflow::execution::{DryRunBackend, SubmissionEngine};
//! use tmflow::jobs::{Composer, RunPlan, StaticPlanner, SubmissionContext};
//! use tmflow::load_description;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load and validate a workflow description
//!     let description = load_description("workflow.yaml")?;
//!
//!     // Compile it into a job tree
//!     let composer = Composer::new(SubmissionContext::new(1, "alice", "/data/experiment"));
//!     let mut tree = composer.workflow_collection(&description)?;
//!
//!     // Preview the submission
//!     let planner = StaticPlanner::new().with_default(RunPlan::uniform(1));
//!     let mut engine =
//!         SubmissionEngine::new(DryRunBackend::new(), composer, planner, EngineConfig::default());
//!     engine.run(&mut tree)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod jobs;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use execution::engine::SubmissionEngine;
pub use jobs::{Composer, JobState, SubmissionContext, WorkflowJobCollection};
pub use workflow::parser::load_description;
pub use workflow::{Registry, WorkflowDescription};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "tmflow";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Drive, Task};

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "tmflow");
    }

    #[test]
    fn test_module_exports_registry() {
        let registry = Registry::canonical();
        assert!(!registry.stages().is_empty());
    }

    #[test]
    fn test_module_exports_workflow_collection() {
        let tree = WorkflowJobCollection::new(7);
        assert_eq!(tree.name(), "workflow_7");
        assert_eq!(tree.job_count(), 0);
        assert_eq!(tree.state(), JobState::Terminated(jobs::Outcome::Success));
    }
}
