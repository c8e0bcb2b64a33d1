//! Workflow Description Module
//!
//! Validates declarative workflow descriptions against the canonical
//! stage/step registry.
//!
//! # Structure
//!
//! - [`registry`]: Canonical stages, steps and argument schemas
//! - [`description`]: Validated, immutable description
//! - [`validator`]: Shape, name, order and argument checks
//! - [`parser`]: YAML loading and saving

pub mod description;
pub mod parser;
pub mod registry;
pub mod validator;

pub use description::{ArgsForm, StageDescription, StepDescription, WorkflowDescription};
pub use parser::{load_description, load_description_with, parse_description, save_description};
pub use registry::{ArgSpec, ArgType, Registry, StageSpec, StepSpec};
pub use validator::{validate, validate_canonical, ValidationError};
