//! Workflow Description Validation
//!
//! Turns an untyped nested structure into a [`WorkflowDescription`].
//! Checks run in a fixed order:
//! 1. Shape (required keys, container kinds)
//! 2. Stage and step names against the registry
//! 3. Exact canonical order of stages and of steps within each stage
//! 4. Argument names and types against each step's schema
//!
//! Validation is pure: no filesystem or network access.

use std::collections::BTreeMap;

use log::{debug, info};
use serde_json::{Map, Value};
use thiserror::Error;

use super::description::{ArgsForm, StageDescription, StepDescription, WorkflowDescription};
use super::registry::{ArgType, Registry};

/// Key on stages and steps that editing tools may inject.
const DISPLAY_NAME_KEY: &str = "display_name";

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{path}: expected {expected}, found {found}")]
    Type {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{path}: missing required key '{key}'")]
    MissingKey { path: String, key: String },
    #[error("{path}: unexpected key '{key}'")]
    UnexpectedKey { path: String, key: String },
    #[error("stage '{0}' has no steps")]
    EmptySteps(String),
    #[error("unknown stage '{0}'")]
    UnknownStage(String),
    #[error("stage '{stage}' has no step '{step}'")]
    UnknownStep { stage: String, step: String },
    #[error("stages must be {expected:?} in this order, got {found:?}")]
    StageOrder {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("steps of stage '{stage}' must be {expected:?} in this order, got {found:?}")]
    StepOrder {
        stage: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("step '{step}' has no argument '{arg}'")]
    UnknownArgument { step: String, arg: String },
    #[error("argument '{arg}' of step '{step}' must have type {expected}")]
    ArgumentType {
        step: String,
        arg: String,
        expected: ArgType,
    },
    #[error("step '{step}' requires argument '{arg}'")]
    MissingArgument { step: String, arg: String },
}

/// Shape-checked stage, names not yet verified.
struct RawStage<'a> {
    name: &'a str,
    display_name: Option<String>,
    steps: Vec<RawStep<'a>>,
}

/// Shape-checked step, names not yet verified.
struct RawStep<'a> {
    name: &'a str,
    display_name: Option<String>,
    args: Option<&'a Map<String, Value>>,
    args_form: ArgsForm,
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

fn as_mapping<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, ValidationError> {
    value.as_object().ok_or_else(|| ValidationError::Type {
        path: path.to_string(),
        expected: "mapping",
        found: kind_of(value),
    })
}

fn as_sequence<'a>(value: &'a Value, path: &str) -> Result<&'a Vec<Value>, ValidationError> {
    value.as_array().ok_or_else(|| ValidationError::Type {
        path: path.to_string(),
        expected: "sequence",
        found: kind_of(value),
    })
}

fn required<'a>(
    map: &'a Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<&'a Value, ValidationError> {
    map.get(key).ok_or_else(|| ValidationError::MissingKey {
        path: path.to_string(),
        key: key.to_string(),
    })
}

fn name_of<'a>(map: &'a Map<String, Value>, path: &str) -> Result<&'a str, ValidationError> {
    let value = required(map, "name", path)?;
    value.as_str().ok_or_else(|| ValidationError::Type {
        path: format!("{}.name", path),
        expected: "string",
        found: kind_of(value),
    })
}

fn display_name_of(map: &Map<String, Value>, path: &str) -> Result<Option<String>, ValidationError> {
    match map.get(DISPLAY_NAME_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ValidationError::Type {
            path: format!("{}.{}", path, DISPLAY_NAME_KEY),
            expected: "string",
            found: kind_of(other),
        }),
    }
}

fn reject_unexpected_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    path: &str,
) -> Result<(), ValidationError> {
    match map.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(ValidationError::UnexpectedKey {
            path: path.to_string(),
            key: key.clone(),
        }),
        None => Ok(()),
    }
}

/// Check 1: container kinds and required keys.
fn parse_shape(value: &Value) -> Result<Vec<RawStage<'_>>, ValidationError> {
    let root = as_mapping(value, "workflow")?;
    let stages = required(root, "stages", "workflow")?;
    reject_unexpected_keys(root, &["stages"], "workflow")?;

    let mut raw_stages = Vec::new();
    for (i, stage) in as_sequence(stages, "workflow.stages")?.iter().enumerate() {
        let path = format!("workflow.stages[{}]", i);
        let stage = as_mapping(stage, &path)?;
        reject_unexpected_keys(stage, &["name", "steps", DISPLAY_NAME_KEY], &path)?;
        let name = name_of(stage, &path)?;
        let display_name = display_name_of(stage, &path)?;

        let steps_path = format!("{}.steps", path);
        let steps = as_sequence(required(stage, "steps", &path)?, &steps_path)?;
        if steps.is_empty() {
            return Err(ValidationError::EmptySteps(name.to_string()));
        }

        let mut raw_steps = Vec::new();
        for (j, step) in steps.iter().enumerate() {
            let path = format!("{}[{}]", steps_path, j);
            let step = as_mapping(step, &path)?;
            reject_unexpected_keys(step, &["name", "args", DISPLAY_NAME_KEY], &path)?;
            let name = name_of(step, &path)?;
            let display_name = display_name_of(step, &path)?;
            let (args, args_form) = match step.get("args") {
                None => (None, ArgsForm::Absent),
                Some(Value::Null) => (None, ArgsForm::Null),
                Some(args) => (
                    Some(as_mapping(args, &format!("{}.args", path))?),
                    ArgsForm::Map,
                ),
            };
            raw_steps.push(RawStep {
                name,
                display_name,
                args,
                args_form,
            });
        }

        raw_stages.push(RawStage {
            name,
            display_name,
            steps: raw_steps,
        });
    }

    Ok(raw_stages)
}

/// Check 2: every name is known to the registry.
fn check_names(stages: &[RawStage<'_>], registry: &Registry) -> Result<(), ValidationError> {
    for stage in stages {
        if registry.stage(stage.name).is_none() {
            return Err(ValidationError::UnknownStage(stage.name.to_string()));
        }
        for step in &stage.steps {
            if registry.step(stage.name, step.name).is_none() {
                return Err(ValidationError::UnknownStep {
                    stage: stage.name.to_string(),
                    step: step.name.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Check 3: sequences equal the canonical ones exactly.
fn check_order(stages: &[RawStage<'_>], registry: &Registry) -> Result<(), ValidationError> {
    let found: Vec<&str> = stages.iter().map(|s| s.name).collect();
    let expected = registry.stage_names();
    if found != expected {
        return Err(ValidationError::StageOrder {
            expected: expected.iter().map(|s| s.to_string()).collect(),
            found: found.iter().map(|s| s.to_string()).collect(),
        });
    }

    for stage in stages {
        let found: Vec<&str> = stage.steps.iter().map(|s| s.name).collect();
        let expected = registry.step_names(stage.name);
        if found != expected {
            return Err(ValidationError::StepOrder {
                stage: stage.name.to_string(),
                expected: expected.iter().map(|s| s.to_string()).collect(),
                found: found.iter().map(|s| s.to_string()).collect(),
            });
        }
    }
    Ok(())
}

/// Check 4: argument names, types and required arguments.
///
/// Returns the supplied arguments and the arguments resolved with defaults.
fn check_args(
    stage: &str,
    step: &RawStep<'_>,
    registry: &Registry,
) -> Result<(BTreeMap<String, Value>, BTreeMap<String, Value>), ValidationError> {
    let spec = registry
        .step(stage, step.name)
        .ok_or_else(|| ValidationError::UnknownStep {
            stage: stage.to_string(),
            step: step.name.to_string(),
        })?;

    let supplied: BTreeMap<String, Value> = step
        .args
        .map(|args| args.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    for (key, value) in &supplied {
        let arg = spec
            .arg_spec(key)
            .ok_or_else(|| ValidationError::UnknownArgument {
                step: step.name.to_string(),
                arg: key.clone(),
            })?;
        if !value.is_null() && !arg.kind.matches(value) {
            return Err(ValidationError::ArgumentType {
                step: step.name.to_string(),
                arg: key.clone(),
                expected: arg.kind,
            });
        }
    }

    let mut resolved = BTreeMap::new();
    for arg in &spec.args {
        match supplied.get(arg.name).filter(|v| !v.is_null()) {
            Some(value) => {
                resolved.insert(arg.name.to_string(), value.clone());
            }
            None if arg.required => {
                return Err(ValidationError::MissingArgument {
                    step: step.name.to_string(),
                    arg: arg.name.to_string(),
                });
            }
            None => {
                if let Some(default) = &arg.default {
                    debug!("Step '{}': {} defaults to {}", step.name, arg.name, default);
                    resolved.insert(arg.name.to_string(), default.clone());
                }
            }
        }
    }

    Ok((supplied, resolved))
}

/// Validates a workflow description against a registry.
///
/// # Returns
///
/// * `Ok(WorkflowDescription)` - Immutable, validated description
/// * `Err(ValidationError)` - First violation found
pub fn validate(value: &Value, registry: &Registry) -> Result<WorkflowDescription, ValidationError> {
    let raw = parse_shape(value)?;
    check_names(&raw, registry)?;
    check_order(&raw, registry)?;

    let mut stages = Vec::with_capacity(raw.len());
    for stage in raw {
        let mut steps = Vec::with_capacity(stage.steps.len());
        for step in &stage.steps {
            let (args, resolved) = check_args(stage.name, step, registry)?;
            steps.push(StepDescription::new(
                step.name.to_string(),
                step.display_name.clone(),
                args,
                step.args_form,
                resolved,
            ));
        }
        stages.push(StageDescription::new(
            stage.name.to_string(),
            stage.display_name,
            steps,
        ));
    }

    let description = WorkflowDescription::new(stages);
    info!(
        "Workflow description validated: {} stages, {} steps",
        description.stages().len(),
        description.steps().count()
    );
    Ok(description)
}

/// Validates against the canonical registry.
pub fn validate_canonical(value: &Value) -> Result<WorkflowDescription, ValidationError> {
    validate(value, Registry::canonical())
}

/// Test fixture: a complete canonical description with only required args.
#[cfg(test)]
pub(crate) fn canonical_fixture() -> Value {
    serde_json::json!({
        "stages": [
            {
                "name": "image_conversion",
                "steps": [
                    {"name": "metaextract", "args": {}},
                    {"name": "metaconfig", "args": {}},
                    {"name": "imextract", "args": {}}
                ]
            },
            {
                "name": "image_preprocessing",
                "steps": [
                    {"name": "corilla", "args": {}},
                    {"name": "align", "args": {"ref_cycle": 0, "ref_channel": 1}}
                ]
            },
            {
                "name": "pyramid_creation",
                "steps": [{"name": "illuminati", "args": {}}]
            },
            {
                "name": "image_analysis",
                "steps": [{"name": "jterator", "args": {"pipeline": "cells"}}]
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::registry::{StageSpec, StepSpec};
    use serde_json::json;

    fn set(value: &mut Value, pointer: &str, new: Value) {
        *value.pointer_mut(pointer).unwrap() = new;
    }

    #[test]
    fn test_valid_canonical_description() {
        let workflow = validate_canonical(&canonical_fixture()).unwrap();

        assert_eq!(workflow.stages().len(), 4);
        assert_eq!(workflow.steps().count(), 7);
        assert_eq!(workflow.stages()[0].steps()[0].name(), "metaextract");
    }

    #[test]
    fn test_round_trip_reproduces_input() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/0/steps/1/args", json!({"file_format": "cellvoyager", "regex": null}));

        let workflow = validate_canonical(&input).unwrap();
        assert_eq!(workflow.to_value().unwrap(), input);
    }

    #[test]
    fn test_round_trip_keeps_missing_and_null_args() {
        let mut input = canonical_fixture();
        input["stages"][1]["steps"][0] = json!({"name": "corilla"});
        set(&mut input, "/stages/2/steps/0/args", Value::Null);

        let workflow = validate_canonical(&input).unwrap();
        assert_eq!(workflow.step("corilla").unwrap().args_form(), ArgsForm::Absent);
        assert_eq!(workflow.step("illuminati").unwrap().args_form(), ArgsForm::Null);
        assert_eq!(workflow.to_value().unwrap(), input);
    }

    #[test]
    fn test_round_trip_strips_display_names() {
        let expected = canonical_fixture();
        let mut input = expected.clone();
        input["stages"][0]["display_name"] = json!("Image conversion");
        input["stages"][0]["steps"][0]["display_name"] = json!("Extract metadata");

        let workflow = validate_canonical(&input).unwrap();
        assert_eq!(workflow.stages()[0].display_name(), Some("Image conversion"));
        assert_eq!(workflow.to_value().unwrap(), expected);
    }

    #[test]
    fn test_defaults_resolved_but_not_serialized() {
        let workflow = validate_canonical(&canonical_fixture()).unwrap();
        let metaconfig = workflow.step("metaconfig").unwrap();

        assert!(metaconfig.args().is_empty());
        assert_eq!(metaconfig.resolved_args()["file_format"], json!("default"));
        assert!(!metaconfig.resolved_args().contains_key("regex"));
    }

    #[test]
    fn test_null_args_treated_as_empty() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/0/steps/0/args", Value::Null);

        let workflow = validate_canonical(&input).unwrap();
        assert!(workflow.step("metaextract").unwrap().args().is_empty());
        assert_eq!(
            workflow.step("metaextract").unwrap().resolved_args()["batch_size"],
            json!(100)
        );
    }

    #[test]
    fn test_stage_order_violation() {
        let mut input = canonical_fixture();
        let stages = input["stages"].as_array_mut().unwrap();
        stages.swap(0, 1);

        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(err, ValidationError::StageOrder { .. }));
    }

    #[test]
    fn test_missing_stage_fails() {
        let mut input = canonical_fixture();
        input["stages"].as_array_mut().unwrap().pop();

        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(err, ValidationError::StageOrder { .. }));
    }

    #[test]
    fn test_step_order_violation() {
        let mut input = canonical_fixture();
        input["stages"][0]["steps"].as_array_mut().unwrap().swap(0, 1);

        let err = validate_canonical(&input).unwrap_err();
        match err {
            ValidationError::StepOrder { stage, found, .. } => {
                assert_eq!(stage, "image_conversion");
                assert_eq!(found[0], "metaconfig");
            }
            other => panic!("Expected StepOrder, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_argument() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/0/steps/1", json!({"name": "metaconfig", "args": {"bla": null}}));

        let err = validate_canonical(&input).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownArgument {
                step: "metaconfig".into(),
                arg: "bla".into()
            }
        );
    }

    #[test]
    fn test_argument_type_mismatch() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/0/steps/0/args", json!({"batch_size": "ten"}));

        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ArgumentType { expected: ArgType::Int, .. }
        ));
    }

    #[test]
    fn test_missing_required_argument() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/1/steps/1/args", json!({"ref_cycle": 0}));

        let err = validate_canonical(&input).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingArgument {
                step: "align".into(),
                arg: "ref_channel".into()
            }
        );
    }

    #[test]
    fn test_unknown_stage_name() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/2/name", json!("bla"));

        let err = validate_canonical(&input).unwrap_err();
        assert_eq!(err, ValidationError::UnknownStage("bla".into()));
    }

    #[test]
    fn test_unknown_step_name() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/2/steps/0/name", json!("bla"));

        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownStep { .. }));
    }

    #[test]
    fn test_stages_must_be_sequence() {
        let input = json!({
            "stages": {"name": "image_conversion", "steps": [{"name": "metaextract", "args": {}}]}
        });

        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Type { expected: "sequence", found: "mapping", .. }
        ));
    }

    #[test]
    fn test_missing_stages_key() {
        let input = json!({"bla": []});
        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(err, ValidationError::MissingKey { .. }));
    }

    #[test]
    fn test_unexpected_top_level_key() {
        let mut input = canonical_fixture();
        input["bla"] = Value::Null;

        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(err, ValidationError::UnexpectedKey { .. }));
    }

    #[test]
    fn test_empty_steps() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/0/steps", json!([]));

        let err = validate_canonical(&input).unwrap_err();
        assert_eq!(err, ValidationError::EmptySteps("image_conversion".into()));
    }

    #[test]
    fn test_step_must_be_mapping() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/0/steps/0", json!([]));

        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(err, ValidationError::Type { expected: "mapping", .. }));
    }

    #[test]
    fn test_args_must_be_mapping() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/0/steps/1/args", json!([1, 2]));

        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(err, ValidationError::Type { expected: "mapping", .. }));
    }

    #[test]
    fn test_step_name_must_be_string() {
        let mut input = canonical_fixture();
        set(&mut input, "/stages/0/steps/0/name", json!(1));

        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(err, ValidationError::Type { expected: "string", .. }));
    }

    #[test]
    fn test_shape_checked_before_names() {
        let input = json!({
            "stages": [
                {"name": "bla", "steps": [{"name": "x", "args": {}}]},
                {"name": "image_conversion", "steps": "oops"}
            ]
        });

        let err = validate_canonical(&input).unwrap_err();
        assert!(matches!(err, ValidationError::Type { .. }));
    }

    #[test]
    fn test_validation_is_deterministic() {
        let mut input = canonical_fixture();
        input["stages"].as_array_mut().unwrap().swap(1, 2);

        assert_eq!(validate_canonical(&input), validate_canonical(&input));
        assert_eq!(
            validate_canonical(&canonical_fixture()).unwrap(),
            validate_canonical(&canonical_fixture()).unwrap()
        );
    }

    #[test]
    fn test_custom_registry_validation() {
        let registry = Registry::new(vec![StageSpec::new(
            "only",
            vec![StepSpec::new("first"), StepSpec::new("second")],
        )]);
        let input = json!({
            "stages": [{
                "name": "only",
                "steps": [{"name": "first", "args": {}}, {"name": "second"}]
            }]
        });

        let workflow = validate(&input, &registry).unwrap();
        assert_eq!(workflow.steps().count(), 2);
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::UnknownArgument {
            step: "metaconfig".into(),
            arg: "bla".into(),
        };
        assert!(err.to_string().contains("bla"));

        let err = ValidationError::EmptySteps("image_conversion".into());
        assert!(err.to_string().contains("no steps"));
    }
}
