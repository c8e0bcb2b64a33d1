//! Validated Workflow Description
//!
//! Immutable result of validating a nested `{stages: [{name, steps: [{name,
//! args}]}]}` structure. Instances are only produced by the validator, so
//! holding one means names, order and arguments were checked.
//!
//! # Example YAML Format
//!
//! ```yaml
//! stages:
//!   - name: image_conversion
//!     steps:
//!       - name: metaextract
//!         args:
//!           batch_size: 50
//!       - name: metaconfig
//!         args:
//!           file_format: cellvoyager
//! ```

use std::collections::BTreeMap;

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use serde_json::Value;

/// How a step's `args` key appeared in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgsForm {
    /// No `args` key
    Absent,
    /// `args: null`
    Null,
    Map,
}

/// A validated workflow: stages in canonical order.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct WorkflowDescription {
    stages: Vec<StageDescription>,
}

/// A validated stage: steps in canonical order.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StageDescription {
    name: String,

    /// Editor-only label, never part of the canonical form
    #[serde(skip)]
    display_name: Option<String>,

    steps: Vec<StepDescription>,
}

/// A validated step with its arguments.
///
/// Serialized by hand so that `args` comes back in the form it was given:
/// left out, `null` or a mapping. The display name is never emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDescription {
    name: String,

    /// Editor-only label, never part of the canonical form
    display_name: Option<String>,

    /// Arguments exactly as supplied
    args: BTreeMap<String, Value>,

    args_form: ArgsForm,

    /// Supplied arguments merged with defaults
    resolved: BTreeMap<String, Value>,
}

impl Serialize for StepDescription {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = if self.args_form == ArgsForm::Absent { 1 } else { 2 };
        let mut state = serializer.serialize_struct("StepDescription", fields)?;
        state.serialize_field("name", &self.name)?;
        match self.args_form {
            ArgsForm::Absent => state.skip_field("args")?,
            ArgsForm::Null => state.serialize_field("args", &Option::<()>::None)?,
            ArgsForm::Map => state.serialize_field("args", &self.args)?,
        }
        state.end()
    }
}

impl WorkflowDescription {
    pub(crate) fn new(stages: Vec<StageDescription>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[StageDescription] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageDescription> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Iterates all steps across stages in canonical order.
    pub fn steps(&self) -> impl Iterator<Item = &StepDescription> {
        self.stages.iter().flat_map(|s| s.steps.iter())
    }

    pub fn step(&self, name: &str) -> Option<&StepDescription> {
        self.steps().find(|s| s.name == name)
    }

    /// Serializes back to the nested, untyped form.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl StageDescription {
    pub(crate) fn new(
        name: String,
        display_name: Option<String>,
        steps: Vec<StepDescription>,
    ) -> Self {
        Self {
            name,
            display_name,
            steps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn steps(&self) -> &[StepDescription] {
        &self.steps
    }
}

impl StepDescription {
    pub(crate) fn new(
        name: String,
        display_name: Option<String>,
        args: BTreeMap<String, Value>,
        args_form: ArgsForm,
        resolved: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            name,
            display_name,
            args,
            args_form,
            resolved,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Arguments as they appeared in the input.
    pub fn args(&self) -> &BTreeMap<String, Value> {
        &self.args
    }

    pub fn args_form(&self) -> ArgsForm {
        self.args_form
    }

    /// Arguments with defaults applied for unset optional arguments.
    pub fn resolved_args(&self) -> &BTreeMap<String, Value> {
        &self.resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(name: &str, args: Value) -> StepDescription {
        let args: BTreeMap<String, Value> = serde_json::from_value(args).unwrap();
        StepDescription::new(
            name.to_string(),
            Some("Pretty".into()),
            args.clone(),
            ArgsForm::Map,
            args,
        )
    }

    #[test]
    fn test_display_name_not_serialized() {
        let stage = StageDescription::new(
            "image_conversion".into(),
            Some("Image Conversion".into()),
            vec![step("metaextract", json!({"batch_size": 10}))],
        );
        let workflow = WorkflowDescription::new(vec![stage]);

        assert_eq!(
            workflow.to_value().unwrap(),
            json!({
                "stages": [{
                    "name": "image_conversion",
                    "steps": [{"name": "metaextract", "args": {"batch_size": 10}}]
                }]
            })
        );
        assert_eq!(workflow.stages()[0].display_name(), Some("Image Conversion"));
    }

    #[test]
    fn test_step_lookup() {
        let workflow = WorkflowDescription::new(vec![StageDescription::new(
            "image_conversion".into(),
            None,
            vec![step("metaextract", json!({})), step("metaconfig", json!({}))],
        )]);

        assert_eq!(workflow.steps().count(), 2);
        assert_eq!(workflow.step("metaconfig").unwrap().name(), "metaconfig");
        assert!(workflow.step("align").is_none());
        assert!(workflow.stage("image_conversion").is_some());
    }

    #[test]
    fn test_args_form_is_kept() {
        let bare = |form| StepDescription::new("corilla".into(), None, BTreeMap::new(), form, BTreeMap::new());
        let value = |form| serde_json::to_value(bare(form)).unwrap();

        assert_eq!(value(ArgsForm::Absent), json!({"name": "corilla"}));
        assert_eq!(value(ArgsForm::Null), json!({"name": "corilla", "args": null}));
        assert_eq!(value(ArgsForm::Map), json!({"name": "corilla", "args": {}}));
    }
}
