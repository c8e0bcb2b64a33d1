//! Canonical Stage/Step Registry
//!
//! The fixed, ordered list of stages and steps a workflow description is
//! checked against, together with the argument schema of every step.
//!
//! # Canonical Order
//!
//! ```text
//! image_conversion     metaextract -> metaconfig -> imextract
//! image_preprocessing  corilla -> align
//! pyramid_creation     illuminati
//! image_analysis       jterator
//! ```

use std::fmt;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

/// Semantic type of a step argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Int,
    Float,
    Bool,
    Str,
}

impl ArgType {
    /// Returns true if `value` is an instance of this type.
    ///
    /// `null` never matches; callers decide whether null means "unset".
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ArgType::Int => value.is_i64() || value.is_u64(),
            ArgType::Float => value.is_number(),
            ArgType::Bool => value.is_boolean(),
            ArgType::Str => value.is_string(),
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgType::Int => "int",
            ArgType::Float => "float",
            ArgType::Bool => "bool",
            ArgType::Str => "str",
        };
        write!(f, "{}", name)
    }
}

/// Schema entry for a single step argument.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgType,
    /// Value used when the argument is not set (`None` = stays unset)
    pub default: Option<Value>,
    pub required: bool,
    pub help: &'static str,
}

impl ArgSpec {
    /// Creates an optional argument without default.
    pub fn new(name: &'static str, kind: ArgType, help: &'static str) -> Self {
        Self {
            name,
            kind,
            default: None,
            required: false,
            help,
        }
    }

    /// Sets the documented default value.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Marks the argument as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Registry entry for a workflow step.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: &'static str,
    pub args: Vec<ArgSpec>,
    /// Whether the step ends with a collect phase
    pub has_collect: bool,
}

impl StepSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
            has_collect: false,
        }
    }

    pub fn arg(mut self, spec: ArgSpec) -> Self {
        self.args.push(spec);
        self
    }

    pub fn with_collect(mut self) -> Self {
        self.has_collect = true;
        self
    }

    /// Looks up the schema of an argument by name.
    pub fn arg_spec(&self, name: &str) -> Option<&ArgSpec> {
        self.args.iter().find(|a| a.name == name)
    }
}

/// Registry entry for a workflow stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: &'static str,
    pub steps: Vec<StepSpec>,
}

impl StageSpec {
    pub fn new(name: &'static str, steps: Vec<StepSpec>) -> Self {
        Self { name, steps }
    }
}

/// Ordered registry of stages and their steps.
#[derive(Debug, Clone)]
pub struct Registry {
    stages: Vec<StageSpec>,
}

static CANONICAL: Lazy<Registry> = Lazy::new(build_canonical);

impl Registry {
    /// Creates a registry from stages given in canonical order.
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    /// Returns the canonical image-analysis registry.
    pub fn canonical() -> &'static Registry {
        &CANONICAL
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn step(&self, stage: &str, step: &str) -> Option<&StepSpec> {
        self.stage(stage)
            .and_then(|s| s.steps.iter().find(|spec| spec.name == step))
    }

    /// Finds a step in any stage.
    pub fn find_step(&self, name: &str) -> Option<&StepSpec> {
        self.stages
            .iter()
            .flat_map(|s| s.steps.iter())
            .find(|spec| spec.name == name)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    pub fn step_names(&self, stage: &str) -> Vec<&'static str> {
        self.stage(stage)
            .map(|s| s.steps.iter().map(|spec| spec.name).collect())
            .unwrap_or_default()
    }
}

fn build_canonical() -> Registry {
    use ArgType::*;

    let batch_size = |default: i64| {
        ArgSpec::new("batch_size", Int, "number of items processed per run job")
            .with_default(json!(default))
    };

    Registry::new(vec![
        StageSpec::new(
            "image_conversion",
            vec![
                StepSpec::new("metaextract").arg(batch_size(100)),
                StepSpec::new("metaconfig")
                    .arg(
                        ArgSpec::new("file_format", Str, "microscope file format")
                            .with_default(json!("default")),
                    )
                    .arg(
                        ArgSpec::new("z_stacks", Bool, "images are acquired as z-stacks")
                            .with_default(json!(false)),
                    )
                    .arg(ArgSpec::new("regex", Str, "regular expression for image file names"))
                    .arg(
                        ArgSpec::new("stitch_layout", Str, "layout of sites within a well")
                            .with_default(json!("zigzag_horizontal")),
                    )
                    .arg(
                        ArgSpec::new("stitch_major_axis", Str, "longer axis of the stitched mosaic")
                            .with_default(json!("vertical")),
                    )
                    .arg(ArgSpec::new("n_vertical", Int, "number of sites along the vertical axis"))
                    .arg(ArgSpec::new("n_horizontal", Int, "number of sites along the horizontal axis"))
                    .with_collect(),
                StepSpec::new("imextract").arg(batch_size(10)).arg(
                    ArgSpec::new("mip", Bool, "perform maximum intensity projection")
                        .with_default(json!(false)),
                ),
            ],
        ),
        StageSpec::new(
            "image_preprocessing",
            vec![
                StepSpec::new("corilla").with_collect(),
                StepSpec::new("align")
                    .arg(batch_size(5))
                    .arg(ArgSpec::new("ref_cycle", Int, "zero-based index of the reference cycle").required())
                    .arg(ArgSpec::new("ref_channel", Int, "zero-based ID of the reference channel").required())
                    .arg(
                        ArgSpec::new("limit", Int, "maximally tolerated shift in pixels")
                            .with_default(json!(300)),
                    )
                    .arg(
                        ArgSpec::new("illumcorr", Bool, "also correct for illumination artifacts")
                            .with_default(json!(false)),
                    )
                    .with_collect(),
            ],
        ),
        StageSpec::new(
            "pyramid_creation",
            vec![StepSpec::new("illuminati")
                .arg(
                    ArgSpec::new("clip", Bool, "clip intensities above a threshold")
                        .with_default(json!(true)),
                )
                .arg(ArgSpec::new("clip_value", Int, "explicit clipping threshold"))
                .arg(
                    ArgSpec::new("illumcorr", Bool, "correct images for illumination artifacts")
                        .with_default(json!(false)),
                )
                .arg(
                    ArgSpec::new("align", Bool, "align images between cycles")
                        .with_default(json!(false)),
                )],
        ),
        StageSpec::new(
            "image_analysis",
            vec![StepSpec::new("jterator")
                .arg(ArgSpec::new("pipeline", Str, "name of the image analysis pipeline").required())
                .arg(batch_size(5))
                .arg(
                    ArgSpec::new("plot", Bool, "generate figures for each module")
                        .with_default(json!(false)),
                )
                .with_collect()],
        ),
    ])
}
