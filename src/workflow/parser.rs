//! Workflow Description Files
//!
//! Loads workflow descriptions from YAML files (JSON is accepted as well,
//! being a subset of YAML) and writes them back in canonical form.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde_json::Value;

use super::description::WorkflowDescription;
use super::registry::Registry;
use super::validator::validate;
use crate::error::LoadError;

/// Loads and validates a description against the canonical registry.
///
/// # Example
///
/// ```rust,no_run
/// use tmflow::workflow::load_description;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let description = load_description("workflow.yaml")?;
///     println!("Loaded {} steps", description.steps().count());
///     Ok(())
/// }
/// ```
pub fn load_description(path: impl AsRef<Path>) -> Result<WorkflowDescription, LoadError> {
    load_description_with(path, Registry::canonical())
}

/// Loads and validates a description against the given registry.
pub fn load_description_with(
    path: impl AsRef<Path>,
    registry: &Registry,
) -> Result<WorkflowDescription, LoadError> {
    let path = path.as_ref();
    info!("Loading workflow description from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    debug!("Description loaded ({} bytes)", content.len());

    let value = parse_description(&content).map_err(|source| LoadError::Yaml {
        path: path.display().to_string(),
        source,
    })?;

    Ok(validate(&value, registry)?)
}

/// Parses YAML text into the untyped nested form.
pub fn parse_description(content: &str) -> Result<Value, serde_yaml::Error> {
    serde_yaml::from_str(content)
}

/// Writes a description in its canonical YAML form.
pub fn save_description(
    description: &WorkflowDescription,
    path: impl AsRef<Path>,
) -> Result<(), LoadError> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(description).map_err(|source| LoadError::Yaml {
        path: path.display().to_string(),
        source,
    })?;
    fs::write(path, yaml).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    info!("Workflow description saved to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::validator::{canonical_fixture, ValidationError};
    use tempfile::tempdir;

    const CANONICAL_YAML: &str = r#"
stages:
  - name: image_conversion
    display_name: Image conversion
    steps:
      - name: metaextract
        args:
          batch_size: 20
      - name: metaconfig
        args:
          file_format: cellvoyager
      - name: imextract
        args: {}
  - name: image_preprocessing
    steps:
      - name: corilla
      - name: align
        args:
          ref_cycle: 1
          ref_channel: 0
  - name: pyramid_creation
    steps:
      - name: illuminati
        args:
          clip: false
  - name: image_analysis
    steps:
      - name: jterator
        args:
          pipeline: nuclei
"#;

    #[test]
    fn test_load_description_valid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("workflow.yaml");
        fs::write(&path, CANONICAL_YAML).unwrap();

        let description = load_description(&path).unwrap();
        assert_eq!(description.stages().len(), 4);
        assert_eq!(
            description.step("metaconfig").unwrap().args()["file_format"],
            "cellvoyager"
        );
        assert_eq!(
            description.stages()[0].display_name(),
            Some("Image conversion")
        );
    }

    #[test]
    fn test_load_description_json_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("workflow.json");
        fs::write(&path, serde_json::to_string(&canonical_fixture()).unwrap()).unwrap();

        assert!(load_description(&path).is_ok());
    }

    #[test]
    fn test_load_description_file_not_found() {
        let result = load_description("/nonexistent/path/workflow.yaml");
        assert!(matches!(result, Err(LoadError::Io { .. })));
    }

    #[test]
    fn test_load_description_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "this is not valid yaml: [[[").unwrap();

        let result = load_description(&path);
        assert!(matches!(result, Err(LoadError::Yaml { .. })));
    }

    #[test]
    fn test_load_description_validation_error() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("order.yaml");
        let swapped = CANONICAL_YAML.replace("name: corilla", "name: align_tmp")
            .replace("name: align\n", "name: corilla\n")
            .replace("name: align_tmp", "name: align");
        fs::write(&path, swapped).unwrap();

        let result = load_description(&path);
        assert!(matches!(
            result,
            Err(LoadError::Validation(ValidationError::StepOrder { .. }))
        ));
    }

    #[test]
    fn test_save_and_reload_description() {
        let temp_dir = tempdir().unwrap();
        let source = temp_dir.path().join("source.yaml");
        let target = temp_dir.path().join("target.yaml");
        fs::write(&source, CANONICAL_YAML).unwrap();

        let description = load_description(&source).unwrap();
        save_description(&description, &target).unwrap();

        let saved = fs::read_to_string(&target).unwrap();
        assert!(!saved.contains("display_name"));

        // corilla has no args key in the source and gains none on save
        let saved_value = parse_description(&saved).unwrap();
        assert_eq!(saved_value, description.to_value().unwrap());
        assert!(saved_value["stages"][1]["steps"][0].get("args").is_none());

        let reloaded = load_description(&target).unwrap();
        assert_eq!(reloaded.to_value().unwrap(), description.to_value().unwrap());
    }
}
