//! # Stepline Engine
//!
//! The Stepline engine loads declarative CI pipeline documents, validates their
//! structure and `depends_on` references, expands matrix steps into concrete
//! job instances, and groups those instances into a dependency-ordered plan.
//! It never runs a job: scheduling and execution belong to the CI orchestrator
//! that consumes the plan.
//!
//! ## Usage
//!
//! ```rust
//! use stepline_engine::{ValidationOptions, build_execution_plan, load_pipeline};
//!
//! let temp_dir = tempfile::tempdir()?;
//! let pipeline_path = temp_dir.path().join("wheels.yaml");
//! std::fs::write(&pipeline_path, r#"
//! group: wheels
//! steps:
//!   - name: forge
//!     wanda: ci/docker/forge.wanda.yaml
//!   - label: "Linux x86_64 Python {{matrix}}"
//!     depends_on: forge
//!     commands: ["export PYTHON_VERSION={{matrix}}", "./ci/build/verify-linux-wheels.sh"]
//!     matrix: ["3.8", "3.9"]
//! "#)?;
//!
//! let pipeline = load_pipeline(&pipeline_path, &ValidationOptions::default())?;
//! let plan = build_execution_plan(&pipeline);
//! assert_eq!(plan.stages.len(), 2);
//! assert_eq!(plan.job_count(), 3);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`validation`**: structural checks collected into a [`ValidationFailure`]
//! - **`matrix`**: placeholder parsing, substitution, and job expansion
//! - **`planning`**: topological ordering and stage assignment

use std::{fs, path::Path};

use anyhow::{Context, Result};
use stepline_types::PipelineDocument;
use tracing::debug;

pub mod matrix;
pub mod planning;
pub mod validation;

pub use matrix::{Placeholder, expand_pipeline, expand_step, extract_placeholders, substitute};
pub use planning::{build_execution_plan, order_steps_for_execution};
pub use validation::{ValidatedPipeline, ValidationFailure, ValidationIssue, ValidationOptions, validate_pipeline};

/// Serialization formats understood by the loader and renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentFormat {
    #[default]
    Yaml,
    Json,
}

impl DocumentFormat {
    /// Picks a format from a file extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|extension| extension.to_str()) {
            Some(extension) if extension.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

impl std::str::FromStr for DocumentFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unsupported format '{other}' (expected yaml or json)"),
        }
    }
}

/// Parses a pipeline document from text.
pub fn parse_pipeline_str(content: &str, format: DocumentFormat) -> Result<PipelineDocument> {
    let document = match format {
        DocumentFormat::Yaml => serde_yaml::from_str(content).context("invalid YAML pipeline document")?,
        DocumentFormat::Json => serde_json::from_str(content).context("invalid JSON pipeline document")?,
    };
    Ok(document)
}

/// Loads a pipeline document from the filesystem with format detection by
/// extension.
///
/// # Errors
///
/// Fails when the file cannot be read or does not match the pipeline schema.
pub fn parse_pipeline_file(file_path: impl AsRef<Path>) -> Result<PipelineDocument> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read pipeline file: {}", file_path.display()))?;
    let format = DocumentFormat::from_path(file_path);
    debug!(path = %file_path.display(), ?format, "parsing pipeline file");

    parse_pipeline_str(&content, format).with_context(|| format!("Failed to parse pipeline file: {}", file_path.display()))
}

/// Loads and validates a pipeline file.
pub fn load_pipeline(file_path: impl AsRef<Path>, options: &ValidationOptions) -> Result<ValidatedPipeline> {
    let file_path = file_path.as_ref();
    let document = parse_pipeline_file(file_path)?;
    let validated = validate_pipeline(&document, options).with_context(|| format!("Invalid pipeline: {}", file_path.display()))?;
    Ok(validated)
}

/// Serializes a document back to text.
pub fn render_pipeline(document: &PipelineDocument, format: DocumentFormat) -> Result<String> {
    render_value(document, format)
}

/// Serializes any plan or document type in the requested format.
pub fn render_value<T: serde::Serialize>(value: &T, format: DocumentFormat) -> Result<String> {
    let rendered = match format {
        DocumentFormat::Yaml => serde_yaml::to_string(value)?,
        DocumentFormat::Json => serde_json::to_string_pretty(value)?,
    };
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
group: wheels
steps:
  - name: forge
    wanda: ci/docker/forge.wanda.yaml
  - label: "Linux x86_64 Python {{matrix}}"
    depends_on: forge
    job_env: forge
    commands:
      - export PYTHON_VERSION={{matrix}}
      - ./ci/build/verify-linux-wheels.sh
    matrix: ["3.8", "3.9"]
"#;

    #[test]
    fn format_detection_uses_extension() {
        assert_eq!(DocumentFormat::from_path(Path::new("a/b.json")), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path(Path::new("a/b.JSON")), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path(Path::new("a/b.rayci.yml")), DocumentFormat::Yaml);
        assert_eq!(DocumentFormat::from_path(Path::new("pipeline")), DocumentFormat::Yaml);
        assert_eq!("YML".parse::<DocumentFormat>().expect("parse"), DocumentFormat::Yaml);
        assert!("toml".parse::<DocumentFormat>().is_err());
    }

    #[test]
    fn yaml_document_round_trips_through_yaml_and_json() {
        let document = parse_pipeline_str(SAMPLE, DocumentFormat::Yaml).expect("parse");

        let yaml = render_pipeline(&document, DocumentFormat::Yaml).expect("render yaml");
        assert_eq!(parse_pipeline_str(&yaml, DocumentFormat::Yaml).expect("reparse yaml"), document);

        let json = render_pipeline(&document, DocumentFormat::Json).expect("render json");
        assert_eq!(parse_pipeline_str(&json, DocumentFormat::Json).expect("reparse json"), document);
        assert!(json.contains("\"depends_on\": \"forge\""));
    }

    #[test]
    fn setup_matrix_env_and_dependency_lists_round_trip() {
        let content = r#"
group: cross builds
steps:
  - name: forge
    wanda: ci/docker/forge.wanda.yaml
  - name: lint
    commands: [./ci/lint.sh]
  - label: "Verify {{matrix.python}} on {{matrix.arch}}"
    depends_on: [forge, lint]
    env:
      PYTHON_VERSION: "{{matrix.python}}"
      ARCH: "{{matrix.arch}}"
    commands: [./ci/build/verify-linux-wheels.sh]
    matrix:
      setup:
        python: [3.9, 311]
        arch: [x86_64, arm64]
"#;
        let document = parse_pipeline_str(content, DocumentFormat::Yaml).expect("parse");
        let verify = &document.steps[2];
        assert_eq!(verify.depends_on.names().len(), 2);
        assert_eq!(verify.env.len(), 2);
        assert!(verify.matrix.as_ref().is_some_and(|matrix| matrix.is_named()));

        for format in [DocumentFormat::Yaml, DocumentFormat::Json] {
            let rendered = render_pipeline(&document, format).expect("render");
            let reparsed = parse_pipeline_str(&rendered, format).expect("reparse");
            assert_eq!(reparsed, document, "round trip through {format:?} changed the document:\n{rendered}");
        }

        let validated = validate_pipeline(&document, &ValidationOptions { strict: true }).expect("valid");
        assert_eq!(expand_pipeline(&validated).len(), 6);
    }

    #[test]
    fn test_parse_pipeline_file_reports_path_on_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline_path = temp_dir.path().join("broken.yaml");
        fs::write(&pipeline_path, "steps: [this is: not valid").unwrap();

        let error = parse_pipeline_file(&pipeline_path).expect_err("should fail");
        assert!(format!("{error:#}").contains("broken.yaml"), "unexpected error: {error:#}");

        let missing = parse_pipeline_file(temp_dir.path().join("missing.yaml")).expect_err("missing file");
        assert!(missing.to_string().contains("Failed to read pipeline file"));
    }

    #[test]
    fn test_load_pipeline_json_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline_path = temp_dir.path().join("wheels.json");
        let document = parse_pipeline_str(SAMPLE, DocumentFormat::Yaml).unwrap();
        fs::write(&pipeline_path, render_pipeline(&document, DocumentFormat::Json).unwrap()).unwrap();

        let validated = load_pipeline(&pipeline_path, &ValidationOptions::default()).expect("load json pipeline");
        assert_eq!(validated.document(), &document);
    }

    #[test]
    fn test_load_pipeline_surfaces_validation_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline_path = temp_dir.path().join("orphan.yaml");
        fs::write(
            &pipeline_path,
            "steps:\n  - label: verify\n    depends_on: forge\n    commands: [./verify.sh]\n",
        )
        .unwrap();

        let error = load_pipeline(&pipeline_path, &ValidationOptions::default()).expect_err("should fail");
        let failure = error.downcast_ref::<ValidationFailure>().expect("validation failure");
        assert!(failure.has(|issue| matches!(issue, ValidationIssue::UnknownDependency { .. })));
    }
}
