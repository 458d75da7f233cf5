//! Structural and referential validation of pipeline documents.
//!
//! Validation collects every issue it finds instead of stopping at the first
//! one, so a single run reports all problems in a document. A document that
//! passes is wrapped in [`ValidatedPipeline`], which is the only input the
//! expansion and planning stages accept.

use std::collections::HashSet;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use stepline_types::{MatrixDefinition, PipelineDocument, StepDefinition};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    matrix::{Placeholder, contains_placeholder, expand_step, extract_placeholders},
    planning::dependency_order,
};

static ENV_KEY_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key regex should compile"));

/// Knobs that change how strict validation is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Reject matrix steps that never reference a placeholder.
    pub strict: bool,
}

/// A single problem found in a pipeline document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationIssue {
    #[error("pipeline declares no steps")]
    EmptyPipeline,

    #[error("step #{index} is missing a required 'name' or 'label'")]
    MissingIdentifier { index: usize },

    #[error("duplicate step identifier '{identifier}'")]
    DuplicateIdentifier { identifier: String },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{step}' cannot depend on itself")]
    SelfDependency { step: String },

    #[error("cycle detected in pipeline steps involving: {}", .steps.join(", "))]
    DependencyCycle { steps: Vec<String> },

    #[error("step '{step}' must declare either 'wanda' or 'commands'")]
    MissingJobSource { step: String },

    #[error("step '{step}' declares both 'wanda' and 'commands'")]
    ConflictingJobSource { step: String },

    #[error("step '{step}' declares an empty matrix")]
    EmptyMatrix { step: String },

    #[error("step '{step}' repeats matrix value '{value}'")]
    DuplicateMatrixValue { step: String, value: String },

    #[error("step '{step}' uses placeholder {placeholder} in {field}, which its matrix does not bind")]
    UnboundPlaceholder { step: String, field: String, placeholder: String },

    #[error("step '{step}' uses a matrix placeholder in its name; names must be literal")]
    PlaceholderInName { step: String },

    #[error("step '{step}' uses a matrix placeholder in '{field}', which is never substituted")]
    PlaceholderInLiteralField { step: String, field: String },

    #[error("job instance key '{key}' is produced more than once")]
    DuplicateInstanceKey { key: String },

    #[error("step '{step}' declares a matrix but never references it")]
    UnusedMatrix { step: String },

    #[error("step '{step}' has invalid environment variable key '{key}'")]
    InvalidEnvKey { step: String, key: String },
}

/// Every issue found while validating one document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("pipeline validation failed with {} issue(s):\n{}", .issues.len(), summarize(.issues))]
pub struct ValidationFailure {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationFailure {
    /// True when any collected issue satisfies `predicate`.
    pub fn has(&self, predicate: impl Fn(&ValidationIssue) -> bool) -> bool {
        self.issues.iter().any(predicate)
    }
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues.iter().map(|issue| format!("  - {issue}")).collect::<Vec<_>>().join("\n")
}

/// A document that passed validation, with its steps' dependency order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPipeline {
    document: PipelineDocument,
    order: Vec<usize>,
}

impl ValidatedPipeline {
    pub fn document(&self) -> &PipelineDocument {
        &self.document
    }

    /// Step indices in dependency order, authoring order breaking ties.
    pub fn execution_order(&self) -> &[usize] {
        &self.order
    }

    pub fn into_document(self) -> PipelineDocument {
        self.document
    }
}

/// Validates a document, returning every issue on failure.
pub fn validate_pipeline(document: &PipelineDocument, options: &ValidationOptions) -> Result<ValidatedPipeline, ValidationFailure> {
    let mut issues = Vec::new();

    if document.steps.is_empty() {
        return Err(ValidationFailure {
            issues: vec![ValidationIssue::EmptyPipeline],
        });
    }

    let mut identifiers: IndexMap<&str, usize> = IndexMap::new();
    let mut names: HashSet<&str> = HashSet::new();
    for (index, step) in document.steps.iter().enumerate() {
        let Some(identifier) = step.identifier() else {
            issues.push(ValidationIssue::MissingIdentifier { index });
            continue;
        };
        if identifiers.insert(identifier, index).is_some() {
            issues.push(ValidationIssue::DuplicateIdentifier {
                identifier: identifier.to_string(),
            });
        }
        if let Some(name) = step.step_name() {
            names.insert(name);
        }
    }

    let mut references_ok = true;
    for (index, step) in document.steps.iter().enumerate() {
        let identifier = step.identifier().map(str::to_string).unwrap_or_else(|| format!("#{index}"));
        check_job_source(&identifier, step, &mut issues);
        check_matrix(&identifier, step, options, &mut issues);
        check_env_keys(&identifier, step, &mut issues);

        for dependency in step.depends_on.names() {
            if step.step_name() == Some(dependency.as_str()) {
                issues.push(ValidationIssue::SelfDependency { step: identifier.clone() });
                references_ok = false;
            } else if !names.contains(dependency.as_str()) {
                issues.push(ValidationIssue::UnknownDependency {
                    step: identifier.clone(),
                    dependency: dependency.clone(),
                });
                references_ok = false;
            }
        }
    }

    // Ordering needs unique identifiers and resolvable references; anything
    // else it could report has already been collected above.
    let mut order = Vec::new();
    if references_ok && !has_identifier_issue(&issues) {
        match dependency_order(&document.steps) {
            Ok(computed) => order = computed,
            Err(issue) => issues.push(issue),
        }
    }

    if !has_identifier_issue(&issues) {
        check_instance_keys(document, &mut issues);
    }

    if !issues.is_empty() {
        debug!(issues = issues.len(), "pipeline validation failed");
        return Err(ValidationFailure { issues });
    }

    debug!(steps = document.steps.len(), "pipeline validated");
    Ok(ValidatedPipeline {
        document: document.clone(),
        order,
    })
}

fn has_identifier_issue(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|issue| {
        matches!(
            issue,
            ValidationIssue::MissingIdentifier { .. } | ValidationIssue::DuplicateIdentifier { .. }
        )
    })
}

fn check_instance_keys(document: &PipelineDocument, issues: &mut Vec<ValidationIssue>) {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for (index, step) in document.steps.iter().enumerate() {
        for instance in expand_step(index, step) {
            if !seen.insert(instance.key.clone()) && reported.insert(instance.key.clone()) {
                issues.push(ValidationIssue::DuplicateInstanceKey { key: instance.key });
            }
        }
    }
}

fn check_job_source(identifier: &str, step: &StepDefinition, issues: &mut Vec<ValidationIssue>) {
    match (step.wanda.is_some(), !step.commands.is_empty()) {
        (false, false) => issues.push(ValidationIssue::MissingJobSource {
            step: identifier.to_string(),
        }),
        (true, true) => issues.push(ValidationIssue::ConflictingJobSource {
            step: identifier.to_string(),
        }),
        _ => {}
    }
}

fn check_matrix(identifier: &str, step: &StepDefinition, options: &ValidationOptions, issues: &mut Vec<ValidationIssue>) {
    if step.name.as_deref().is_some_and(contains_placeholder) {
        issues.push(ValidationIssue::PlaceholderInName {
            step: identifier.to_string(),
        });
    }

    let literal_fields = [
        ("wanda", step.wanda.as_deref()),
        ("job_env", step.job_env.as_deref()),
        ("instance_type", step.instance_type.as_deref()),
    ];
    for (field, value) in literal_fields {
        if value.is_some_and(contains_placeholder) {
            issues.push(ValidationIssue::PlaceholderInLiteralField {
                step: identifier.to_string(),
                field: field.to_string(),
            });
        }
    }

    let mut referenced = false;
    for (field, text) in step.substitutable_texts() {
        for placeholder in extract_placeholders(text) {
            if binds(step.matrix.as_ref(), &placeholder) {
                referenced = true;
            } else {
                issues.push(ValidationIssue::UnboundPlaceholder {
                    step: identifier.to_string(),
                    field: field.clone(),
                    placeholder: placeholder.to_string(),
                });
            }
        }
    }

    let Some(matrix) = &step.matrix else {
        return;
    };

    if matrix.is_empty() {
        issues.push(ValidationIssue::EmptyMatrix {
            step: identifier.to_string(),
        });
    }

    for (_, values) in matrix.axes() {
        let mut seen = HashSet::new();
        for value in values {
            if !seen.insert(value.as_str()) {
                issues.push(ValidationIssue::DuplicateMatrixValue {
                    step: identifier.to_string(),
                    value: value.clone(),
                });
            }
        }
    }

    if !referenced {
        if options.strict {
            issues.push(ValidationIssue::UnusedMatrix {
                step: identifier.to_string(),
            });
        } else {
            warn!(step = %identifier, "matrix declared but no placeholder references it; instances will be identical");
        }
    }
}

fn binds(matrix: Option<&MatrixDefinition>, placeholder: &Placeholder) -> bool {
    match (matrix, placeholder) {
        (None, _) => false,
        (Some(MatrixDefinition::Values(_)), Placeholder::Anonymous) => true,
        (Some(MatrixDefinition::Values(_)), Placeholder::Axis(_)) => false,
        (Some(MatrixDefinition::Setup { .. }), Placeholder::Anonymous) => false,
        (Some(MatrixDefinition::Setup { setup }), Placeholder::Axis(axis)) => setup.contains_key(axis),
    }
}

fn check_env_keys(identifier: &str, step: &StepDefinition, issues: &mut Vec<ValidationIssue>) {
    for key in step.env.keys() {
        if !ENV_KEY_REGEX.is_match(key) {
            issues.push(ValidationIssue::InvalidEnvKey {
                step: identifier.to_string(),
                key: key.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepline_types::DependsOn;

    fn forge(name: &str) -> StepDefinition {
        StepDefinition {
            name: Some(name.into()),
            wanda: Some(format!("ci/docker/{name}.wanda.yaml")),
            ..Default::default()
        }
    }

    fn verify(label: &str, depends_on: &str) -> StepDefinition {
        StepDefinition {
            label: Some(format!("{label} Python {{{{matrix}}}}")),
            depends_on: DependsOn::from(depends_on),
            commands: vec!["export PYTHON_VERSION={{matrix}}".into(), "./ci/build/verify-linux-wheels.sh".into()],
            matrix: Some(MatrixDefinition::Values(vec!["3.8".into(), "3.9".into()])),
            ..Default::default()
        }
    }

    fn document(steps: Vec<StepDefinition>) -> PipelineDocument {
        PipelineDocument {
            group: Some("wheels".into()),
            steps,
        }
    }

    fn issues_of(document: &PipelineDocument, options: ValidationOptions) -> Vec<ValidationIssue> {
        validate_pipeline(document, &options).expect_err("expected validation failure").issues
    }

    #[test]
    fn accepts_two_independent_chains() {
        let document = document(vec![
            forge("forge"),
            verify("Linux x86_64", "forge"),
            forge("forge_arm64"),
            verify("Linux arm64", "forge_arm64"),
        ]);

        let validated = validate_pipeline(&document, &ValidationOptions::default()).expect("valid pipeline");
        assert_eq!(validated.execution_order(), [0, 2, 1, 3]);
        assert_eq!(validated.document(), &document);
    }

    #[test]
    fn rejects_empty_pipeline() {
        let issues = issues_of(&document(Vec::new()), ValidationOptions::default());
        assert_eq!(issues, vec![ValidationIssue::EmptyPipeline]);
    }

    #[test]
    fn removing_dependency_target_fails_referential_integrity() {
        let document = document(vec![verify("Linux x86_64", "forge")]);
        let issues = issues_of(&document, ValidationOptions::default());
        assert_eq!(
            issues,
            vec![ValidationIssue::UnknownDependency {
                step: "Linux x86_64 Python {{matrix}}".into(),
                dependency: "forge".into(),
            }]
        );
    }

    #[test]
    fn depends_on_must_target_a_name_not_a_label() {
        let mut labelled = forge("ignored");
        labelled.name = None;
        labelled.label = Some("Forge".into());
        let document = document(vec![labelled, verify("Linux", "Forge")]);

        let issues = issues_of(&document, ValidationOptions::default());
        assert!(matches!(&issues[0], ValidationIssue::UnknownDependency { dependency, .. } if dependency == "Forge"));
    }

    #[test]
    fn collects_identifier_and_job_source_issues_together() {
        let nameless = StepDefinition {
            commands: vec!["true".into()],
            ..Default::default()
        };
        let both = StepDefinition {
            name: Some("forge".into()),
            wanda: Some("a.wanda.yaml".into()),
            commands: vec!["true".into()],
            ..Default::default()
        };
        let neither = StepDefinition {
            name: Some("forge".into()),
            ..Default::default()
        };

        let issues = issues_of(&document(vec![nameless, both, neither]), ValidationOptions::default());
        assert!(issues.contains(&ValidationIssue::MissingIdentifier { index: 0 }));
        assert!(issues.contains(&ValidationIssue::DuplicateIdentifier {
            identifier: "forge".into()
        }));
        assert!(issues.contains(&ValidationIssue::ConflictingJobSource { step: "forge".into() }));
        assert!(issues.contains(&ValidationIssue::MissingJobSource { step: "forge".into() }));
    }

    #[test]
    fn rejects_self_dependency_and_cycles() {
        let mut looping = forge("forge");
        looping.depends_on = DependsOn::from("forge");
        let issues = issues_of(&document(vec![looping]), ValidationOptions::default());
        assert_eq!(issues, vec![ValidationIssue::SelfDependency { step: "forge".into() }]);

        let mut first = forge("first");
        first.depends_on = DependsOn::from("second");
        let mut second = forge("second");
        second.depends_on = DependsOn::from("first");
        let issues = issues_of(&document(vec![first, second]), ValidationOptions::default());
        assert_eq!(
            issues,
            vec![ValidationIssue::DependencyCycle {
                steps: vec!["first".into(), "second".into()]
            }]
        );
    }

    #[test]
    fn rejects_empty_matrix_and_duplicate_values() {
        let mut empty = verify("Linux", "forge");
        empty.matrix = Some(MatrixDefinition::Values(Vec::new()));
        let mut repeated = verify("Mac", "forge");
        repeated.matrix = Some(MatrixDefinition::Values(vec!["3.8".into(), "3.8".into()]));

        let issues = issues_of(&document(vec![forge("forge"), empty, repeated]), ValidationOptions::default());
        assert!(issues.contains(&ValidationIssue::EmptyMatrix {
            step: "Linux Python {{matrix}}".into()
        }));
        assert!(issues.contains(&ValidationIssue::DuplicateMatrixValue {
            step: "Mac Python {{matrix}}".into(),
            value: "3.8".into(),
        }));
    }

    #[test]
    fn rejects_placeholders_without_binding_matrix() {
        let mut unbound = verify("Linux", "forge");
        unbound.matrix = None;
        let mut wrong_axis = verify("Mac", "forge");
        wrong_axis.commands = vec!["echo {{matrix.python}}".into()];

        let issues = issues_of(&document(vec![forge("forge"), unbound, wrong_axis]), ValidationOptions::default());
        assert!(issues.contains(&ValidationIssue::UnboundPlaceholder {
            step: "Linux Python {{matrix}}".into(),
            field: "commands[0]".into(),
            placeholder: "{{matrix}}".into(),
        }));
        assert!(issues.contains(&ValidationIssue::UnboundPlaceholder {
            step: "Mac Python {{matrix}}".into(),
            field: "commands[0]".into(),
            placeholder: "{{matrix.python}}".into(),
        }));
    }

    #[test]
    fn rejects_placeholder_in_name() {
        let mut step = verify("Linux", "forge");
        step.name = Some("verify_{{matrix}}".into());
        let issues = issues_of(&document(vec![forge("forge"), step]), ValidationOptions::default());
        assert_eq!(
            issues,
            vec![ValidationIssue::PlaceholderInName {
                step: "verify_{{matrix}}".into()
            }]
        );
    }

    #[test]
    fn unused_matrix_only_fails_in_strict_mode() {
        let mut step = verify("Linux", "forge");
        step.label = Some("Linux".into());
        step.commands = vec!["./ci/build/verify-linux-wheels.sh".into()];
        let document = document(vec![forge("forge"), step]);

        assert!(validate_pipeline(&document, &ValidationOptions::default()).is_ok());
        let issues = issues_of(&document, ValidationOptions { strict: true });
        assert_eq!(issues, vec![ValidationIssue::UnusedMatrix { step: "Linux".into() }]);
    }

    #[test]
    fn rejects_invalid_env_keys() {
        let mut step = forge("forge");
        step.env.insert("PYTHON-VERSION".into(), "3.9".into());
        let issues = issues_of(&document(vec![step]), ValidationOptions::default());
        assert_eq!(
            issues,
            vec![ValidationIssue::InvalidEnvKey {
                step: "forge".into(),
                key: "PYTHON-VERSION".into()
            }]
        );
    }

    #[test]
    fn failure_display_lists_every_issue() {
        let failure = ValidationFailure {
            issues: vec![
                ValidationIssue::EmptyMatrix { step: "a".into() },
                ValidationIssue::SelfDependency { step: "b".into() },
            ],
        };
        let rendered = failure.to_string();
        assert!(rendered.starts_with("pipeline validation failed with 2 issue(s)"));
        assert!(rendered.contains("  - step 'a' declares an empty matrix"));
        assert!(rendered.contains("  - step 'b' cannot depend on itself"));
        assert!(failure.has(|issue| matches!(issue, ValidationIssue::SelfDependency { .. })));
    }

    #[test]
    fn rejects_instance_keys_shared_across_steps() {
        let templated = StepDefinition {
            label: Some("Py {{matrix}}".into()),
            commands: vec!["./verify.sh".into()],
            matrix: Some(MatrixDefinition::Values(vec!["3.8".into()])),
            ..Default::default()
        };
        let literal = StepDefinition {
            label: Some("Py 3.8".into()),
            commands: vec!["./verify.sh".into()],
            ..Default::default()
        };

        let issues = issues_of(&document(vec![templated, literal]), ValidationOptions::default());
        assert_eq!(issues, vec![ValidationIssue::DuplicateInstanceKey { key: "Py 3.8".into() }]);
    }

    #[test]
    fn partially_bound_label_passes_strict_validation_with_distinct_keys() {
        let mut setup = IndexMap::new();
        setup.insert("python".to_string(), vec!["3.8".to_string()]);
        setup.insert("arch".to_string(), vec!["x86_64".to_string(), "arm64".to_string()]);
        let step = StepDefinition {
            label: Some("Py {{matrix.python}}".into()),
            commands: vec!["./verify.sh".into()],
            matrix: Some(MatrixDefinition::Setup { setup }),
            ..Default::default()
        };

        let validated = validate_pipeline(&document(vec![step]), &ValidationOptions { strict: true }).expect("valid");
        let keys: Vec<String> = crate::expand_pipeline(&validated).into_iter().map(|job| job.key).collect();
        assert_eq!(keys, vec!["Py 3.8 (x86_64)", "Py 3.8 (arm64)"]);
    }

    #[test]
    fn rejects_placeholders_in_fields_that_are_never_substituted() {
        let mut step = verify("Linux", "forge");
        step.job_env = Some("forge_{{matrix}}".into());
        step.instance_type = Some("medium-{{matrix}}".into());
        let mut forge_step = forge("forge");
        forge_step.wanda = Some("ci/docker/forge-{{matrix}}.wanda.yaml".into());

        let issues = issues_of(&document(vec![forge_step, step]), ValidationOptions { strict: true });
        let fields: Vec<&str> = issues
            .iter()
            .filter_map(|issue| match issue {
                ValidationIssue::PlaceholderInLiteralField { field, .. } => Some(field.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fields, vec!["wanda", "job_env", "instance_type"]);
    }

    #[test]
    fn dependency_names_are_matched_after_trimming() {
        let mut forge_step = forge("forge");
        forge_step.name = Some(" forge".into());
        let step: StepDefinition = serde_json::from_value(serde_json::json!({
            "label": "Linux Python {{matrix}}",
            "depends_on": " forge ",
            "commands": ["export PYTHON_VERSION={{matrix}}"],
            "matrix": ["3.8"],
        }))
        .expect("parse step");

        let validated = validate_pipeline(&document(vec![forge_step, step]), &ValidationOptions::default()).expect("valid");
        assert_eq!(validated.execution_order(), [0, 1]);
    }
}
