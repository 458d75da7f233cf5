//! Matrix placeholder handling and job expansion.
//!
//! Placeholders take two shapes: `{{matrix}}` binds the single anonymous axis of
//! a `matrix: [..]` list, `{{matrix.<axis>}}` binds a named axis of a
//! `matrix: { setup: .. }` block. Whitespace inside the braces is tolerated.

use std::collections::HashSet;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use stepline_types::{ANONYMOUS_AXIS, JobInstance, StepDefinition};
use tracing::debug;

use crate::validation::ValidatedPipeline;

static PLACEHOLDER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*matrix(?:\.([A-Za-z0-9_-]+))?\s*\}\}").expect("matrix placeholder regex should compile"));

/// A matrix placeholder found in step text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// `{{matrix}}`
    Anonymous,
    /// `{{matrix.<axis>}}`
    Axis(String),
}

impl Placeholder {
    /// Axis key this placeholder reads from a combination.
    pub fn axis_key(&self) -> &str {
        match self {
            Self::Anonymous => ANONYMOUS_AXIS,
            Self::Axis(axis) => axis.as_str(),
        }
    }
}

impl std::fmt::Display for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "{{{{matrix}}}}"),
            Self::Axis(axis) => write!(f, "{{{{matrix.{axis}}}}}"),
        }
    }
}

/// Extracts every placeholder in `text`, in order of appearance.
pub fn extract_placeholders(text: &str) -> Vec<Placeholder> {
    PLACEHOLDER_REGEX
        .captures_iter(text)
        .map(|captures| match captures.get(1) {
            Some(axis) => Placeholder::Axis(axis.as_str().to_string()),
            None => Placeholder::Anonymous,
        })
        .collect()
}

/// Returns true when `text` carries at least one placeholder.
pub fn contains_placeholder(text: &str) -> bool {
    PLACEHOLDER_REGEX.is_match(text)
}

/// Replaces every placeholder bound by `combination`; unbound placeholders are
/// left verbatim.
pub fn substitute(text: &str, combination: &IndexMap<String, String>) -> String {
    PLACEHOLDER_REGEX
        .replace_all(text, |captures: &Captures| {
            let axis = captures.get(1).map(|axis| axis.as_str()).unwrap_or(ANONYMOUS_AXIS);
            match combination.get(axis) {
                Some(value) => value.clone(),
                None => captures[0].to_string(),
            }
        })
        .into_owned()
}

/// Expands one step into its job instances.
///
/// A step without matrix yields a single instance. Otherwise each combination
/// yields one instance with `label`, `commands`, and `env` values substituted;
/// every other field is copied as authored.
pub fn expand_step(step_index: usize, step: &StepDefinition) -> Vec<JobInstance> {
    let identifier = step.identifier().unwrap_or_default().to_string();

    let Some(matrix) = &step.matrix else {
        return vec![instantiate(step_index, step, &identifier, &IndexMap::new())];
    };

    let instances: Vec<JobInstance> = matrix
        .combinations()
        .iter()
        .map(|combination| instantiate(step_index, step, &identifier, combination))
        .collect();
    debug!(step = %identifier, instances = instances.len(), "expanded matrix step");
    instances
}

/// Expands every step of a validated pipeline, in authoring order.
pub fn expand_pipeline(pipeline: &ValidatedPipeline) -> Vec<JobInstance> {
    pipeline
        .document()
        .steps
        .iter()
        .enumerate()
        .flat_map(|(index, step)| expand_step(index, step))
        .collect()
}

fn instantiate(step_index: usize, step: &StepDefinition, identifier: &str, combination: &IndexMap<String, String>) -> JobInstance {
    JobInstance {
        key: instance_key(identifier, combination),
        step: identifier.to_string(),
        step_index,
        name: step.name.clone(),
        label: step.label.as_deref().map(|label| substitute(label, combination)),
        depends_on: step.depends_on.names().to_vec(),
        wanda: step.wanda.clone(),
        job_env: step.job_env.clone(),
        instance_type: step.instance_type.clone(),
        commands: step.commands.iter().map(|command| substitute(command, combination)).collect(),
        env: step
            .env
            .iter()
            .map(|(key, value)| (key.clone(), substitute(value, combination)))
            .collect(),
        matrix: combination.clone(),
    }
}

/// Substituted identifier, followed by the values of every axis the
/// identifier does not reference, so sibling instances never share a key.
fn instance_key(identifier: &str, combination: &IndexMap<String, String>) -> String {
    if combination.is_empty() {
        return identifier.to_string();
    }

    let referenced: HashSet<String> = extract_placeholders(identifier)
        .iter()
        .map(|placeholder| placeholder.axis_key().to_string())
        .collect();
    let unreferenced: Vec<&str> = combination
        .iter()
        .filter(|(axis, _)| !referenced.contains(axis.as_str()))
        .map(|(_, value)| value.as_str())
        .collect();

    let base = substitute(identifier, combination);
    if unreferenced.is_empty() {
        base
    } else {
        format!("{base} ({})", unreferenced.join(", "))
    }
}
