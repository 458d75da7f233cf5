//! Strongly typed schema of a declarative CI pipeline document.
//!
//! A document is a titled `group` plus an ordered list of steps. Steps refer to
//! each other by `name` through `depends_on`, and may carry a `matrix` whose
//! values are substituted into `{{matrix}}` placeholders. Authoring order is
//! preserved everywhere (`Vec`, `IndexMap`) so rendering a document back out
//! keeps its shape.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use tracing::warn;

/// Axis key used for the anonymous `matrix: [..]` form.
pub const ANONYMOUS_AXIS: &str = "";

/// Top-level pipeline document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PipelineDocument {
    /// Human-readable pipeline title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Steps in authoring order.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// A single step template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StepDefinition {
    /// Identifier other steps reference through `depends_on`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Display label; may contain matrix placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Names of prerequisite steps.
    #[serde(default, skip_serializing_if = "DependsOn::is_empty")]
    pub depends_on: DependsOn,
    /// Path to an external templated job definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wanda: Option<String>,
    /// Named execution environment or credential set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_env: Option<String>,
    /// Requested machine class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    /// Ordered shell commands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// Environment exported before the commands run.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    /// Values driving placeholder substitution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixDefinition>,
}

impl StepDefinition {
    /// Returns the step identifier: `name` when set, otherwise `label`.
    ///
    /// Blank values are treated as absent.
    pub fn identifier(&self) -> Option<&str> {
        non_blank(self.name.as_deref()).or_else(|| non_blank(self.label.as_deref()))
    }

    /// Returns the trimmed `name`, if any.
    pub fn step_name(&self) -> Option<&str> {
        non_blank(self.name.as_deref())
    }

    /// Every text field that takes part in matrix substitution, paired with a
    /// short path used in diagnostics. `name` is excluded: it is the target of
    /// `depends_on` and must stay literal.
    pub fn substitutable_texts(&self) -> Vec<(String, &str)> {
        let mut texts = Vec::new();
        if let Some(label) = &self.label {
            texts.push(("label".to_string(), label.as_str()));
        }
        for (index, command) in self.commands.iter().enumerate() {
            texts.push((format!("commands[{index}]"), command.as_str()));
        }
        for (key, value) in &self.env {
            texts.push((format!("env.{key}"), value.as_str()));
        }
        texts
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|text| !text.is_empty())
}

/// One or many prerequisite step names.
///
/// Authors write either `depends_on: forge` or `depends_on: [a, b]`; a list of
/// exactly one entry is written back in the scalar form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DependsOn(Vec<String>);

impl DependsOn {
    /// Builds the list, trimming each name the way step names are trimmed.
    pub fn new(names: Vec<String>) -> Self {
        Self(names.into_iter().map(|name| name.trim().to_string()).collect())
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for DependsOn {
    fn from(name: &str) -> Self {
        Self::new(vec![name.to_string()])
    }
}

impl Serialize for DependsOn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.as_slice() {
            [single] => serializer.serialize_str(single),
            many => many.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for DependsOn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }

        Ok(match Option::<Raw>::deserialize(deserializer)? {
            None => Self::default(),
            Some(Raw::One(name)) => Self::new(vec![name]),
            Some(Raw::Many(names)) => Self::new(names),
        })
    }
}

/// Matrix declaration attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MatrixDefinition {
    /// Single anonymous axis bound to `{{matrix}}`.
    Values(#[serde(deserialize_with = "deserialize_scalar_list")] Vec<String>),
    /// Named axes bound to `{{matrix.<axis>}}`.
    Setup {
        #[serde(deserialize_with = "deserialize_axis_map")]
        setup: IndexMap<String, Vec<String>>,
    },
}

impl MatrixDefinition {
    /// Axes in authoring order. The anonymous form yields one axis keyed by
    /// [`ANONYMOUS_AXIS`].
    pub fn axes(&self) -> Vec<(&str, &[String])> {
        match self {
            Self::Values(values) => vec![(ANONYMOUS_AXIS, values.as_slice())],
            Self::Setup { setup } => setup.iter().map(|(axis, values)| (axis.as_str(), values.as_slice())).collect(),
        }
    }

    /// Cartesian product of all axes. The first axis varies slowest.
    pub fn combinations(&self) -> Vec<IndexMap<String, String>> {
        let axes = self.axes();
        if axes.is_empty() {
            return Vec::new();
        }

        let mut combinations: Vec<IndexMap<String, String>> = vec![IndexMap::new()];
        for (axis, values) in axes {
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for partial in &combinations {
                for value in values {
                    let mut combination = partial.clone();
                    combination.insert(axis.to_string(), value.clone());
                    next.push(combination);
                }
            }
            combinations = next;
        }
        combinations
    }

    /// True when the matrix produces no combination at all.
    pub fn is_empty(&self) -> bool {
        let axes = self.axes();
        axes.is_empty() || axes.iter().any(|(_, values)| values.is_empty())
    }

    /// True for the `{{matrix.<axis>}}` form.
    pub fn is_named(&self) -> bool {
        matches!(self, Self::Setup { .. })
    }
}

fn scalar_to_string<E: serde::de::Error>(value: JsonValue) -> Result<String, E> {
    match value {
        JsonValue::String(text) => Ok(text),
        JsonValue::Number(number) => {
            if number.is_f64() {
                warn!(
                    value = %number,
                    "matrix value was read as a float; quote it to keep its exact text (3.10 reads as 3.1)"
                );
            }
            Ok(number.to_string())
        }
        JsonValue::Bool(flag) => Ok(flag.to_string()),
        other => Err(E::custom(format!("matrix values must be scalars, found {other}"))),
    }
}

fn deserialize_scalar_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let raw = Vec::<JsonValue>::deserialize(deserializer)?;
    raw.into_iter().map(scalar_to_string).collect()
}

fn deserialize_axis_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<IndexMap<String, Vec<String>>, D::Error> {
    let raw = IndexMap::<String, Vec<JsonValue>>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(axis, values)| {
            let values = values.into_iter().map(scalar_to_string).collect::<Result<Vec<_>, D::Error>>()?;
            Ok((axis, values))
        })
        .collect()
}
