//! Concrete job instances and staged execution plans.
//!
//! These are produced by the engine after validation and matrix expansion.
//! They serialize to YAML or JSON so the CLI can hand them to other tools.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One fully substituted job derived from a step template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobInstance {
    /// Unique key of the instance within the plan.
    pub key: String,
    /// Identifier of the step this instance was expanded from.
    pub step: String,
    /// Position of the source step in the document.
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Label with placeholders replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Names of prerequisite steps, copied from the template.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wanda: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    /// Commands with placeholders replaced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// Environment with placeholders replaced in the values.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    /// Matrix values bound for this instance, keyed by axis. The anonymous
    /// axis uses the empty key.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub matrix: IndexMap<String, String>,
}

impl JobInstance {
    /// Human-facing title: the label when present, otherwise the key.
    pub fn title(&self) -> &str {
        self.label.as_deref().unwrap_or(self.key.as_str())
    }
}

/// Jobs that have no dependency among each other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanStage {
    /// Zero-based stage number.
    pub index: usize,
    pub jobs: Vec<JobInstance>,
}

/// Dependency-ordered plan for a whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecutionPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub stages: Vec<PlanStage>,
}

impl ExecutionPlan {
    /// Total number of job instances across all stages.
    pub fn job_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.jobs.len()).sum()
    }

    /// Iterates job instances stage by stage.
    pub fn jobs(&self) -> impl Iterator<Item = &JobInstance> {
        self.stages.iter().flat_map(|stage| stage.jobs.iter())
    }

    /// Stage index holding the instances of `step`, if any.
    pub fn stage_of(&self, step: &str) -> Option<usize> {
        self.stages
            .iter()
            .find(|stage| stage.jobs.iter().any(|job| job.step == step))
            .map(|stage| stage.index)
    }
}
