//! Step ordering and staged execution planning.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Result, anyhow};
use indexmap::IndexMap;
use stepline_types::{ExecutionPlan, PlanStage, StepDefinition};
use tracing::debug;

use crate::{
    matrix::expand_step,
    validation::{ValidatedPipeline, ValidationIssue},
};

/// Build a topologically ordered step list for execution.
///
/// Returns an error for missing or duplicate step identifiers, unknown
/// dependencies, self-dependencies, or cycles.
pub fn order_steps_for_execution(steps: &[StepDefinition]) -> Result<Vec<&StepDefinition>> {
    let order = dependency_order(steps).map_err(|issue| anyhow!(issue))?;
    Ok(order.into_iter().map(|index| &steps[index]).collect())
}

/// Kahn ordering over step indices. Ready steps are taken in authoring order.
pub(crate) fn dependency_order(steps: &[StepDefinition]) -> Result<Vec<usize>, ValidationIssue> {
    let mut lookup: IndexMap<&str, usize> = IndexMap::new();
    let mut names: HashMap<&str, usize> = HashMap::new();
    for (index, step) in steps.iter().enumerate() {
        let identifier = step.identifier().ok_or(ValidationIssue::MissingIdentifier { index })?;
        if lookup.insert(identifier, index).is_some() {
            return Err(ValidationIssue::DuplicateIdentifier {
                identifier: identifier.to_string(),
            });
        }
        if let Some(name) = step.step_name() {
            names.insert(name, index);
        }
    }

    let mut in_degrees: Vec<usize> = vec![0; steps.len()];
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();

    for (identifier, &index) in &lookup {
        let mut seen_dependencies = HashSet::new();
        for dependency in steps[index].depends_on.names() {
            let Some(&dependency_index) = names.get(dependency.as_str()) else {
                return Err(ValidationIssue::UnknownDependency {
                    step: identifier.to_string(),
                    dependency: dependency.clone(),
                });
            };
            if dependency_index == index {
                return Err(ValidationIssue::SelfDependency {
                    step: identifier.to_string(),
                });
            }
            if !seen_dependencies.insert(dependency_index) {
                continue;
            }
            in_degrees[index] += 1;
            adjacency.entry(dependency_index).or_default().push(index);
        }
    }

    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|index| in_degrees[*index] == 0).collect();

    let mut ordered = Vec::with_capacity(steps.len());
    while let Some(index) = queue.pop_front() {
        ordered.push(index);

        if let Some(children) = adjacency.get(&index) {
            for &child in children {
                in_degrees[child] -= 1;
                if in_degrees[child] == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if ordered.len() != steps.len() {
        let mut remaining: Vec<String> = lookup
            .iter()
            .filter(|(_, index)| in_degrees[**index] > 0)
            .map(|(identifier, _)| identifier.to_string())
            .collect();
        remaining.sort();
        return Err(ValidationIssue::DependencyCycle { steps: remaining });
    }

    Ok(ordered)
}

/// Groups the expanded jobs of a validated pipeline into stages.
///
/// A step without dependencies lands in stage 0; any other step lands one
/// stage after the latest of its prerequisites. All instances of a step share
/// its stage, and jobs within a stage never depend on each other.
pub fn build_execution_plan(pipeline: &ValidatedPipeline) -> ExecutionPlan {
    let steps = &pipeline.document().steps;
    let names: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .filter_map(|(index, step)| step.step_name().map(|name| (name, index)))
        .collect();

    let mut stage_of_step: HashMap<usize, usize> = HashMap::new();
    for &index in pipeline.execution_order() {
        let stage = steps[index]
            .depends_on
            .names()
            .iter()
            .filter_map(|dependency| names.get(dependency.as_str()))
            .filter_map(|dependency_index| stage_of_step.get(dependency_index))
            .map(|stage| stage + 1)
            .max()
            .unwrap_or(0);
        stage_of_step.insert(index, stage);
    }

    let stage_count = stage_of_step.values().copied().max().map_or(0, |max| max + 1);
    let mut stages: Vec<PlanStage> = (0..stage_count)
        .map(|index| PlanStage { index, jobs: Vec::new() })
        .collect();

    for &index in pipeline.execution_order() {
        let stage = stage_of_step[&index];
        stages[stage].jobs.extend(expand_step(index, &steps[index]));
    }

    let plan = ExecutionPlan {
        group: pipeline.document().group.clone(),
        stages,
    };
    debug!(stages = plan.stages.len(), jobs = plan.job_count(), "built execution plan");
    plan
}
