use super::model::{
    DeclaredWork, DependencyEntry, JobSnapshot, StepConfig, StepKind, StepNumber, StepRecord,
    StepSpecification,
};
use super::JobError;
use crate::project::{FlowStep, ProjectConfig};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Placeholder handler in a flow that marks where resolved dependencies are
/// spliced in, when it carries no explicit dependency list of its own.
pub const UPDATE_DEPENDENCIES_HANDLER: &str = "update_dependencies";
/// Synthetic handler applied to a grouped run of resolved dependencies.
pub const APPLY_DEPENDENCIES_HANDLER: &str = "apply_dependencies";

/// Expands a job's declared work into the flat, ordered step list the engine
/// executes. Resolution is pure: the same inputs always produce the same
/// ordered step-number sequence.
pub fn resolve_steps(
    snapshot: &JobSnapshot,
    project: &ProjectConfig,
    environment_alias: &str,
) -> Result<Vec<StepSpecification>, JobError> {
    let dependency_records = snapshot
        .resolved_dependencies
        .as_deref()
        .map(group_dependencies)
        .unwrap_or_default();

    let records: Vec<StepRecord> = match snapshot.declared_work()? {
        DeclaredWork::Steps(records) => records.to_vec(),
        DeclaredWork::Flow(flow) => vec![StepRecord {
            name: Some(flow.to_string()),
            config: StepConfig {
                kind: StepKind::FlowReference {
                    flow: flow.to_string(),
                },
                options: BTreeMap::new(),
                skip: false,
            },
        }],
        DeclaredWork::Task(task) => vec![task_record(task, project, &BTreeMap::new())?],
        DeclaredWork::PlanVersion(_) => return Err(JobError::PlanVersionUnsupported),
    };

    let mut steps = Vec::new();
    let mut flow_stack: Vec<String> = Vec::new();
    for (index, record) in records.iter().enumerate() {
        flatten_record(
            record,
            StepNumber::root(index as u32 + 1),
            project,
            &dependency_records,
            environment_alias,
            &mut flow_stack,
            &mut steps,
        )?;
    }

    // Emission order already follows the dot-decimal total order; the stable
    // sort keeps insertion order for equal numbers.
    steps.sort_by(|a, b| a.step_number.cmp(&b.step_number));
    Ok(steps)
}

/// Collapses a run of adjacent raw dependency entries into one synthetic
/// "apply dependencies" step; interleaved step entries flush the current
/// group and are emitted as their own steps.
pub fn group_dependencies(entries: &[DependencyEntry]) -> Vec<StepRecord> {
    let mut records = Vec::new();
    let mut current: Vec<Value> = Vec::new();
    let mut group_number = 0u32;

    let flush = |current: &mut Vec<Value>, records: &mut Vec<StepRecord>, group_number: &mut u32| {
        if current.is_empty() {
            return;
        }
        *group_number += 1;
        let mut options = BTreeMap::new();
        options.insert("dependencies".to_string(), json!(std::mem::take(current)));
        records.push(StepRecord {
            name: Some(format!("Apply dependencies (group {group_number})")),
            config: StepConfig {
                kind: StepKind::HandlerClass {
                    handler: APPLY_DEPENDENCIES_HANDLER.to_string(),
                },
                options,
                skip: false,
            },
        });
    };

    for entry in entries {
        match entry {
            DependencyEntry::Dependency { config } => current.push(config.clone()),
            DependencyEntry::Step { name, config } => {
                flush(&mut current, &mut records, &mut group_number);
                records.push(StepRecord {
                    name: Some(name.clone()),
                    config: config.clone(),
                });
            }
        }
    }
    flush(&mut current, &mut records, &mut group_number);
    records
}

fn task_record(
    task: &str,
    project: &ProjectConfig,
    overrides: &BTreeMap<String, Value>,
) -> Result<StepRecord, JobError> {
    let config = project.tasks.get(task).ok_or_else(|| JobError::UnknownTask {
        task: task.to_string(),
    })?;
    let mut options = config.options.clone();
    for (key, value) in overrides {
        options.insert(key.clone(), value.clone());
    }
    Ok(StepRecord {
        name: Some(task.to_string()),
        config: StepConfig {
            kind: StepKind::HandlerClass {
                handler: config.handler.clone(),
            },
            options,
            skip: false,
        },
    })
}

/// Exactly one of `task`, `flow`, `handler`, or `command` selects a flow
/// step's shape; bare options are a raw-options step.
fn record_from_flow_step(
    step: &FlowStep,
    number: &StepNumber,
    project: &ProjectConfig,
) -> Result<StepRecord, JobError> {
    let selectors = [
        step.task.is_some(),
        step.flow.is_some(),
        step.handler.is_some(),
        step.command.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if selectors > 1 {
        return Err(JobError::UnsupportedStepKind {
            step_number: number.to_string(),
            reason: "step declares more than one of task, flow, handler, command".to_string(),
        });
    }

    let mut record = if let Some(task) = step.task.as_deref() {
        task_record(task, project, &step.options)?
    } else {
        let kind = if let Some(flow) = step.flow.as_deref() {
            StepKind::FlowReference {
                flow: flow.to_string(),
            }
        } else if let Some(handler) = step.handler.as_deref() {
            StepKind::HandlerClass {
                handler: handler.to_string(),
            }
        } else if let Some(command) = step.command.as_deref() {
            StepKind::ExternalCliCommand {
                command: command.to_string(),
            }
        } else if !step.options.is_empty() {
            StepKind::RawOptions
        } else {
            return Err(JobError::UnsupportedStepKind {
                step_number: number.to_string(),
                reason: "step declares no task, flow, handler, command, or options".to_string(),
            });
        };
        StepRecord {
            name: None,
            config: StepConfig {
                kind,
                options: step.options.clone(),
                skip: false,
            },
        }
    };

    if let Some(name) = &step.name {
        record.name = Some(name.clone());
    }
    record.config.skip = step.skip;
    Ok(record)
}

fn display_name(record: &StepRecord) -> String {
    if let Some(name) = &record.name {
        return name.clone();
    }
    match &record.config.kind {
        StepKind::HandlerClass { handler } => handler.clone(),
        StepKind::FlowReference { flow } => flow.clone(),
        StepKind::RawOptions => "raw options".to_string(),
        StepKind::ExternalCliCommand { command } => command.clone(),
    }
}

fn is_dependency_placeholder(record: &StepRecord) -> bool {
    matches!(
        &record.config.kind,
        StepKind::HandlerClass { handler } if handler == UPDATE_DEPENDENCIES_HANDLER
    ) && match record.config.options.get("dependencies") {
        None | Some(Value::Null) => true,
        Some(Value::Array(deps)) => deps.is_empty(),
        Some(_) => false,
    }
}

fn flatten_record(
    record: &StepRecord,
    number: StepNumber,
    project: &ProjectConfig,
    dependency_records: &[StepRecord],
    environment_alias: &str,
    flow_stack: &mut Vec<String>,
    out: &mut Vec<StepSpecification>,
) -> Result<(), JobError> {
    if record.config.skip {
        return Ok(());
    }

    match &record.config.kind {
        StepKind::FlowReference { flow } => {
            if flow_stack.iter().any(|entry| entry == flow) {
                return Err(JobError::UnsupportedStepKind {
                    step_number: number.to_string(),
                    reason: format!("flow `{flow}` expands itself recursively"),
                });
            }
            let config = project.flows.get(flow).ok_or_else(|| JobError::UnknownFlow {
                flow: flow.to_string(),
            })?;
            flow_stack.push(flow.clone());
            for (index, child) in config.steps.iter().enumerate() {
                let child_number = number.child(index as u32 + 1);
                let child_record = record_from_flow_step(child, &child_number, project)?;
                flatten_record(
                    &child_record,
                    child_number,
                    project,
                    dependency_records,
                    environment_alias,
                    flow_stack,
                    out,
                )?;
            }
            flow_stack.pop();
            Ok(())
        }
        _ if is_dependency_placeholder(record) && !dependency_records.is_empty() => {
            for (index, dependency) in dependency_records.iter().enumerate() {
                let child_number = number.child(index as u32 + 1);
                flatten_record(
                    dependency,
                    child_number,
                    project,
                    &[],
                    environment_alias,
                    flow_stack,
                    out,
                )?;
            }
            Ok(())
        }
        _ => {
            out.push(StepSpecification {
                name: display_name(record),
                step_number: number,
                kind: record.config.kind.clone(),
                options: record.config.options.clone(),
                environment_alias: environment_alias.to_string(),
            });
            Ok(())
        }
    }
}
