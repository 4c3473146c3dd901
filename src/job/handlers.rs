use super::model::{StepKind, StepSpecification};
use crate::environment::{EnvironmentHandle, Provisioner};
use serde_json::json;
use std::collections::BTreeMap;

/// A step handler's failure, captured into the step's result. Step-type
/// semantics are opaque to the orchestrator; this is the whole contract.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct StepFailure {
    pub reason: String,
}

impl StepFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Executes one step against the acquired environment.
pub trait StepHandler {
    fn execute(
        &self,
        environment: &EnvironmentHandle,
        step: &StepSpecification,
    ) -> Result<(), StepFailure>;
}

/// Maps a handler name to its implementation. Populated once at startup;
/// there is no dynamic loading.
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Box<dyn StepHandler>>,
    cli: CliCommandHandler,
}

impl HandlerRegistry {
    pub fn new(provisioner: Provisioner) -> Self {
        let mut registry = Self {
            handlers: BTreeMap::new(),
            cli: CliCommandHandler {
                provisioner: provisioner.clone(),
            },
        };
        registry.register(
            super::resolver::APPLY_DEPENDENCIES_HANDLER,
            Box::new(ApplyDependenciesHandler { provisioner }),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Box<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Dispatches a step to its handler by kind tag.
    pub fn execute(
        &self,
        environment: &EnvironmentHandle,
        step: &StepSpecification,
    ) -> Result<(), StepFailure> {
        match &step.kind {
            StepKind::HandlerClass { handler } => match self.handlers.get(handler) {
                Some(implementation) => implementation.execute(environment, step),
                None => Err(StepFailure::new(format!(
                    "no handler registered for `{handler}`"
                ))),
            },
            StepKind::ExternalCliCommand { .. } => self.cli.execute(environment, step),
            // Raw option bundles carry data for the control plane; locally
            // they are a recorded no-op.
            StepKind::RawOptions => Ok(()),
            StepKind::FlowReference { flow } => Err(StepFailure::new(format!(
                "flow reference `{flow}` reached the engine unexpanded"
            ))),
        }
    }
}

/// Runs an arbitrary vendor-tool command line against the step's
/// environment. Credentials travel via environment variables, never argv.
struct CliCommandHandler {
    provisioner: Provisioner,
}

impl StepHandler for CliCommandHandler {
    fn execute(
        &self,
        environment: &EnvironmentHandle,
        step: &StepSpecification,
    ) -> Result<(), StepFailure> {
        let StepKind::ExternalCliCommand { command } = &step.kind else {
            return Err(StepFailure::new("cli handler requires a command step"));
        };
        let mut args: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        for (option, value) in &step.options {
            let flag = if option.len() == 1 {
                format!("-{option}")
            } else {
                format!("--{}", option.replace('_', "-"))
            };
            args.push(flag);
            // Values pass through as single argv entries, spaces and all.
            args.push(match value {
                serde_json::Value::String(raw) => raw.clone(),
                other => other.to_string(),
            });
        }
        self.provisioner
            .run_command(
                &args,
                &[
                    (
                        "JOBDOCK_INSTANCE_URL".to_string(),
                        environment.instance_url.clone(),
                    ),
                    (
                        "JOBDOCK_ACCESS_TOKEN".to_string(),
                        environment.access_token.clone(),
                    ),
                ],
            )
            .map(|_| ())
            .map_err(|err| StepFailure::new(err.to_string()))
    }
}

/// Applies one grouped run of resolved dependencies transactionally through
/// the vendor tool.
struct ApplyDependenciesHandler {
    provisioner: Provisioner,
}

impl StepHandler for ApplyDependenciesHandler {
    fn execute(
        &self,
        environment: &EnvironmentHandle,
        step: &StepSpecification,
    ) -> Result<(), StepFailure> {
        let dependencies = step
            .options
            .get("dependencies")
            .cloned()
            .unwrap_or_else(|| json!([]));
        let payload = serde_json::to_string(&dependencies)
            .map_err(|err| StepFailure::new(format!("dependency list is not serializable: {err}")))?;
        let args = vec![
            "dependency".to_string(),
            "install".to_string(),
            "--alias".to_string(),
            environment.alias.clone(),
            "--json".to_string(),
        ];
        self.provisioner
            .run_command(
                &args,
                &[
                    (
                        "JOBDOCK_INSTANCE_URL".to_string(),
                        environment.instance_url.clone(),
                    ),
                    (
                        "JOBDOCK_ACCESS_TOKEN".to_string(),
                        environment.access_token.clone(),
                    ),
                    ("JOBDOCK_DEPENDENCIES".to_string(), payload),
                ],
            )
            .map(|_| ())
            .map_err(|err| StepFailure::new(err.to_string()))
    }
}
