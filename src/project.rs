use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const PROJECT_CONFIG_FILE: &str = "project.yaml";

/// Declarative catalog of named flows, tasks, and scratch profiles for one
/// repository. Flows expand into step specifications at run time.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub flows: BTreeMap<String, FlowConfig>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,
    #[serde(default)]
    pub scratch_profiles: BTreeMap<String, ScratchProfile>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
}

/// One declared flow step. Exactly one of `task`, `flow`, `handler`, or
/// `command` selects the step shape; the resolver rejects anything else.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FlowStep {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    #[serde(default)]
    pub skip: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TaskConfig {
    pub handler: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

/// Named scratch environment profile passed to the provisioning tool.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScratchProfile {
    /// Path to the tool's environment definition file.
    pub definition: String,
    #[serde(default)]
    pub days: Option<u32>,
}

pub fn load_project_config(path: &Path) -> Result<ProjectConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|err| ConfigError::ReadProject {
        path: path.display().to_string(),
        source: err,
    })?;
    serde_yaml::from_str(&raw).map_err(|err| ConfigError::ParseProject {
        path: path.display().to_string(),
        source: err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flows_tasks_and_profiles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(PROJECT_CONFIG_FILE);
        fs::write(
            &path,
            r#"
name: widget
flows:
  ci_build:
    steps:
      - task: deploy
      - flow: run_tests
        skip: true
tasks:
  deploy:
    handler: deploy_source
    options:
      path: src
scratch_profiles:
  dev:
    definition: environments/dev.json
    days: 3
"#,
        )
        .expect("write");

        let project = load_project_config(&path).expect("load");
        assert_eq!(project.name.as_deref(), Some("widget"));
        let flow = project.flows.get("ci_build").expect("flow");
        assert_eq!(flow.steps.len(), 2);
        assert!(flow.steps[1].skip);
        assert_eq!(project.tasks.get("deploy").expect("task").handler, "deploy_source");
        assert_eq!(project.scratch_profiles.get("dev").expect("profile").days, Some(3));
    }

    #[test]
    fn missing_file_is_a_typed_error() {
        let err = load_project_config(Path::new("/nonexistent/project.yaml")).expect_err("fail");
        assert!(matches!(err, ConfigError::ReadProject { .. }));
    }
}
