use crate::api::client::ControlPlaneClient;
use crate::api::worker::WorkerApiClient;
use crate::app::cli::{help_text, parse_cli_verb, parse_job_action, CliVerb, JobAction};
use crate::config::{
    bootstrap_state_root, default_state_root_path, load_settings, Settings, StatePaths,
};
use crate::environment::{EnvironmentRegistry, Provisioner};
use crate::job::handlers::HandlerRegistry;
use crate::job::model::{JobSnapshot, JobStatus, StepKind, StepOutcome};
use crate::job::orchestrator::{run_job, RunOptions};
use crate::job::reporter::{tail_job_log, LogStream};
use crate::job::resolver::resolve_steps;
use crate::project::{load_project_config, ProjectConfig, PROJECT_CONFIG_FILE};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }

    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Job => cmd_job(&args[1..]),
        CliVerb::Setup => cmd_setup(),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{}`", args[0])),
    }
}

fn cmd_job(args: &[String]) -> Result<String, String> {
    let Some(action) = args.first() else {
        return Err("usage: job <create|run|log|steps|list> ...".to_string());
    };
    match parse_job_action(action.as_str()) {
        JobAction::Create => cmd_job_create(&args[1..]),
        JobAction::Run => cmd_job_run(&args[1..]),
        JobAction::Log => cmd_job_log(&args[1..]),
        JobAction::Steps => cmd_job_steps(&args[1..]),
        JobAction::List => cmd_job_list(&args[1..]),
        JobAction::Unknown => Err(format!("unknown job action `{action}`")),
    }
}

/// Parsed command-line tail: positionals in order, flags by long name.
/// Valued flags accept both `--flag value` and `--flag=value`.
#[derive(Debug)]
struct ParsedArgs {
    positionals: Vec<String>,
    flags: BTreeMap<String, Option<String>>,
}

impl ParsedArgs {
    fn flag_value(&self, name: &str) -> Option<&str> {
        self.flags.get(name).and_then(|value| value.as_deref())
    }

    fn has_flag(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }
}

fn parse_args(args: &[String], valued: &[&str], boolean: &[&str]) -> Result<ParsedArgs, String> {
    let mut positionals = Vec::new();
    let mut flags: BTreeMap<String, Option<String>> = BTreeMap::new();
    let mut index = 0;
    while index < args.len() {
        let arg = &args[index];
        if let Some(raw) = arg.strip_prefix("--") {
            let (name, inline_value) = match raw.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (raw.to_string(), None),
            };
            if valued.contains(&name.as_str()) {
                let value = match inline_value {
                    Some(value) => value,
                    None => {
                        index += 1;
                        args.get(index)
                            .cloned()
                            .ok_or_else(|| format!("flag --{name} requires a value"))?
                    }
                };
                flags.insert(name, Some(value));
            } else if boolean.contains(&name.as_str()) {
                if inline_value.is_some() {
                    return Err(format!("flag --{name} does not take a value"));
                }
                flags.insert(name, None);
            } else {
                return Err(format!("unknown flag --{name}"));
            }
        } else {
            positionals.push(arg.clone());
        }
        index += 1;
    }
    Ok(ParsedArgs { positionals, flags })
}

fn load_cli_context() -> Result<(Settings, StatePaths), String> {
    let root = default_state_root_path().map_err(|err| err.to_string())?;
    let paths = StatePaths::new(root);
    bootstrap_state_root(&paths)
        .map_err(|err| format!("failed to create state directories: {err}"))?;
    let settings = load_settings(&paths.settings_file()).map_err(|err| err.to_string())?;
    Ok((settings, paths))
}

fn load_project() -> Result<ProjectConfig, String> {
    load_project_config(Path::new(PROJECT_CONFIG_FILE)).map_err(|err| err.to_string())
}

fn cmd_setup() -> Result<String, String> {
    let root = default_state_root_path().map_err(|err| err.to_string())?;
    let paths = StatePaths::new(root);
    bootstrap_state_root(&paths)
        .map_err(|err| format!("failed to create state directories: {err}"))?;
    let settings_file = paths.settings_file();
    if !settings_file.exists() {
        let skeleton = "base_url: https://cloud.example.com\ntenant: my-tenant\ntoken: replace-me\n";
        std::fs::write(&settings_file, skeleton)
            .map_err(|err| format!("failed to write {}: {err}", settings_file.display()))?;
    }
    Ok(format!(
        "State root ready at {}\nEdit {} before running jobs",
        paths.root.display(),
        settings_file.display()
    ))
}

fn cmd_job_create(args: &[String]) -> Result<String, String> {
    let parsed = parse_args(
        args,
        &["flow", "task", "plan-version", "env-user", "scratch"],
        &[],
    )?;
    if !parsed.positionals.is_empty() {
        return Err("job create takes no positional arguments".to_string());
    }

    let work: Vec<(&str, &str)> = [
        ("flow", parsed.flag_value("flow")),
        ("task", parsed.flag_value("task")),
        ("plan_version", parsed.flag_value("plan-version")),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.map(|v| (key, v)))
    .collect();
    if work.len() != 1 {
        return Err("job create requires exactly one of --flow, --task, --plan-version".to_string());
    }

    let env_user = parsed.flag_value("env-user");
    let scratch = parsed.flag_value("scratch");
    if env_user.is_some() == scratch.is_some() {
        return Err("job create requires exactly one of --env-user, --scratch".to_string());
    }

    let mut body = serde_json::Map::new();
    let (work_key, work_value) = work[0];
    body.insert(work_key.to_string(), json!(work_value));
    if let Some(user) = env_user {
        body.insert("environment_user_id".to_string(), json!(user));
    }
    if let Some(profile) = scratch {
        body.insert("scratch_request".to_string(), json!({ "profile": profile }));
    }

    let (settings, _paths) = load_cli_context()?;
    let client = ControlPlaneClient::new(&settings.base_url, &settings.tenant, &settings.token);
    let created = client
        .create("jobs", &Value::Object(body))
        .map_err(|err| err.to_string())?;
    let id = created
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| "control plane returned a job without an id".to_string())?;
    Ok(format!("Queued job {id}"))
}

fn cmd_job_run(args: &[String]) -> Result<String, String> {
    let parsed = parse_args(args, &[], &["retry-scratch", "verbose"])?;
    let [job_id] = parsed.positionals.as_slice() else {
        return Err("usage: job run <job_id> [--retry-scratch] [--verbose]".to_string());
    };

    let (settings, paths) = load_cli_context()?;
    let project = load_project()?;
    let api = WorkerApiClient::new(&settings.base_url, &settings.tenant, &settings.token);
    let registry = EnvironmentRegistry::new(paths.environments_dir());
    let provisioner = Provisioner::new(settings.provisioner_binary());
    let handlers = HandlerRegistry::new(provisioner.clone());
    let stream = LogStream::connect(&settings.websocket_base(), &settings.tenant, job_id, &settings.token);

    let report = run_job(
        &api,
        &registry,
        &provisioner,
        &handlers,
        &project,
        &paths.logs_dir(),
        job_id,
        RunOptions {
            retry_scratch: parsed.has_flag("retry-scratch"),
            verbose: parsed.has_flag("verbose"),
        },
        Some(stream),
    )
    .map_err(|err| err.to_string())?;

    let mut lines = Vec::new();
    for result in &report.results {
        let outcome = match result.outcome {
            StepOutcome::Success => "ok",
            StepOutcome::Failure => "failed",
            StepOutcome::Skipped => "skipped",
        };
        lines.push(format!("  {0:<10} {1:<40} {outcome}", result.step_number.to_string(), result.name));
    }
    match report.status {
        JobStatus::Failed => Err(format!(
            "Job {} failed: {}",
            report.job_id,
            report.error.as_deref().unwrap_or("unknown error")
        )),
        _ => {
            lines.push(format!("Job {} {}", report.job_id, report.status));
            Ok(lines.join("\n"))
        }
    }
}

fn cmd_job_log(args: &[String]) -> Result<String, String> {
    let parsed = parse_args(args, &[], &[])?;
    let [job_id] = parsed.positionals.as_slice() else {
        return Err("usage: job log <job_id>".to_string());
    };

    let (settings, _paths) = load_cli_context()?;
    tail_job_log(
        &settings.websocket_base(),
        &settings.tenant,
        job_id,
        &settings.token,
        |line| println!("{line}"),
    )?;
    Ok(format!("Log stream for job {job_id} closed"))
}

fn cmd_job_steps(args: &[String]) -> Result<String, String> {
    let parsed = parse_args(args, &[], &[])?;
    let [job_id] = parsed.positionals.as_slice() else {
        return Err("usage: job steps <job_id>".to_string());
    };

    let (settings, _paths) = load_cli_context()?;
    let project = load_project()?;
    let client = ControlPlaneClient::new(&settings.base_url, &settings.tenant, &settings.token);
    let raw = client.read("jobs", job_id).map_err(|err| err.to_string())?;
    let snapshot: JobSnapshot = serde_json::from_value(raw)
        .map_err(|err| format!("job {job_id} has an unreadable shape: {err}"))?;

    let alias = snapshot.environment_alias();
    let steps = resolve_steps(&snapshot, &project, &alias).map_err(|err| err.to_string())?;
    let mut lines = vec![format!("Job {} ({} steps):", snapshot.id, steps.len())];
    for step in &steps {
        lines.push(format!(
            "  {0:<10} {1:<40} {2}",
            step.step_number.to_string(),
            step.name,
            step_kind_label(&step.kind)
        ));
    }
    Ok(lines.join("\n"))
}

fn step_kind_label(kind: &StepKind) -> String {
    match kind {
        StepKind::HandlerClass { handler } => format!("handler {handler}"),
        StepKind::FlowReference { flow } => format!("flow {flow}"),
        StepKind::RawOptions => "options".to_string(),
        StepKind::ExternalCliCommand { command } => format!("command {command}"),
    }
}

fn cmd_job_list(args: &[String]) -> Result<String, String> {
    let parsed = parse_args(args, &["status"], &[])?;
    if !parsed.positionals.is_empty() {
        return Err("usage: job list [--status a,b]".to_string());
    }

    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(statuses) = parsed.flag_value("status") {
        for status in statuses.split(',') {
            JobStatus::parse(status)?;
        }
        query.push(("status", statuses.to_string()));
    }

    let (settings, _paths) = load_cli_context()?;
    let client = ControlPlaneClient::new(&settings.base_url, &settings.tenant, &settings.token);
    let jobs = client.list("jobs", &query).map_err(|err| err.to_string())?;
    if jobs.is_empty() {
        return Ok("No jobs found".to_string());
    }

    let mut lines = vec![format!("  {0:<24} {1:<12} {2}", "ID", "STATUS", "WORK")];
    for job in &jobs {
        let id = job.get("id").and_then(Value::as_str).unwrap_or("-");
        let status = job.get("status").and_then(Value::as_str).unwrap_or("-");
        let work = ["flow", "task", "plan_version"]
            .iter()
            .find_map(|key| {
                job.get(*key)
                    .and_then(Value::as_str)
                    .map(|value| format!("{key} {value}"))
            })
            .unwrap_or_else(|| "steps".to_string());
        lines.push(format!("  {id:<24} {status:<12} {work}"));
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn empty_args_print_help() {
        let output = run_cli(Vec::new()).expect("help");
        assert!(output.contains("job run <job_id>"));
    }

    #[test]
    fn unknown_verb_is_an_error() {
        assert!(run_cli(strings(&["frobnicate"])).is_err());
    }

    #[test]
    fn create_requires_exactly_one_work_flag() {
        let err = cmd_job_create(&strings(&["--flow", "ci", "--task", "deploy", "--scratch", "dev"]))
            .expect_err("must fail");
        assert!(err.contains("exactly one of --flow"));

        let err = cmd_job_create(&strings(&["--scratch", "dev"])).expect_err("must fail");
        assert!(err.contains("exactly one of --flow"));
    }

    #[test]
    fn create_requires_exactly_one_environment_flag() {
        let err = cmd_job_create(&strings(&["--flow", "ci"])).expect_err("must fail");
        assert!(err.contains("exactly one of --env-user"));

        let err = cmd_job_create(&strings(&[
            "--flow", "ci", "--env-user", "u-1", "--scratch", "dev",
        ]))
        .expect_err("must fail");
        assert!(err.contains("exactly one of --env-user"));
    }

    #[test]
    fn flags_accept_equals_form() {
        let parsed = parse_args(&strings(&["--status=failed,success"]), &["status"], &[])
            .expect("parse");
        assert_eq!(parsed.flag_value("status"), Some("failed,success"));
    }

    #[test]
    fn valued_flag_without_value_is_rejected() {
        let err = parse_args(&strings(&["--status"]), &["status"], &[]).expect_err("must fail");
        assert!(err.contains("requires a value"));
    }

    #[test]
    fn list_rejects_invalid_status_filter() {
        let err = cmd_job_list(&strings(&["--status", "bogus"])).expect_err("must fail");
        assert!(err.contains("status must be one of"));
    }
}
