use chrono::Utc;
use jobdock::api::worker::{CredentialBundle, JobControlApi, ScratchCompletion};
use jobdock::api::{ApiError, SigningIdentity};
use jobdock::environment::{EnvironmentHandle, EnvironmentRegistry, Provisioner};
use jobdock::job::handlers::HandlerRegistry;
use jobdock::job::model::{JobSnapshot, JobStatus, StepOutcome};
use jobdock::job::orchestrator::{run_job, RunOptions};
use jobdock::job::JobError;
use jobdock::project::ProjectConfig;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

struct MockApi {
    snapshot: Value,
    fail_claim: bool,
    fail_completion: bool,
    credential: Option<CredentialBundle>,
    status_calls: RefCell<Vec<(JobStatus, String, Option<String>)>>,
    completions: RefCell<Vec<ScratchCompletion>>,
}

impl MockApi {
    fn new(snapshot: Value) -> Self {
        Self {
            snapshot,
            fail_claim: false,
            fail_completion: false,
            credential: None,
            status_calls: RefCell::new(Vec::new()),
            completions: RefCell::new(Vec::new()),
        }
    }

    fn with_credential(mut self, credential: CredentialBundle) -> Self {
        self.credential = Some(credential);
        self
    }

    fn rejecting_claims(mut self) -> Self {
        self.fail_claim = true;
        self
    }

    fn rejecting_completions(mut self) -> Self {
        self.fail_completion = true;
        self
    }

    fn terminal_calls(&self, status: JobStatus) -> Vec<(JobStatus, String, Option<String>)> {
        self.status_calls
            .borrow()
            .iter()
            .filter(|(s, _, _)| *s == status)
            .cloned()
            .collect()
    }
}

impl JobControlApi for MockApi {
    fn claim_job(&self, _job_id: &str) -> Result<(SigningIdentity, JobSnapshot), ApiError> {
        if self.fail_claim {
            return Err(ApiError::Authorization {
                status: 403,
                body: "forbidden".to_string(),
            });
        }
        let identity = SigningIdentity::generate()?;
        let snapshot =
            serde_json::from_value(self.snapshot.clone()).map_err(|err| ApiError::Decode {
                url: "mock".to_string(),
                reason: err.to_string(),
            })?;
        Ok((identity, snapshot))
    }

    fn report_status(
        &self,
        _identity: &SigningIdentity,
        _job_id: &str,
        status: JobStatus,
        log: &str,
        error: Option<&str>,
    ) -> Result<(), ApiError> {
        self.status_calls
            .borrow_mut()
            .push((status, log.to_string(), error.map(str::to_string)));
        Ok(())
    }

    fn fetch_environment_credential(
        &self,
        _identity: &SigningIdentity,
        _job_id: &str,
        environment_user_id: &str,
    ) -> Result<CredentialBundle, ApiError> {
        self.credential.clone().ok_or_else(|| ApiError::NotFound {
            resource: format!("environment user {environment_user_id}"),
        })
    }

    fn complete_scratch_request(
        &self,
        _identity: &SigningIdentity,
        _request_id: &str,
        completion: &ScratchCompletion,
    ) -> Result<(), ApiError> {
        if self.fail_completion {
            return Err(ApiError::Server {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        self.completions.borrow_mut().push(completion.clone());
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    registry: EnvironmentRegistry,
    provisioner: Provisioner,
    handlers: HandlerRegistry,
    logs_dir: PathBuf,
    calls_log: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let environments = dir.path().join("environments");
        let logs_dir = dir.path().join("logs");
        fs::create_dir_all(&environments).expect("environments dir");
        fs::create_dir_all(&logs_dir).expect("logs dir");

        let calls_log = dir.path().join("calls.log");
        let stub = dir.path().join("tool-stub");
        let script = format!(
            concat!(
                "#!/bin/sh\n",
                "echo \"$@\" >> {log}\n",
                "if [ \"$1\" = env ] && [ \"$2\" = display ]; then\n",
                "  echo '{{\"result\":{{\"provider_id\":\"00D000000000111AAA\",",
                "\"principal\":\"scratch@example.com\",",
                "\"instance_url\":\"https://scratch.example.com\",",
                "\"access_token\":\"sek\"}}}}'\n",
                "else\n",
                "  echo '{{\"result\":{{}}}}'\n",
                "fi\n"
            ),
            log = calls_log.display()
        );
        fs::write(&stub, script).expect("write stub");
        let mut perms = fs::metadata(&stub).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&stub, perms).expect("chmod");

        let provisioner = Provisioner::new(stub.display().to_string());
        Self {
            registry: EnvironmentRegistry::new(environments),
            handlers: HandlerRegistry::new(provisioner.clone()),
            provisioner,
            logs_dir,
            calls_log,
            _dir: dir,
        }
    }

    fn run(&self, api: &MockApi, project: &ProjectConfig, job_id: &str) -> Result<jobdock::job::orchestrator::JobRunReport, JobError> {
        run_job(
            api,
            &self.registry,
            &self.provisioner,
            &self.handlers,
            project,
            &self.logs_dir,
            job_id,
            RunOptions::default(),
            None,
        )
    }

    fn tool_calls(&self) -> String {
        fs::read_to_string(&self.calls_log).unwrap_or_default()
    }
}

fn project_with_profile() -> ProjectConfig {
    serde_yaml::from_str(
        r#"
scratch_profiles:
  dev:
    definition: environments/dev.json
    days: 1
"#,
    )
    .expect("project yaml")
}

fn raw_step(name: &str) -> Value {
    json!({
        "name": name,
        "config": {"type": "raw_options", "options": {"note": name}}
    })
}

#[test]
fn pending_scratch_provisions_runs_and_tears_down() {
    let harness = Harness::new();
    let api = MockApi::new(json!({
        "id": "j-100",
        "status": "queued",
        "steps": [raw_step("one"), raw_step("two"), raw_step("three")],
        "scratch_request": {
            "id": "req-1",
            "status": "pending",
            "profile": "dev",
            "environment_name": "ci"
        }
    }));

    let report = harness
        .run(&api, &project_with_profile(), "j-100")
        .expect("run");

    assert_eq!(report.status, JobStatus::Success);
    assert_eq!(report.results.len(), 3);
    assert!(report
        .results
        .iter()
        .all(|result| result.outcome == StepOutcome::Success));
    assert!(report.error.is_none());

    // The new environment was reported to the control plane exactly once.
    let completions = api.completions.borrow();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].provider_id, "00D000000000111AAA");

    assert_eq!(api.terminal_calls(JobStatus::Success).len(), 1);
    assert!(api.terminal_calls(JobStatus::Failed).is_empty());
    assert!(api.terminal_calls(JobStatus::InProgress).len() >= 3);

    let calls = harness.tool_calls();
    assert!(calls.contains("env create"));
    assert!(calls.contains("env display"));
    assert!(calls.contains("env logout"));
    assert!(!harness.registry.registered("jobd-j-100"));
}

#[test]
fn completion_failure_still_tears_down_created_scratch() {
    let harness = Harness::new();
    let api = MockApi::new(json!({
        "id": "j-150",
        "status": "queued",
        "steps": [raw_step("one")],
        "scratch_request": {
            "id": "req-2",
            "status": "pending",
            "profile": "dev",
            "environment_name": "ci"
        }
    }))
    .rejecting_completions();

    let report = harness
        .run(&api, &project_with_profile(), "j-150")
        .expect("run returns a report");

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.results.is_empty());
    assert!(report.error.as_deref().is_some_and(|e| e.contains("500")));

    // The environment was created but its registration was rejected, so the
    // run still owns it: local removal and remote logout both happen.
    let calls = harness.tool_calls();
    assert!(calls.contains("env create"));
    assert!(calls.contains("env display"));
    assert!(calls.contains("env logout"));
    assert!(!harness.registry.registered("jobd-j-150"));

    assert!(api.completions.borrow().is_empty());
    assert_eq!(api.terminal_calls(JobStatus::Failed).len(), 1);
}

#[test]
fn step_failure_halts_reports_failed_and_skips_remote_teardown() {
    let harness = Harness::new();
    let api = MockApi::new(json!({
        "id": "j-200",
        "status": "queued",
        "steps": [
            raw_step("one"),
            {"name": "boom", "config": {"type": "handler_class", "handler": "boom"}},
            raw_step("three")
        ],
        "environment_user_id": "user-9"
    }))
    .with_credential(CredentialBundle {
        provider_id: "00D000000000222AAA".to_string(),
        principal: "user@example.com".to_string(),
        instance_url: "https://user.example.com".to_string(),
        access_token: "tok-user".to_string(),
        environment_name: None,
    });

    let report = harness
        .run(&api, &ProjectConfig::default(), "j-200")
        .expect("run returns a report");

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[0].outcome, StepOutcome::Success);
    assert_eq!(report.results[1].outcome, StepOutcome::Failure);
    let error = report.error.expect("captured error");
    assert!(error.contains("no handler registered"));

    let failed = api.terminal_calls(JobStatus::Failed);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].2.as_deref().is_some_and(|e| e.contains("boom")));
    assert!(api.terminal_calls(JobStatus::Success).is_empty());

    // Imported environments are released locally but never logged out.
    let calls = harness.tool_calls();
    assert!(calls.contains("env login"));
    assert!(!calls.contains("env logout"));
    assert!(!harness.registry.registered("jobd-j-200"));
}

#[test]
fn rejected_claim_aborts_before_any_report() {
    let harness = Harness::new();
    let api = MockApi::new(json!({
        "id": "j-300",
        "status": "queued",
        "steps": [raw_step("one")],
        "environment_user_id": "user-9"
    }))
    .rejecting_claims();

    let err = harness
        .run(&api, &ProjectConfig::default(), "j-300")
        .expect_err("claim must fail");

    assert!(matches!(
        err,
        JobError::Claim {
            source: ApiError::Authorization { status: 403, .. },
            ..
        }
    ));
    assert!(api.status_calls.borrow().is_empty());
    assert!(api.completions.borrow().is_empty());
    assert!(harness.tool_calls().is_empty());
}

#[test]
fn resolution_failure_after_acquisition_still_cleans_up() {
    let harness = Harness::new();
    let api = MockApi::new(json!({
        "id": "j-400",
        "status": "queued",
        "flow": "missing",
        "environment_user_id": "user-9"
    }))
    .with_credential(CredentialBundle {
        provider_id: "00D000000000222AAA".to_string(),
        principal: "user@example.com".to_string(),
        instance_url: "https://user.example.com".to_string(),
        access_token: "tok-user".to_string(),
        environment_name: None,
    });

    let report = harness
        .run(&api, &ProjectConfig::default(), "j-400")
        .expect("run returns a report");

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.results.is_empty());
    assert!(report
        .error
        .as_deref()
        .is_some_and(|e| e.contains("missing")));

    assert_eq!(api.terminal_calls(JobStatus::Failed).len(), 1);
    assert!(harness.tool_calls().contains("env login"));
    assert!(!harness.registry.registered("jobd-j-400"));
}

#[test]
fn conflicting_local_registration_aborts_before_any_step() {
    let harness = Harness::new();
    harness
        .registry
        .import(&EnvironmentHandle {
            alias: "jobd-j-450".to_string(),
            provider_id: "00D000000000999AAA".to_string(),
            principal: "stale@example.com".to_string(),
            instance_url: "https://stale.example.com".to_string(),
            access_token: "stale".to_string(),
            scratch: false,
            last_refreshed: Utc::now(),
        })
        .expect("pre-register");

    let api = MockApi::new(json!({
        "id": "j-450",
        "status": "queued",
        "steps": [raw_step("one")],
        "environment_user_id": "user-9"
    }))
    .with_credential(CredentialBundle {
        provider_id: "00D000000000222AAA".to_string(),
        principal: "user@example.com".to_string(),
        instance_url: "https://user.example.com".to_string(),
        access_token: "tok-user".to_string(),
        environment_name: None,
    });

    let report = harness
        .run(&api, &ProjectConfig::default(), "j-450")
        .expect("run returns a report");

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.results.is_empty());
    assert!(report
        .error
        .as_deref()
        .is_some_and(|e| e.contains("already registered")));

    // The conflict fires before anything touches the tool keychain, and the
    // stale record is left exactly as it was.
    assert!(!harness.tool_calls().contains("env login"));
    let kept = harness
        .registry
        .get("jobd-j-450")
        .expect("get")
        .expect("still present");
    assert_eq!(kept.principal, "stale@example.com");
}

#[test]
fn non_retryable_scratch_status_fails_without_provisioning() {
    let harness = Harness::new();
    let api = MockApi::new(json!({
        "id": "j-500",
        "status": "queued",
        "steps": [raw_step("one")],
        "scratch_request": {
            "id": "req-5",
            "status": "failed",
            "profile": "dev",
            "environment_name": "ci"
        }
    }));

    let report = harness
        .run(&api, &project_with_profile(), "j-500")
        .expect("run returns a report");

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report
        .error
        .as_deref()
        .is_some_and(|e| e.contains("--retry-scratch")));
    assert!(api.completions.borrow().is_empty());
    assert!(!harness.tool_calls().contains("env create"));
    assert_eq!(api.terminal_calls(JobStatus::Failed).len(), 1);
}
