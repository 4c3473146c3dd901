use super::engine::{ExecutionEngine, FlowObserver};
use super::handlers::HandlerRegistry;
use super::model::{JobStatus, StepOutcome, StepResult, StepSpecification};
use super::reporter::{LogStream, StatusReporter};
use super::resolver::resolve_steps;
use super::JobError;
use crate::api::worker::JobControlApi;
use crate::environment::{AcquiredEnvironment, EnvironmentLifecycle, EnvironmentRegistry, Provisioner};
use crate::project::ProjectConfig;
use crate::shared::logging::append_run_log_line;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub retry_scratch: bool,
    pub verbose: bool,
}

/// Terminal record of one run: the status that was reported, the per-step
/// results in execution order, and the captured error when the run failed.
#[derive(Debug)]
pub struct JobRunReport {
    pub job_id: String,
    pub status: JobStatus,
    pub results: Vec<StepResult>,
    pub error: Option<String>,
}

/// Prints engine events to the console for `--verbose` runs.
struct ConsoleObserver;

impl FlowObserver for ConsoleObserver {
    fn pre_step(&mut self, step: &StepSpecification) -> Result<(), String> {
        println!("[{}] {} ...", step.step_number, step.name);
        Ok(())
    }

    fn post_step(&mut self, step: &StepSpecification, result: &StepResult) -> Result<(), String> {
        let outcome = match result.outcome {
            StepOutcome::Success => "ok",
            StepOutcome::Failure => "failed",
            StepOutcome::Skipped => "skipped",
        };
        println!("[{}] {} {outcome}", step.step_number, step.name);
        Ok(())
    }
}

/// Claims the job, acquires its environment, runs the flattened steps, and
/// guarantees that, no matter where a failure occurs, the environment is
/// cleaned up and exactly one terminal status report is sent.
///
/// A claim failure is the one exception: without a claim there is no signing
/// identity, so no report can be attempted.
pub fn run_job(
    api: &dyn JobControlApi,
    registry: &EnvironmentRegistry,
    provisioner: &Provisioner,
    handlers: &HandlerRegistry,
    project: &ProjectConfig,
    logs_dir: &Path,
    job_id: &str,
    options: RunOptions,
    stream: Option<LogStream>,
) -> Result<JobRunReport, JobError> {
    let (identity, snapshot) = api.claim_job(job_id).map_err(|source| JobError::Claim {
        job_id: job_id.to_string(),
        source,
    })?;

    let alias = snapshot.environment_alias();
    let mut lifecycle = EnvironmentLifecycle::new(registry, provisioner);
    let mut acquired: Option<AcquiredEnvironment> = None;
    let mut results: Vec<StepResult> = Vec::new();

    let error: Option<JobError> = {
        let run = |acquired: &mut Option<AcquiredEnvironment>,
                   results: &mut Vec<StepResult>,
                   lifecycle: &mut EnvironmentLifecycle<'_>|
         -> Result<(), JobError> {
            let request = snapshot.environment_request()?;
            let environment = lifecycle.acquire(
                api,
                &identity,
                project,
                &snapshot.id,
                &alias,
                &request,
                options.retry_scratch,
            )?;
            let handle = environment.handle.clone();
            // Recorded before the completion callback so cleanup still covers
            // a scratch environment whose completion call fails.
            *acquired = Some(environment);
            if let Some(environment) = acquired.as_ref() {
                lifecycle.confirm(api, &identity, environment)?;
            }

            let steps = resolve_steps(&snapshot, project, &alias)?;

            let mut engine = ExecutionEngine::new(handlers);
            let mut reporter = StatusReporter::new(api, &identity, &snapshot.id, logs_dir);
            if let Some(stream) = stream {
                reporter = reporter.with_stream(stream);
            }
            engine.add_observer(Box::new(reporter));
            if options.verbose {
                engine.add_observer(Box::new(ConsoleObserver));
            }

            let outcome = engine.run(&handle, &steps);
            for observer_error in engine.observer_errors() {
                let _ = append_run_log_line(logs_dir, &snapshot.id, observer_error);
            }
            *results = engine.take_results();
            outcome
        };
        run(&mut acquired, &mut results, &mut lifecycle).err()
    };

    // Terminal path: cleanup first, then exactly one authoritative report.
    if let Some(environment) = &acquired {
        if let Err(cleanup_error) = lifecycle.cleanup(environment) {
            let _ = append_run_log_line(
                logs_dir,
                &snapshot.id,
                &format!("environment cleanup failed: {cleanup_error}"),
            );
        }
    }

    let (status, message) = match &error {
        None => (JobStatus::Success, format!("Job {} completed", snapshot.id)),
        Some(_) => (JobStatus::Failed, format!("Job {} failed", snapshot.id)),
    };
    let error_text = error.as_ref().map(|err| err.to_string());
    let _ = append_run_log_line(logs_dir, &snapshot.id, &message);
    if let Some(error_text) = &error_text {
        let _ = append_run_log_line(logs_dir, &snapshot.id, error_text);
    }

    if let Err(report_error) =
        api.report_status(&identity, &snapshot.id, status, &message, error_text.as_deref())
    {
        let _ = append_run_log_line(
            logs_dir,
            &snapshot.id,
            &format!("terminal status report failed: {report_error}"),
        );
        if error.is_none() {
            return Err(JobError::Api(report_error));
        }
    }

    Ok(JobRunReport {
        job_id: snapshot.id,
        status,
        results,
        error: error_text,
    })
}
