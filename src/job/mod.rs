pub mod engine;
pub mod handlers;
pub mod model;
pub mod orchestrator;
pub mod reporter;
pub mod resolver;

use crate::api::ApiError;
use crate::config::ConfigError;
use crate::environment::EnvironmentError;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("failed to claim job `{job_id}`: {source}")]
    Claim {
        job_id: String,
        #[source]
        source: ApiError,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("job declares no work (expected a flow, task, plan version, or step list)")]
    MissingDeclaredWork,
    #[error("job declares more than one kind of work; flow, task, plan version, and step list are mutually exclusive")]
    AmbiguousDeclaredWork,
    #[error("running a job from a plan version is not supported")]
    PlanVersionUnsupported,
    #[error("job requests no environment (expected an environment user id or a scratch request)")]
    MissingEnvironmentRequest,
    #[error("job requests both an environment user and a scratch environment")]
    AmbiguousEnvironmentRequest,
    #[error("flow `{flow}` is not defined in the project config")]
    UnknownFlow { flow: String },
    #[error("task `{task}` is not defined in the project config")]
    UnknownTask { task: String },
    #[error("step {step_number} has an unsupported shape: {reason}")]
    UnsupportedStepKind { step_number: String, reason: String },
    #[error("step {step_number} `{name}` failed: {reason}")]
    StepExecution {
        step_number: String,
        name: String,
        reason: String,
    },
}
