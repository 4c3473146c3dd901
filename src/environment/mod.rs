pub mod lifecycle;
pub mod provisioner;
pub mod registry;

pub use lifecycle::{AcquiredEnvironment, EnvironmentLifecycle, EnvironmentState};
pub use provisioner::Provisioner;
pub use registry::{EnvironmentHandle, EnvironmentRegistry};

use crate::api::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error(
        "provisioning tool failed running `{command}` (exit {exit_code:?})\nstdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    Provisioning {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("provisioning tool output for `{command}` is not valid json: {reason}")]
    ToolOutput { command: String, reason: String },
    #[error("provisioning tool binary `{binary}` not found")]
    MissingBinary { binary: String },
    #[error("provisioning tool timed out after {timeout_secs}s running `{command}`")]
    ToolTimeout { command: String, timeout_secs: u64 },
    #[error(
        "environment `{alias}` is already registered as {registered_provider_id} ({registered_principal}) but the control plane record is {fetched_provider_id} ({fetched_principal})"
    )]
    Conflict {
        alias: String,
        registered_provider_id: String,
        registered_principal: String,
        fetched_provider_id: String,
        fetched_principal: String,
    },
    #[error("environment `{alias}` is not registered")]
    NotRegistered { alias: String },
    #[error(
        "scratch request `{request_id}` has status `{status}` and cannot be provisioned; pass --retry-scratch to retry a failed request"
    )]
    ScratchNotRetryable { request_id: String, status: String },
    #[error("scratch profile `{profile}` is not defined in the project config")]
    UnknownScratchProfile { profile: String },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
