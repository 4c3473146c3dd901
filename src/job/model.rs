use super::JobError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim() {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err("status must be one of: queued, in_progress, success, failed".to_string()),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Source revision to run against. The control plane resolves it; the client
/// only carries it through to the checkout collaborator.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceRef {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScratchRequestStatus {
    Pending,
    Creating,
    Success,
    Failed,
}

/// A control-plane request to create a short-lived scratch environment for
/// one job. `failed`/`pending` are re-enterable only via an explicit retry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScratchRequest {
    pub id: String,
    pub status: ScratchRequestStatus,
    /// Named scratch profile in the project config.
    pub profile: String,
    #[serde(default)]
    pub days: Option<u32>,
    /// Base name for the environment; the job id is appended at provision time.
    pub environment_name: String,
}

/// Step shape tag. The orchestrator treats each step as an opaque, named,
/// configurable unit; only sequencing and expansion semantics live here.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    HandlerClass { handler: String },
    FlowReference { flow: String },
    RawOptions,
    ExternalCliCommand { command: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StepConfig {
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    #[serde(default)]
    pub skip: bool,
}

/// One raw, unflattened step as carried on the job record.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StepRecord {
    #[serde(default)]
    pub name: Option<String>,
    pub config: StepConfig,
}

/// Output of the out-of-band dependency resolution step. Dependency entries
/// are opaque to the orchestrator; step entries are spliced in as-is.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyEntry {
    Dependency { config: Value },
    Step { name: String, config: StepConfig },
}

/// Dot-decimal step position ("2.1.3"). Total order is numeric per segment
/// with a shorter prefix ordering first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StepNumber(Vec<u32>);

impl StepNumber {
    pub fn root(position: u32) -> Self {
        Self(vec![position])
    }

    pub fn child(&self, position: u32) -> Self {
        let mut segments = self.0.clone();
        segments.push(position);
        Self(segments)
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let segments = raw
            .split('.')
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| format!("step number segment `{part}` is not a number"))
            })
            .collect::<Result<Vec<u32>, String>>()?;
        if segments.is_empty() {
            return Err("step number must be non-empty".to_string());
        }
        Ok(Self(segments))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for StepNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = self
            .0
            .iter()
            .map(|segment| segment.to_string())
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{rendered}")
    }
}

impl From<StepNumber> for String {
    fn from(value: StepNumber) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for StepNumber {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// One flattened, orderable unit of work within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpecification {
    pub step_number: StepNumber,
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    /// Local alias of the environment this step runs against.
    pub environment_alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    Skipped,
}

/// Immutable record of one executed step, appended in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_number: StepNumber,
    pub name: String,
    pub outcome: StepOutcome,
    #[serde(default)]
    pub error: Option<String>,
}

/// Read-mostly snapshot of one control-plane job, held for the duration of a
/// single run. The control plane owns the authoritative record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub plan_version: Option<String>,
    #[serde(default)]
    pub steps: Option<Vec<StepRecord>>,
    #[serde(default)]
    pub environment_user_id: Option<String>,
    #[serde(default)]
    pub scratch_request: Option<ScratchRequest>,
    #[serde(default)]
    pub source_ref: Option<SourceRef>,
    #[serde(default)]
    pub resolved_dependencies: Option<Vec<DependencyEntry>>,
}

/// Exactly one of the four declared-work shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclaredWork<'a> {
    Flow(&'a str),
    Task(&'a str),
    PlanVersion(&'a str),
    Steps(&'a [StepRecord]),
}

/// Exactly one of the two environment-request shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvironmentRequest<'a> {
    ExistingUser(&'a str),
    Scratch(&'a ScratchRequest),
}

impl JobSnapshot {
    pub fn declared_work(&self) -> Result<DeclaredWork<'_>, JobError> {
        let mut found: Vec<DeclaredWork<'_>> = Vec::new();
        if let Some(flow) = self.flow.as_deref() {
            found.push(DeclaredWork::Flow(flow));
        }
        if let Some(task) = self.task.as_deref() {
            found.push(DeclaredWork::Task(task));
        }
        if let Some(plan_version) = self.plan_version.as_deref() {
            found.push(DeclaredWork::PlanVersion(plan_version));
        }
        if let Some(steps) = self.steps.as_deref() {
            found.push(DeclaredWork::Steps(steps));
        }
        match found.len() {
            0 => Err(JobError::MissingDeclaredWork),
            1 => Ok(found.remove(0)),
            _ => Err(JobError::AmbiguousDeclaredWork),
        }
    }

    pub fn environment_request(&self) -> Result<EnvironmentRequest<'_>, JobError> {
        match (self.environment_user_id.as_deref(), self.scratch_request.as_ref()) {
            (Some(_), Some(_)) => Err(JobError::AmbiguousEnvironmentRequest),
            (Some(user), None) => Ok(EnvironmentRequest::ExistingUser(user)),
            (None, Some(scratch)) => Ok(EnvironmentRequest::Scratch(scratch)),
            (None, None) => Err(JobError::MissingEnvironmentRequest),
        }
    }

    /// Deterministic local alias for this job's environment.
    pub fn environment_alias(&self) -> String {
        format!("jobd-{}", self.id)
    }
}
