use super::engine::FlowObserver;
use super::model::{JobStatus, StepOutcome, StepResult, StepSpecification};
use crate::api::worker::JobControlApi;
use crate::api::SigningIdentity;
use crate::shared::logging::append_run_log_line;
use std::path::PathBuf;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;

const STREAM_BUFFER_CAPACITY: usize = 256;

pub fn job_log_channel_url(ws_base: &str, tenant: &str, job_id: &str) -> String {
    format!("{}/d2x/{tenant}/jobs/{job_id}/log", ws_base.trim_end_matches('/'))
}

/// Fire-and-forget websocket feed of run log lines. A lost connection or a
/// full buffer drops lines; it never blocks step execution and never stands
/// in for the authoritative status calls.
pub struct LogStream {
    sender: SyncSender<String>,
}

impl LogStream {
    pub fn connect(ws_base: &str, tenant: &str, job_id: &str, token: &str) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<String>(STREAM_BUFFER_CAPACITY);
        let url = job_log_channel_url(ws_base, tenant, job_id);
        let token = token.to_string();

        thread::spawn(move || {
            let mut socket = open_socket(&url, &token);
            for line in receiver {
                if let Some(active) = socket.as_mut() {
                    if active
                        .send(tungstenite::Message::Text(line))
                        .is_err()
                    {
                        // Drop the connection and keep draining the channel.
                        socket = None;
                    }
                }
            }
            if let Some(mut active) = socket {
                let _ = active.close(None);
            }
        });

        Self { sender }
    }

    pub fn send(&self, line: &str) {
        match self.sender.try_send(line.to_string()) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

type Socket = tungstenite::WebSocket<tungstenite::stream::MaybeTlsStream<std::net::TcpStream>>;

fn open_socket(url: &str, token: &str) -> Option<Socket> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url.into_client_request().ok()?;
    let header = format!("Bearer {token}").parse().ok()?;
    request.headers_mut().insert("Authorization", header);
    tungstenite::connect(request).ok().map(|(socket, _)| socket)
}

/// Tails a job's log channel, invoking `on_line` per text message until the
/// server closes the stream. Used by `job log`.
pub fn tail_job_log(
    ws_base: &str,
    tenant: &str,
    job_id: &str,
    token: &str,
    mut on_line: impl FnMut(&str),
) -> Result<(), String> {
    use tungstenite::client::IntoClientRequest;

    let url = job_log_channel_url(ws_base, tenant, job_id);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| format!("invalid log channel url {url}: {err}"))?;
    let header = format!("Bearer {token}")
        .parse()
        .map_err(|_| "bearer token is not a valid header value".to_string())?;
    request.headers_mut().insert("Authorization", header);

    let (mut socket, _) = tungstenite::connect(request)
        .map_err(|err| format!("failed to connect to log channel {url}: {err}"))?;
    loop {
        match socket.read() {
            Ok(tungstenite::Message::Text(text)) => on_line(&text),
            Ok(tungstenite::Message::Close(_)) | Err(tungstenite::Error::ConnectionClosed) => {
                return Ok(())
            }
            Ok(_) => {}
            Err(err) => return Err(format!("log channel error: {err}")),
        }
    }
}

/// Translates engine lifecycle events into signed in-progress status calls,
/// the local run log, and the optional stream. Intermediate delivery
/// failures surface as observer errors (recorded, never fatal); the terminal
/// report is the orchestrator's job, not this observer's.
pub struct StatusReporter<'a> {
    api: &'a dyn JobControlApi,
    identity: &'a SigningIdentity,
    job_id: String,
    logs_dir: PathBuf,
    stream: Option<LogStream>,
}

impl<'a> StatusReporter<'a> {
    pub fn new(
        api: &'a dyn JobControlApi,
        identity: &'a SigningIdentity,
        job_id: impl Into<String>,
        logs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            identity,
            job_id: job_id.into(),
            logs_dir: logs_dir.into(),
            stream: None,
        }
    }

    pub fn with_stream(mut self, stream: LogStream) -> Self {
        self.stream = Some(stream);
        self
    }

    fn emit(&mut self, message: &str) -> Result<(), String> {
        let _ = append_run_log_line(&self.logs_dir, &self.job_id, message);
        if let Some(stream) = &self.stream {
            stream.send(message);
        }
        self.api
            .report_status(self.identity, &self.job_id, JobStatus::InProgress, message, None)
            .map_err(|err| format!("status report failed: {err}"))
    }
}

impl FlowObserver for StatusReporter<'_> {
    fn pre_flow(&mut self, steps: &[StepSpecification]) -> Result<(), String> {
        let message = format!("Job {} started ({} steps)", self.job_id, steps.len());
        self.emit(&message)
    }

    fn pre_step(&mut self, step: &StepSpecification) -> Result<(), String> {
        let message = format!("Step {} {} started", step.step_number, step.name);
        self.emit(&message)
    }

    fn post_step(&mut self, step: &StepSpecification, result: &StepResult) -> Result<(), String> {
        let message = match result.outcome {
            StepOutcome::Failure => format!(
                "Step {} {} failed: {}",
                step.step_number,
                step.name,
                result.error.as_deref().unwrap_or("unknown error")
            ),
            _ => format!("Step {} {} completed", step.step_number, step.name),
        };
        self.emit(&message)
    }

    fn post_flow(&mut self, results: &[StepResult]) -> Result<(), String> {
        let message = format!("Job {} finished {} steps", self.job_id, results.len());
        self.emit(&message)
    }
}
