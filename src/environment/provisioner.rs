use super::EnvironmentError;
use serde::Deserialize;
use serde_json::Value;
use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 600;

/// Credential fields parsed from the tool's `display` output.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentDetails {
    pub provider_id: String,
    pub principal: String,
    pub instance_url: String,
    pub access_token: String,
    #[serde(default)]
    pub principal_id: Option<String>,
    #[serde(default)]
    pub auth_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolEnvelope {
    #[serde(default)]
    result: Value,
}

/// Runner for the external environment-provisioning tool. The tool is a
/// subprocess contract: command arguments in, JSON on stdout, success by
/// exit code. Anything else is a fatal provisioning error carrying the
/// captured streams.
#[derive(Debug, Clone)]
pub struct Provisioner {
    binary: String,
    timeout: Duration,
}

impl Provisioner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Creates a scratch environment from a named definition file.
    pub fn create_scratch(
        &self,
        definition: &str,
        alias: &str,
        days: u32,
    ) -> Result<Value, EnvironmentError> {
        self.run(
            &[
                "env",
                "create",
                "--definition",
                definition,
                "--alias",
                alias,
                "--days",
                &days.to_string(),
                "--json",
            ],
            &[],
        )
    }

    /// Reads back the credential material for a locally known alias.
    pub fn display(&self, alias: &str) -> Result<EnvironmentDetails, EnvironmentError> {
        let command = format!("env display --alias {alias}");
        let result = self.run(&["env", "display", "--alias", alias, "--json"], &[])?;
        serde_json::from_value(result).map_err(|err| EnvironmentError::ToolOutput {
            command,
            reason: format!("missing credential fields: {err}"),
        })
    }

    /// Imports an access token into the tool's local keychain. The token and
    /// instance URL travel via environment variables, not argv.
    pub fn import_access_token(
        &self,
        alias: &str,
        instance_url: &str,
        access_token: &str,
    ) -> Result<Value, EnvironmentError> {
        self.run(
            &["env", "login", "--alias", alias, "--json"],
            &[
                ("JOBDOCK_INSTANCE_URL".to_string(), instance_url.to_string()),
                ("JOBDOCK_ACCESS_TOKEN".to_string(), access_token.to_string()),
            ],
        )
    }

    pub fn logout(&self, alias: &str) -> Result<Value, EnvironmentError> {
        self.run(&["env", "logout", "--alias", alias, "--json"], &[])
    }

    /// Runs an arbitrary tool invocation against an aliased environment,
    /// used by the external-cli step handler. Arguments are passed through
    /// verbatim; there is no shell in between.
    pub fn run_command(
        &self,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Value, EnvironmentError> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args, env)
    }

    fn run(&self, args: &[&str], env: &[(String, String)]) -> Result<Value, EnvironmentError> {
        let command_form = format!("{} {}", self.binary, args.join(" "));

        let mut command = Command::new(&self.binary);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(EnvironmentError::MissingBinary {
                    binary: self.binary.clone(),
                })
            }
            Err(err) => {
                return Err(EnvironmentError::Io {
                    path: self.binary.clone(),
                    source: err,
                })
            }
        };

        let stdout = child.stdout.take().ok_or_else(|| EnvironmentError::Io {
            path: self.binary.clone(),
            source: std::io::Error::other("missing stdout pipe"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| EnvironmentError::Io {
            path: self.binary.clone(),
            source: std::io::Error::other("missing stderr pipe"),
        })?;

        let stdout_reader = thread::spawn(move || {
            let mut buf = String::new();
            let mut reader = BufReader::new(stdout);
            let _ = reader.read_to_string(&mut buf);
            buf
        });
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf);
            buf
        });

        let started = Instant::now();
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() > self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(EnvironmentError::ToolTimeout {
                            command: command_form,
                            timeout_secs: self.timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    return Err(EnvironmentError::Io {
                        path: self.binary.clone(),
                        source: err,
                    })
                }
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !exit_status.success() {
            return Err(EnvironmentError::Provisioning {
                command: command_form,
                exit_code: exit_status.code(),
                stdout,
                stderr,
            });
        }

        let envelope: ToolEnvelope =
            serde_json::from_str(&stdout).map_err(|err| EnvironmentError::ToolOutput {
                command: command_form,
                reason: format!("{err}; output: {stdout}"),
            })?;
        Ok(envelope.result)
    }
}
