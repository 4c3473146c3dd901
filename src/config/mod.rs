use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_ROOT_DIR: &str = ".jobdock";
pub const DEFAULT_SCRATCH_DAYS: u32 = 1;
pub const DEFAULT_PROVISIONER_BINARY: &str = "sf";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to resolve home directory for state root")]
    HomeDirectoryUnavailable,
    #[error("failed to read settings {path}: {source}")]
    ReadSettings {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings {path}: {source}")]
    ParseSettings {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings field `{field}` {reason}")]
    InvalidField { field: String, reason: String },
    #[error("failed to read project config {path}: {source}")]
    ReadProject {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse project config {path}: {source}")]
    ParseProject {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Filesystem layout under the jobdock state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn environments_dir(&self) -> PathBuf {
        self.root.join("environments")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![self.environments_dir(), self.logs_dir()]
    }
}

pub fn default_state_root_path() -> Result<PathBuf, ConfigError> {
    if let Some(root) = std::env::var_os("JOBDOCK_STATE_ROOT") {
        return Ok(PathBuf::from(root));
    }
    let home = std::env::var_os("HOME").ok_or(ConfigError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_ROOT_DIR))
}

pub fn bootstrap_state_root(paths: &StatePaths) -> std::io::Result<()> {
    for dir in paths.required_directories() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Client settings for one control-plane tenant. The bearer token is an
/// opaque value supplied by an external login flow.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub base_url: String,
    pub tenant: String,
    pub token: String,
    /// Websocket endpoint for the job log channel. Defaults to `base_url`
    /// with the scheme rewritten to ws/wss.
    #[serde(default)]
    pub log_stream_url: Option<String>,
    /// Binary name of the external environment-provisioning tool.
    #[serde(default)]
    pub provisioner_binary: Option<String>,
}

impl Settings {
    pub fn websocket_base(&self) -> String {
        match &self.log_stream_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => self
                .base_url
                .trim_end_matches('/')
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1),
        }
    }

    pub fn provisioner_binary(&self) -> &str {
        self.provisioner_binary
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(DEFAULT_PROVISIONER_BINARY)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("base_url", &self.base_url),
            ("tenant", &self.tenant),
            ("token", &self.token),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidField {
                    field: field.to_string(),
                    reason: "must be non-empty".to_string(),
                });
            }
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::InvalidField {
                field: "base_url".to_string(),
                reason: "must start with http:// or https://".to_string(),
            });
        }
        Ok(())
    }
}

pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|err| ConfigError::ReadSettings {
        path: path.display().to_string(),
        source: err,
    })?;
    let settings: Settings =
        serde_yaml::from_str(&raw).map_err(|err| ConfigError::ParseSettings {
            path: path.display().to_string(),
            source: err,
        })?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Settings {
        Settings {
            base_url: "https://cloud.example.com".to_string(),
            tenant: "acme".to_string(),
            token: "tok".to_string(),
            log_stream_url: None,
            provisioner_binary: None,
        }
    }

    #[test]
    fn websocket_base_rewrites_scheme() {
        assert_eq!(sample().websocket_base(), "wss://cloud.example.com");
        let mut http = sample();
        http.base_url = "http://localhost:8000/".to_string();
        assert_eq!(http.websocket_base(), "ws://localhost:8000");
    }

    #[test]
    fn websocket_base_prefers_explicit_url() {
        let mut settings = sample();
        settings.log_stream_url = Some("wss://stream.example.com/".to_string());
        assert_eq!(settings.websocket_base(), "wss://stream.example.com");
    }

    #[test]
    fn load_settings_rejects_missing_tenant() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, "base_url: https://x.example.com\ntenant: \"\"\ntoken: t\n")
            .expect("write");
        let err = load_settings(&path).expect_err("must fail");
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "tenant"));
    }

    #[test]
    fn state_root_env_override_wins() {
        std::env::set_var("JOBDOCK_STATE_ROOT", "/tmp/jobdock-test-root");
        let root = default_state_root_path().expect("root");
        assert_eq!(root, PathBuf::from("/tmp/jobdock-test-root"));
        std::env::remove_var("JOBDOCK_STATE_ROOT");
    }
}
