//! Configuration system for pushci.
//!
//! Configuration is read from a TOML file (every field has a default), then
//! `PUSHCI_*` environment variables are layered on top, then the result is
//! validated.

pub mod env;

pub use env::{EnvError, EnvParser};

use crate::errors::ErrorCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Upper bound on the build script deadline.
pub const MAX_SCRIPT_TIMEOUT_SECS: u64 = 300;
/// Upper bound on the cleanup script deadline.
pub const MAX_AFTER_SCRIPT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment overrides: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ConfigNotFound,
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::Env(_) => ErrorCode::ConfigEnvError,
            Self::Validation(_) => ErrorCode::ConfigValidationError,
        }
    }
}

/// pushci configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CiConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub job: JobConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format for stderr (pretty, compact, json).
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Directory under which job workspaces are materialized.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            base_path: default_base_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Base URL of the REST API.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// API token. Prefer `PUSHCI_GITHUB_TOKEN` over writing it to disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-request timeout for object fetches.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Post a commit status when a job finishes.
    #[serde(default)]
    pub publish_status: bool,
    /// Context label shown next to the commit status.
    #[serde(default = "default_status_context")]
    pub status_context: String,
    /// Link attached to posted commit statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_target_url: Option<String>,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: None,
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
            publish_status: false,
            status_context: default_status_context(),
            status_target_url: None,
        }
    }
}

impl GithubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Build command, run through `sh -c` inside the workspace.
    #[serde(default = "default_script")]
    pub script: String,
    /// Cleanup command. Empty disables the cleanup phase.
    #[serde(default = "default_after_script")]
    pub after_script: String,
    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,
    #[serde(default = "default_after_script_timeout")]
    pub after_script_timeout_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            script: default_script(),
            after_script: default_after_script(),
            script_timeout_secs: default_script_timeout(),
            after_script_timeout_secs: default_after_script_timeout(),
        }
    }
}

impl JobConfig {
    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn after_script_timeout(&self) -> Duration {
        Duration::from_secs(self.after_script_timeout_secs)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_base_path() -> PathBuf {
    std::env::temp_dir().join("pushci")
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
    concat!("pushci/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_status_context() -> String {
    "ci/pushci".to_string()
}

fn default_script() -> String {
    "sh ci/script.sh".to_string()
}

fn default_after_script() -> String {
    "sh ci/after_script.sh".to_string()
}

fn default_script_timeout() -> u64 {
    MAX_SCRIPT_TIMEOUT_SECS
}

fn default_after_script_timeout() -> u64 {
    1
}

impl CiConfig {
    /// Default location: `<config dir>/pushci/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pushci").join("config.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used when present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No configuration file found, using defaults");
                    Self::default()
                }
            },
        };

        let config = config.with_env_overrides(&mut EnvParser::new())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply `PUSHCI_*` overrides. All invalid variables are reported together.
    pub fn with_env_overrides(mut self, parser: &mut EnvParser) -> Result<Self, ConfigError> {
        self.general.log_level = parser.get_log_level("LOG_LEVEL", &self.general.log_level);
        self.general.log_format = parser.get_string("LOG_FORMAT", &self.general.log_format);
        self.general.base_path = parser.get_path("BASE_PATH", self.general.base_path.clone());

        self.github.api_url = parser.get_string("GITHUB_API_URL", &self.github.api_url);
        if let Some(token) = parser.get_optional_string("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        self.github.publish_status =
            parser.get_bool("PUBLISH_STATUS", self.github.publish_status);

        self.job.script_timeout_secs = parser.get_u64_range(
            "SCRIPT_TIMEOUT_SECS",
            self.job.script_timeout_secs,
            1,
            MAX_SCRIPT_TIMEOUT_SECS,
        );
        self.job.after_script_timeout_secs = parser.get_u64_range(
            "AFTER_SCRIPT_TIMEOUT_SECS",
            self.job.after_script_timeout_secs,
            1,
            MAX_AFTER_SCRIPT_TIMEOUT_SECS,
        );

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job.script.trim().is_empty() {
            return Err(ConfigError::Validation("job.script must not be empty".into()));
        }
        if self.job.script_timeout_secs == 0
            || self.job.script_timeout_secs > MAX_SCRIPT_TIMEOUT_SECS
        {
            return Err(ConfigError::Validation(format!(
                "job.script_timeout_secs must be in 1..={MAX_SCRIPT_TIMEOUT_SECS}, got {}",
                self.job.script_timeout_secs
            )));
        }
        if self.job.after_script_timeout_secs == 0
            || self.job.after_script_timeout_secs > MAX_AFTER_SCRIPT_TIMEOUT_SECS
        {
            return Err(ConfigError::Validation(format!(
                "job.after_script_timeout_secs must be in 1..={MAX_AFTER_SCRIPT_TIMEOUT_SECS}, got {}",
                self.job.after_script_timeout_secs
            )));
        }
        if crate::logging::LogFormat::parse(&self.general.log_format).is_none() {
            return Err(ConfigError::Validation(format!(
                "general.log_format must be 'pretty', 'compact' or 'json', got '{}'",
                self.general.log_format
            )));
        }
        if self.github.api_url.trim().is_empty() {
            return Err(ConfigError::Validation("github.api_url must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
