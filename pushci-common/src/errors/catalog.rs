//! Error Catalog for pushci
//!
//! Every failure a job or the daemon can report maps to a stable code
//! (`PCI-E001` through `PCI-E599`) with a message and remediation steps.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                          |
//! |------------|-------------|--------------------------------------|
//! | E001-E099  | Config      | Configuration and setup errors       |
//! | E100-E199  | Event       | Inbound push payload errors          |
//! | E200-E299  | Fetch       | Remote object API and listing errors |
//! | E300-E399  | Workspace   | Materialization errors               |
//! | E400-E499  | Script      | Build and cleanup script outcomes    |
//! | E500-E599  | Report      | Result publication errors            |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all pushci error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML syntax
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Logging could not be initialized
    ConfigLoggingError,

    // =========================================================================
    // Event Errors (E100-E199)
    // =========================================================================
    /// Push payload is not valid JSON or has the wrong shape
    EventMalformed,
    /// Push payload lacks a required field
    EventMissingField,
    /// Pushed reference has no head commit
    EventNoHeadCommit,
    /// Payload names an owner, repository, or commit that is not a plain path segment
    EventUnsafeName,

    // =========================================================================
    // Fetch Errors (E200-E299)
    // =========================================================================
    /// Remote object does not exist
    FetchNotFound,
    /// Network failure talking to the remote API
    FetchTransport,
    /// Remote API answered with an error status
    FetchHttpStatus,
    /// Tree listing could not be parsed
    FetchListingMalformed,
    /// Blob payload could not be parsed
    FetchBlobMalformed,

    // =========================================================================
    // Workspace Errors (E300-E399)
    // =========================================================================
    /// Workspace directory could not be created
    WorkspaceCreateFailed,
    /// A file could not be written into the workspace
    WorkspaceWriteFailed,
    /// Blob content could not be decoded
    WorkspaceDecodeFailed,

    // =========================================================================
    // Script Errors (E400-E499)
    // =========================================================================
    /// Build script exited non-zero
    ScriptFailed,
    /// Build script exceeded its deadline
    ScriptTimeout,
    /// Build script was cancelled
    ScriptCancelled,
    /// Script process could not be started
    ScriptSpawnFailed,
    /// Cleanup script failed or timed out
    AfterScriptFailed,
    /// Job was started more than once
    JobAlreadyRun,

    // =========================================================================
    // Report Errors (E500-E599)
    // =========================================================================
    /// Result could not be published
    ReportPublishFailed,
    /// Result could not be serialized
    ReportSerializeFailed,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            // Config (001-099)
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,
            Self::ConfigLoggingError => 6,

            // Event (100-199)
            Self::EventMalformed => 100,
            Self::EventMissingField => 101,
            Self::EventNoHeadCommit => 102,
            Self::EventUnsafeName => 103,

            // Fetch (200-299)
            Self::FetchNotFound => 200,
            Self::FetchTransport => 201,
            Self::FetchHttpStatus => 202,
            Self::FetchListingMalformed => 203,
            Self::FetchBlobMalformed => 204,

            // Workspace (300-399)
            Self::WorkspaceCreateFailed => 300,
            Self::WorkspaceWriteFailed => 301,
            Self::WorkspaceDecodeFailed => 302,

            // Script (400-499)
            Self::ScriptFailed => 400,
            Self::ScriptTimeout => 401,
            Self::ScriptCancelled => 402,
            Self::ScriptSpawnFailed => 403,
            Self::AfterScriptFailed => 404,
            Self::JobAlreadyRun => 405,

            // Report (500-599)
            Self::ReportPublishFailed => 500,
            Self::ReportSerializeFailed => 501,
        }
    }

    /// Returns the formatted error code string (e.g., "PCI-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("PCI-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Event,
            200..=299 => ErrorCategory::Fetch,
            300..=399 => ErrorCategory::Workspace,
            400..=499 => ErrorCategory::Script,
            _ => ErrorCategory::Report,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file contains invalid TOML syntax",
            Self::ConfigValidationError => "Configuration contains invalid values",
            Self::ConfigEnvError => "Environment variable has an invalid value",
            Self::ConfigLoggingError => "Failed to initialize logging",

            Self::EventMalformed => "Push payload could not be parsed",
            Self::EventMissingField => "Push payload is missing a required field",
            Self::EventNoHeadCommit => "Pushed reference has no head commit",
            Self::EventUnsafeName => "Push payload names cannot be used as workspace paths",

            Self::FetchNotFound => "Remote object not found",
            Self::FetchTransport => "Failed to reach the remote object API",
            Self::FetchHttpStatus => "Remote object API returned an error status",
            Self::FetchListingMalformed => "Tree listing could not be parsed",
            Self::FetchBlobMalformed => "Blob payload could not be parsed",

            Self::WorkspaceCreateFailed => "Failed to create job workspace",
            Self::WorkspaceWriteFailed => "Failed to write file into job workspace",
            Self::WorkspaceDecodeFailed => "Blob content could not be decoded",

            Self::ScriptFailed => "Build script exited with a non-zero status",
            Self::ScriptTimeout => "Build script exceeded its deadline",
            Self::ScriptCancelled => "Build script was cancelled",
            Self::ScriptSpawnFailed => "Failed to start script process",
            Self::AfterScriptFailed => "Cleanup script did not complete successfully",
            Self::JobAlreadyRun => "Job has already been run",

            Self::ReportPublishFailed => "Failed to publish job result",
            Self::ReportSerializeFailed => "Failed to serialize job result",
        }
    }

    /// Returns remediation steps for this error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Check the path passed with --config",
                "Omit --config to fall back to built-in defaults",
            ],
            Self::ConfigReadError => &["Check file permissions on the configuration file"],
            Self::ConfigParseError => &[
                "Validate the file with a TOML linter",
                "Run 'pushcid check-config' to see the effective configuration",
            ],
            Self::ConfigValidationError => &[
                "Keep job.script_timeout_secs within 1..=300",
                "Keep job.after_script_timeout_secs within 1..=60",
            ],
            Self::ConfigEnvError => &["Unset or correct the PUSHCI_* variable named in the error"],
            Self::ConfigLoggingError => &[
                "Check PUSHCI_LOG_LEVEL and PUSHCI_LOG_FILE",
                "Make sure the log file directory is writable",
            ],

            Self::EventMalformed => &[
                "Confirm the webhook delivers 'push' events with content type application/json",
            ],
            Self::EventMissingField => &["Confirm the payload includes repository.name and repository.owner.login"],
            Self::EventNoHeadCommit => &["Branch deletions carry no commit and cannot be built"],
            Self::EventUnsafeName => &[
                "Owner, repository, and commit ids must not be empty, '.', '..', or contain path separators",
            ],

            Self::FetchNotFound => &[
                "Check that the API token can read the repository",
                "Force-pushed commits may no longer be reachable",
            ],
            Self::FetchTransport => &[
                "Check network connectivity to github.api_url",
                "Retry the job; objects fetched so far stay cached",
            ],
            Self::FetchHttpStatus => &[
                "Check the API token and rate limit",
                "Retry the job; objects fetched so far stay cached",
            ],
            Self::FetchListingMalformed | Self::FetchBlobMalformed => {
                &["Check that github.api_url points at a GitHub-compatible API"]
            }

            Self::WorkspaceCreateFailed | Self::WorkspaceWriteFailed => &[
                "Check free space and permissions under general.base_path",
            ],
            Self::WorkspaceDecodeFailed => &["Re-run the job; the remote returned corrupt content"],

            Self::ScriptFailed => &["Inspect the captured script output in the job report"],
            Self::ScriptTimeout => &[
                "Speed up the build or raise job.script_timeout_secs (max 300)",
            ],
            Self::ScriptCancelled => &["The job was cancelled by the operator or shutdown"],
            Self::ScriptSpawnFailed => &["Check that 'sh' is available on PATH"],
            Self::AfterScriptFailed => &[
                "Keep cleanup scripts within job.after_script_timeout_secs",
            ],
            Self::JobAlreadyRun => &["Create a new job for each push event"],

            Self::ReportPublishFailed => &[
                "Check that the API token may create commit statuses",
            ],
            Self::ReportSerializeFailed => &["Report this as a bug"],
        }
    }

    /// Returns all error codes, in code order.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::ConfigLoggingError,
            Self::EventMalformed,
            Self::EventMissingField,
            Self::EventNoHeadCommit,
            Self::EventUnsafeName,
            Self::FetchNotFound,
            Self::FetchTransport,
            Self::FetchHttpStatus,
            Self::FetchListingMalformed,
            Self::FetchBlobMalformed,
            Self::WorkspaceCreateFailed,
            Self::WorkspaceWriteFailed,
            Self::WorkspaceDecodeFailed,
            Self::ScriptFailed,
            Self::ScriptTimeout,
            Self::ScriptCancelled,
            Self::ScriptSpawnFailed,
            Self::AfterScriptFailed,
            Self::JobAlreadyRun,
            Self::ReportPublishFailed,
            Self::ReportSerializeFailed,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration and setup errors (E001-E099)
    Config,
    /// Inbound push payload errors (E100-E199)
    Event,
    /// Remote object API errors (E200-E299)
    Fetch,
    /// Materialization errors (E300-E399)
    Workspace,
    /// Build and cleanup script outcomes (E400-E499)
    Script,
    /// Result publication errors (E500-E599)
    Report,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Event => "Event",
            Self::Fetch => "Fetch",
            Self::Workspace => "Workspace",
            Self::Script => "Script",
            Self::Report => "Report",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "PCI-E001")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}
