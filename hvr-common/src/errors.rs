//! Error taxonomy shared by every harness component.
//!
//! | Error               | Class          | Retried by caller? |
//! |---------------------|----------------|--------------------|
//! | `ConfigError`       | configuration  | never              |
//! | `InstallError`      | infrastructure | at caller's choice |
//! | `LaunchError`       | infrastructure | at caller's choice |
//! | `StatusSourceError` | infrastructure | at caller's choice |
//! | `Timeout`           | terminal       | never              |
//! | `TestFailed`        | terminal       | never              |

use std::path::PathBuf;
use thiserror::Error;

// ── Configuration ────────────────────────────────────────────────────────

/// One offending key found while validating a tool configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigIssue {
    /// Key is not part of the tool's schema.
    #[error("unknown parameter '{key}'")]
    UnknownKey { key: String },

    /// Value has the wrong type.
    #[error("{key}: expected {expected}, got {got}")]
    TypeMismatch {
        key: String,
        expected: String,
        got: String,
    },

    /// Numeric value outside the declared range.
    #[error("{key}: value {value} out of range (valid: {min}..={max})")]
    OutOfRange {
        key: String,
        value: String,
        min: String,
        max: String,
    },

    /// String value does not match the declared pattern.
    #[error("{key}: '{value}' does not match pattern {pattern}")]
    PatternMismatch {
        key: String,
        value: String,
        pattern: String,
    },

    /// Override could not be parsed (e.g. a malformed `key=value` pair).
    #[error("malformed override '{raw}': {reason}")]
    Malformed { raw: String, reason: String },
}

impl ConfigIssue {
    /// The parameter name this issue refers to, when there is one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::UnknownKey { key }
            | Self::TypeMismatch { key, .. }
            | Self::OutOfRange { key, .. }
            | Self::PatternMismatch { key, .. } => Some(key),
            Self::Malformed { .. } => None,
        }
    }
}

/// Configuration was rejected before any process was touched.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid configuration for {tool}: {}", summarize(.issues))]
pub struct ConfigError {
    pub tool: String,
    pub issues: Vec<ConfigIssue>,
}

impl ConfigError {
    pub fn new(tool: impl Into<String>, issues: Vec<ConfigIssue>) -> Self {
        Self {
            tool: tool.into(),
            issues,
        }
    }

    /// Every parameter name reported by this error.
    pub fn keys(&self) -> Vec<&str> {
        self.issues.iter().filter_map(ConfigIssue::key).collect()
    }

    /// Whether `key` is among the offending parameters.
    pub fn mentions(&self, key: &str) -> bool {
        self.keys().contains(&key)
    }
}

fn summarize(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ── Installation ─────────────────────────────────────────────────────────

/// Install or uninstall failed.
///
/// `TimedOut` (time budget exceeded) and `ToolReported` (installer exited
/// non-zero) are deliberately distinct.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    #[error("installer not found: {0}")]
    InstallerNotFound(PathBuf),

    #[error("{operation} timed out after {after_secs}s")]
    TimedOut { operation: String, after_secs: u64 },

    #[error("{operation} failed: tool exited with code {code:?}")]
    ToolReported {
        operation: String,
        code: Option<i32>,
    },

    #[error("installation finished but no executable found in {install_dir}")]
    Verification { install_dir: PathBuf },

    #[error("licence file not found: {0}")]
    LicenseNotFound(PathBuf),

    #[error("{operation} I/O error: {message}")]
    Io { operation: String, message: String },
}

// ── Launch ───────────────────────────────────────────────────────────────

/// The tool process would not start or died immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("tool not installed: none of {candidates:?} found in {install_dir}")]
    NotInstalled {
        install_dir: PathBuf,
        candidates: Vec<String>,
    },

    #[error("failed to spawn {program}: {message}")]
    Spawn { program: PathBuf, message: String },

    #[error("{program} exited within {grace_ms}ms of launch (code {code:?})")]
    ExitedImmediately {
        program: PathBuf,
        code: Option<i32>,
        grace_ms: u64,
    },

    #[error("failed to prepare tool inputs: {0}")]
    Prepare(String),
}

// ── Status source ────────────────────────────────────────────────────────

/// The tool's result signal could not be observed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusSourceError {
    #[error("status indicator unreadable for {attempts} consecutive polls")]
    Unreadable { attempts: u32 },

    #[error("result file matching '{pattern}' not created within {grace_secs}s")]
    SidecarMissing { pattern: String, grace_secs: u64 },

    #[error("result file {path} unreadable for {attempts} consecutive polls: {last_error}")]
    SidecarUnreadable {
        path: PathBuf,
        attempts: u32,
        last_error: String,
    },

    #[error("status source not ready after {waited_secs}s")]
    NeverReady { waited_secs: u64 },

    #[error("all status sources failed: {0}")]
    Exhausted(String),
}

// ── Umbrella ─────────────────────────────────────────────────────────────

/// Any harness failure, classified for retry policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    StatusSource(#[from] StatusSourceError),

    /// Generic infrastructure failure carried through a `ControllerOutcome`.
    #[error("{controller}: infrastructure error: {reason}")]
    Infrastructure { controller: String, reason: String },

    #[error("{controller}: exceeded time budget of {budget_secs}s")]
    Timeout { controller: String, budget_secs: u64 },

    #[error("{controller}: test failed with {error_count} errors: {reason}")]
    TestFailed {
        controller: String,
        error_count: u32,
        reason: String,
    },

    #[error("{controller}: cancelled")]
    Cancelled { controller: String },
}

impl HarnessError {
    /// Failure getting the tool installed, running or observable.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Install(_) | Self::Launch(_) | Self::StatusSource(_) | Self::Infrastructure { .. }
        )
    }

    /// Whether a caller may re-run the whole controller after this error.
    pub fn is_retryable(&self) -> bool {
        self.is_infrastructure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_reports_every_key() {
        let err = ConfigError::new(
            "powercycle",
            vec![
                ConfigIssue::OutOfRange {
                    key: "cycle_count".into(),
                    value: "-1".into(),
                    min: "0".into(),
                    max: "100000".into(),
                },
                ConfigIssue::UnknownKey {
                    key: "colour".into(),
                },
            ],
        );
        assert!(err.mentions("cycle_count"));
        assert!(err.mentions("colour"));
        let msg = err.to_string();
        assert!(msg.contains("powercycle"));
        assert!(msg.contains("cycle_count"));
    }

    #[test]
    fn malformed_issue_has_no_key() {
        let issue = ConfigIssue::Malformed {
            raw: "novalue".into(),
            reason: "missing '='".into(),
        };
        assert_eq!(issue.key(), None);
    }

    #[test]
    fn retry_classification() {
        let infra = HarnessError::from(LaunchError::ExitedImmediately {
            program: "bit.exe".into(),
            code: Some(1),
            grace_ms: 2000,
        });
        assert!(infra.is_infrastructure());
        assert!(infra.is_retryable());

        let config = HarnessError::from(ConfigError::new("burnin", vec![]));
        assert!(!config.is_retryable());

        let timeout = HarnessError::Timeout {
            controller: "burnin".into(),
            budget_secs: 60,
        };
        assert!(!timeout.is_retryable());

        let failed = HarnessError::TestFailed {
            controller: "burnin".into(),
            error_count: 3,
            reason: "Tests Failed".into(),
        };
        assert!(!failed.is_retryable());
        assert!(!failed.is_infrastructure());
    }

    #[test]
    fn install_timeout_and_tool_failure_are_distinct() {
        let timed_out = InstallError::TimedOut {
            operation: "install".into(),
            after_secs: 300,
        };
        let reported = InstallError::ToolReported {
            operation: "install".into(),
            code: Some(5),
        };
        assert_ne!(timed_out, reported);
        assert!(timed_out.to_string().contains("timed out"));
        assert!(reported.to_string().contains("code Some(5)"));
    }
}
