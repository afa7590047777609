//! Shared data types for checkpoints, controller outcomes and races.

use crate::errors::HarnessError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Current on-disk checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

// ── Execution state ──────────────────────────────────────────────────────

/// Persisted progress of a resumable step sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub completed_steps: BTreeSet<String>,
    /// True only between "reboot requested" and the first step executed
    /// after relaunch.
    #[serde(default)]
    pub is_recovering: bool,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub reboot_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            completed_steps: BTreeSet::new(),
            is_recovering: false,
            current_step: None,
            reboot_count: 0,
            updated_at: None,
        }
    }
}

impl ExecutionState {
    pub fn is_completed(&self, step_id: &str) -> bool {
        self.completed_steps.contains(step_id)
    }

    /// Whether every id in `sequence` has completed.
    pub fn covers<'a>(&self, sequence: impl IntoIterator<Item = &'a str>) -> bool {
        sequence.into_iter().all(|id| self.is_completed(id))
    }

    pub fn mark_completed(&mut self, step_id: &str) {
        self.completed_steps.insert(step_id.to_string());
    }
}

// ── Status source results ────────────────────────────────────────────────

/// What a status source observed about a finished (or failing) tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl StatusReport {
    pub fn with_errors(error_count: u32) -> Self {
        Self {
            error_count,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// One poll of a status source.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalStatus {
    StillRunning,
    Passed(StatusReport),
    Failed(StatusReport),
}

impl TerminalStatus {
    pub fn is_decisive(&self) -> bool {
        !matches!(self, Self::StillRunning)
    }
}

// ── Controller outcomes ──────────────────────────────────────────────────

/// Terminal classification of a controller run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum OutcomeKind {
    Passed,
    Failed(String),
    TimedOut,
    InfrastructureError(String),
}

impl OutcomeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed(_) => "failed",
            Self::TimedOut => "timed_out",
            Self::InfrastructureError(_) => "infrastructure_error",
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::TimedOut => write!(f, "timed out"),
            Self::InfrastructureError(reason) => write!(f, "infrastructure error: {reason}"),
        }
    }
}

/// Result of one completed controller run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerOutcome {
    pub controller_id: String,
    pub kind: OutcomeKind,
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl ControllerOutcome {
    pub fn new(controller_id: impl Into<String>, kind: OutcomeKind, elapsed: Duration) -> Self {
        Self {
            controller_id: controller_id.into(),
            kind,
            error_count: 0,
            payload: None,
            elapsed,
        }
    }

    /// Build an outcome from a decisive status report.
    ///
    /// A `Passed` report that still carries errors counts as a failure.
    pub fn from_status(
        controller_id: impl Into<String>,
        status: TerminalStatus,
        elapsed: Duration,
    ) -> Option<Self> {
        let (kind, report) = match status {
            TerminalStatus::StillRunning => return None,
            TerminalStatus::Passed(report) if report.error_count > 0 => (
                OutcomeKind::Failed(format!(
                    "tool reported pass with {} errors",
                    report.error_count
                )),
                report,
            ),
            TerminalStatus::Passed(report) => (OutcomeKind::Passed, report),
            TerminalStatus::Failed(report) => (
                OutcomeKind::Failed(
                    report
                        .message
                        .clone()
                        .unwrap_or_else(|| "tool reported failure".to_string()),
                ),
                report,
            ),
        };
        Some(Self {
            controller_id: controller_id.into(),
            kind,
            error_count: report.error_count,
            payload: report.payload,
            elapsed,
        })
    }

    pub fn is_passed(&self) -> bool {
        self.kind == OutcomeKind::Passed
    }

    /// Convert to a `Result`, mapping every non-pass to its error class.
    pub fn into_result(self, budget: Option<Duration>) -> Result<Self, HarnessError> {
        match &self.kind {
            OutcomeKind::Passed => Ok(self),
            OutcomeKind::Failed(reason) => Err(HarnessError::TestFailed {
                controller: self.controller_id.clone(),
                error_count: self.error_count,
                reason: reason.clone(),
            }),
            OutcomeKind::TimedOut => Err(HarnessError::Timeout {
                controller: self.controller_id.clone(),
                budget_secs: budget.unwrap_or(self.elapsed).as_secs(),
            }),
            OutcomeKind::InfrastructureError(reason) => Err(HarnessError::Infrastructure {
                controller: self.controller_id.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ── Controller state ─────────────────────────────────────────────────────

/// Lifecycle state of a tool controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    NotInstalled,
    Installed,
    Configured,
    Launched,
    Monitoring,
    Passed,
    Failed,
    TimedOut,
    InfrastructureError,
    Terminated,
}

impl ControllerState {
    pub fn for_outcome(kind: &OutcomeKind) -> Self {
        match kind {
            OutcomeKind::Passed => Self::Passed,
            OutcomeKind::Failed(_) => Self::Failed,
            OutcomeKind::TimedOut => Self::TimedOut,
            OutcomeKind::InfrastructureError(_) => Self::InfrastructureError,
        }
    }

    /// Launched or Monitoring.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Launched | Self::Monitoring)
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::NotInstalled => "not_installed",
            Self::Installed => "installed",
            Self::Configured => "configured",
            Self::Launched => "launched",
            Self::Monitoring => "monitoring",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::InfrastructureError => "infrastructure_error",
            Self::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// Tri-state result as seen by callers polling a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStatus {
    Running,
    Passed,
    Failed,
}

// ── Race ─────────────────────────────────────────────────────────────────

/// Result of racing controllers against each other.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceResult {
    /// `None` when the overall race timeout fired first.
    pub winner_id: Option<String>,
    pub outcome: ControllerOutcome,
    /// Every non-winning controller was stopped and joined.
    pub loser_stopped: bool,
}

/// Result of running controllers until every one of them has reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllCompletedResult {
    /// Outcomes in the order they arrived.
    pub outcomes: Vec<ControllerOutcome>,
    /// Controllers still without an outcome when the overall timeout fired.
    pub unfinished: Vec<String>,
    /// Every controller was stopped and joined.
    pub all_stopped: bool,
}

impl AllCompletedResult {
    pub fn timed_out(&self) -> bool {
        !self.unfinished.is_empty()
    }

    /// Every controller reported and every report is a pass.
    pub fn all_passed(&self) -> bool {
        !self.timed_out()
            && !self.outcomes.is_empty()
            && self.outcomes.iter().all(ControllerOutcome::is_passed)
    }
}
