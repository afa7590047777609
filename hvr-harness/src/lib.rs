//! Hardware Validation Runner - harness
//!
//! Drives vendor test tools through a common lifecycle, races them against
//! each other and runs checkpointed step sequences across reboots.

#![forbid(unsafe_code)]

pub mod controller;
pub mod events;
pub mod host;
pub mod ini;
pub mod process;
pub mod race;
pub mod retry;
pub mod runner;
pub mod status;
pub mod tools;

pub use controller::{ControllerSnapshot, RunResult, ToolController};
pub use events::EventBus;
pub use host::{HostControl, HostError, ResumeCommand, SystemHost, terminate_process_immediately};
pub use process::{InstallerSpec, ProcessHandle, ProcessManager, ProcessSpec, UninstallerSpec};
pub use race::{RaceCoordinator, RaceError, Verdict, first_failure, first_outcome};
pub use retry::{RetryPolicy, RetryableError, run_with_retry};
pub use runner::{ResumableRunner, RunSummary, RunnerError, Step, StepError, StepOutcome};
pub use status::StatusSource;
pub use tools::{LaunchPlan, ToolProfile, builtin_profiles, profile_by_name};
