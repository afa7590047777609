//! Hardware Validation Runner - shared library
//!
//! Types, configuration schema, checkpoint storage and logging setup used
//! by the harness and the CLI.

#![deny(unsafe_code)]

pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod logging;
pub mod testing;
pub mod types;

pub use checkpoint::{CheckpointError, CheckpointStore};
pub use config::{Overrides, ParamType, ParamValue, ToolConfig, ToolSchema};
pub use errors::{
    ConfigError, ConfigIssue, HarnessError, InstallError, LaunchError, StatusSourceError,
};
pub use logging::{LogConfig, LogFormat, init_logging};
pub use types::{
    AllCompletedResult, ControllerOutcome, ControllerState, ControllerStatus, ExecutionState,
    OutcomeKind, RaceResult, StatusReport, TerminalStatus,
};
