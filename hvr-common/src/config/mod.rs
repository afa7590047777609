//! Schema-validated tool configuration.

mod schema;
mod value;

pub use schema::{
    CHECK_INTERVAL_SECONDS, Constraint, INSTALL_TIMEOUT_SECONDS, Overrides, ParamSpec,
    STARTUP_TIMEOUT_SECONDS, STOP_TIMEOUT_SECONDS, TIMEOUT_SECONDS, ToolConfig, ToolSchema,
};
pub use value::{ParamType, ParamValue};
