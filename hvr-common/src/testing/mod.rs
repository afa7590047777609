//! Test support shared by every crate in the workspace.

mod log;

pub use log::{TestGuard, TestPhase, init_global_test_logging};
