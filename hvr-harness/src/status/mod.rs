//! Result observation strategies.
//!
//! A vendor tool reports its verdict either through something that can be
//! read while it runs (a status window, a status command, a status file) or
//! through a result file written next to its logs. Both are hidden behind
//! [`StatusSource`] so the controller never knows which one it is polling.

mod composite;
mod live;
mod sidecar;

pub use composite::CompositeStatusSource;
pub use live::{CommandIndicator, FileIndicator, LiveStatusSource, MarkerClassifier, StatusIndicator};
pub use sidecar::{MarkerFileParser, RunCardParser, SidecarParser, SidecarStatusSource};

use hvr_common::{StatusSourceError, TerminalStatus};

/// One strategy for observing a tool's verdict.
///
/// Polls are synchronous and expected to be cheap; the controller calls
/// them from its monitor task at the configured interval.
pub trait StatusSource: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Observe the tool once.
    fn poll(&mut self) -> Result<TerminalStatus, StatusSourceError>;

    /// Whether the source can be polled yet (e.g. the status window exists).
    fn is_ready(&mut self) -> bool {
        true
    }

    /// Forget any state from a previous run. Called right after launch.
    fn reset(&mut self) {}
}

impl StatusSource for Box<dyn StatusSource> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn poll(&mut self) -> Result<TerminalStatus, StatusSourceError> {
        (**self).poll()
    }

    fn is_ready(&mut self) -> bool {
        (**self).is_ready()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
