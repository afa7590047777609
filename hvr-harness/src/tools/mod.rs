//! Per-tool knowledge: parameter schema, input files, launch arguments and
//! where the verdict comes from.
//!
//! Everything tool-specific lives behind [`ToolProfile`]; the controller
//! drives every profile through the same lifecycle.

mod burnin;
mod cdi;
mod powercycle;
mod smartcheck;

pub use burnin::BurnInProfile;
pub use cdi::{
    CdiProfile, Disk, DiskInfoError, DiskInfoReport, DiskReportParser, SmartAttribute,
    compare_increase, compare_no_increase, expect_smart_value,
};
pub use powercycle::{PowerCycleProfile, ReportVerdictParser};
pub use smartcheck::SmartCheckProfile;

use crate::process::ProcessSpec;
use crate::status::StatusSource;
use hvr_common::{LaunchError, ToolConfig, ToolSchema};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to launch once a tool's inputs are written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchPlan {
    pub args: Vec<String>,
    /// Files written (or directories reset) while preparing.
    pub written: Vec<PathBuf>,
}

pub trait ToolProfile: Send + Sync {
    /// Stable tool name, also the schema name.
    fn name(&self) -> &str;

    fn schema(&self) -> ToolSchema;

    /// Where the tool is installed and how to (un)install it.
    fn process_spec(&self, config: &ToolConfig) -> ProcessSpec;

    /// Write the tool's input files for `config` and return its arguments.
    fn prepare(&self, config: &ToolConfig) -> Result<LaunchPlan, LaunchError>;

    /// Fresh status source for one run under `config`.
    fn status_source(&self, config: &ToolConfig) -> Box<dyn StatusSource>;
}

/// Every built-in profile.
pub fn builtin_profiles() -> Vec<Arc<dyn ToolProfile>> {
    vec![
        Arc::new(BurnInProfile),
        Arc::new(SmartCheckProfile),
        Arc::new(PowerCycleProfile),
        Arc::new(CdiProfile),
    ]
}

pub fn profile_by_name(name: &str) -> Option<Arc<dyn ToolProfile>> {
    builtin_profiles().into_iter().find(|p| p.name() == name)
}

// ── Helpers shared by profiles ───────────────────────────────────────────

pub(crate) fn str_param(config: &ToolConfig, key: &str) -> String {
    config.get_str(key).unwrap_or_default().to_string()
}

/// Absolute form of `path` without touching the filesystem.
pub(crate) fn absolute(path: &str) -> Result<PathBuf, LaunchError> {
    std::path::absolute(path)
        .map_err(|e| LaunchError::Prepare(format!("cannot resolve path '{path}': {e}")))
}

pub(crate) fn write_input(path: &Path, content: &str) -> Result<(), LaunchError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            LaunchError::Prepare(format!("cannot create {}: {e}", parent.display()))
        })?;
    }
    std::fs::write(path, content)
        .map_err(|e| LaunchError::Prepare(format!("cannot write {}: {e}", path.display())))
}

pub(crate) fn ensure_dir(path: &Path) -> Result<(), LaunchError> {
    std::fs::create_dir_all(path)
        .map_err(|e| LaunchError::Prepare(format!("cannot create {}: {e}", path.display())))
}

/// Optional path parameter; empty string means unset.
pub(crate) fn opt_path(config: &ToolConfig, key: &str) -> Option<PathBuf> {
    config
        .get_str(key)
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

/// Delete a result file an earlier run left behind. Missing is fine.
pub(crate) fn remove_stale(path: &Path) -> Result<(), LaunchError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed previous result");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LaunchError::Prepare(format!(
            "cannot remove {}: {e}",
            path.display()
        ))),
    }
}

/// Refuse paths whose contents must never be wiped.
fn is_dangerous(dir: &Path) -> bool {
    let text = dir.to_string_lossy();
    let trimmed = text.trim_end_matches(['/', '\\']);
    if trimmed.len() <= 3 || dir.parent().is_none() {
        return true;
    }
    let lowered = trimmed.to_ascii_lowercase();
    if ["c:\\windows", "c:\\program files", "c:\\program files (x86)"].contains(&lowered.as_str())
    {
        return true;
    }
    dirs::home_dir().is_some_and(|home| home == dir)
}

/// Delete everything inside `dir`, keeping the directory itself.
pub(crate) fn clear_dir_contents(dir: &Path) -> Result<(), LaunchError> {
    if is_dangerous(dir) {
        return Err(LaunchError::Prepare(format!(
            "refusing to clear {}",
            dir.display()
        )));
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(LaunchError::Prepare(format!(
                "cannot list {}: {e}",
                dir.display()
            )));
        }
    };

    let mut removed = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        let result = match entry.file_type() {
            Ok(ft) if ft.is_dir() => std::fs::remove_dir_all(&path),
            _ => std::fs::remove_file(&path),
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete"),
        }
    }
    info!(dir = %dir.display(), removed, "Output directory cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvr_common::Overrides;

    #[test]
    fn builtin_profiles_have_valid_defaults() {
        for profile in builtin_profiles() {
            let schema = profile.schema();
            assert_eq!(schema.tool(), profile.name());
            schema
                .validate(&Overrides::new())
                .unwrap_or_else(|e| panic!("{} defaults invalid: {e}", profile.name()));
        }
    }

    #[test]
    fn lookup_by_name() {
        assert!(profile_by_name("burnin").is_some());
        assert!(profile_by_name("smartcheck").is_some());
        assert!(profile_by_name("powercycle").is_some());
        assert!(profile_by_name("cdi").is_some());
        assert!(profile_by_name("prime95").is_none());
    }

    #[test]
    fn write_input_creates_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("in.txt");
        write_input(&path, "x").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "x");
    }
}
