//! Durable storage for [`ExecutionState`].
//!
//! Every save goes through a sibling temp file that is flushed and synced
//! before being renamed over the target, so a crash or power loss at any
//! point leaves either the previous record or the new one on disk, never
//! a torn write.

use crate::types::ExecutionState;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from checkpoint persistence.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Deleting while a reboot hand-off is still pending would lose the
    /// resume point.
    #[error("checkpoint {path} is mid-recovery and cannot be deleted")]
    RecoveryInProgress { path: PathBuf },
}

impl CheckpointError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// File-backed checkpoint. The only writer of its file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the persisted state, or a fresh one when the file is missing or
    /// cannot be parsed.
    pub fn load(&self) -> ExecutionState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No checkpoint, starting fresh");
                return ExecutionState::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Checkpoint unreadable, starting fresh");
                return ExecutionState::default();
            }
        };

        match serde_json::from_str::<ExecutionState>(&raw) {
            Ok(state) => {
                debug!(
                    path = %self.path.display(),
                    completed = state.completed_steps.len(),
                    recovering = state.is_recovering,
                    reboots = state.reboot_count,
                    "Loaded checkpoint"
                );
                state
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Checkpoint corrupt, starting fresh");
                ExecutionState::default()
            }
        }
    }

    /// Atomically persist `state`. Durable once this returns `Ok`.
    pub fn save(&self, state: &ExecutionState) -> Result<(), CheckpointError> {
        let mut record = state.clone();
        record.updated_at = Some(chrono::Utc::now());
        let json = serde_json::to_vec_pretty(&record)?;

        if let Some(parent) = self.parent_dir() {
            fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
        }

        let temp_path = self.temp_path();
        {
            let mut file = File::create(&temp_path).map_err(|e| CheckpointError::io(&temp_path, e))?;
            file.write_all(&json)
                .and_then(|()| file.flush())
                .and_then(|()| file.sync_all())
                .map_err(|e| CheckpointError::io(&temp_path, e))?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(CheckpointError::io(&self.path, e));
        }
        self.sync_parent()?;

        debug!(
            path = %self.path.display(),
            completed = record.completed_steps.len(),
            recovering = record.is_recovering,
            current = ?record.current_step,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Remove the checkpoint. A missing file is success.
    pub fn delete(&self) -> Result<(), CheckpointError> {
        if !self.exists() {
            return Ok(());
        }
        if self.load().is_recovering {
            return Err(CheckpointError::RecoveryInProgress {
                path: self.path.clone(),
            });
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CheckpointError::io(&self.path, e)),
        }
        self.sync_parent()?;
        info!(path = %self.path.display(), "Checkpoint deleted");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn parent_dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    /// Persist the directory entry after a rename or unlink.
    #[cfg(unix)]
    fn sync_parent(&self) -> Result<(), CheckpointError> {
        let dir = self.parent_dir().unwrap_or_else(|| Path::new("."));
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| CheckpointError::io(dir, e))
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path().join("state").join("checkpoint.json"))
    }

    #[test]
    fn missing_file_loads_fresh_state() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(!s.exists());
        assert_eq!(s.load(), ExecutionState::default());
    }

    #[test]
    fn corrupt_file_loads_fresh_state() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        fs::create_dir_all(s.path().parent().unwrap()).unwrap();
        fs::write(s.path(), b"{\"completed_steps\": [\"s1\"").unwrap();
        assert_eq!(s.load(), ExecutionState::default());
    }

    #[test]
    fn save_then_load_returns_same_state() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let mut state = ExecutionState::default();
        state.mark_completed("s1");
        state.is_recovering = true;
        state.current_step = Some("s2".into());
        state.reboot_count = 3;
        s.save(&state).unwrap();

        let loaded = s.load();
        assert_eq!(loaded.completed_steps, state.completed_steps);
        assert!(loaded.is_recovering);
        assert_eq!(loaded.current_step.as_deref(), Some("s2"));
        assert_eq!(loaded.reboot_count, 3);
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save(&ExecutionState::default()).unwrap();
        let entries: Vec<_> = fs::read_dir(s.path().parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("checkpoint.json")]);
    }

    #[test]
    fn stale_temp_file_does_not_affect_load() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let mut state = ExecutionState::default();
        state.mark_completed("s1");
        s.save(&state).unwrap();
        // Simulates a crash mid-write of a later save.
        fs::write(s.temp_path(), b"{\"completed_st").unwrap();
        assert!(s.load().is_completed("s1"));
    }

    #[test]
    fn delete_is_noop_when_missing() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).delete().is_ok());
    }

    #[test]
    fn delete_refused_while_recovering() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let state = ExecutionState {
            is_recovering: true,
            ..ExecutionState::default()
        };
        s.save(&state).unwrap();
        assert!(matches!(
            s.delete(),
            Err(CheckpointError::RecoveryInProgress { .. })
        ));
        assert!(s.exists());

        s.save(&ExecutionState::default()).unwrap();
        s.delete().unwrap();
        assert!(!s.exists());
    }

    proptest! {
        #[test]
        fn any_saved_state_loads_back(
            steps in proptest::collection::btree_set("[a-z0-9_]{1,12}", 0..8),
            recovering in any::<bool>(),
            reboots in 0u32..1000,
        ) {
            let dir = TempDir::new().unwrap();
            let s = store(&dir);
            let state = ExecutionState {
                completed_steps: steps,
                is_recovering: recovering,
                reboot_count: reboots,
                ..ExecutionState::default()
            };
            s.save(&state).unwrap();
            let loaded = s.load();
            prop_assert_eq!(loaded.completed_steps, state.completed_steps);
            prop_assert_eq!(loaded.is_recovering, recovering);
            prop_assert_eq!(loaded.reboot_count, reboots);
        }
    }
}
