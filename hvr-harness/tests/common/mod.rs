#![allow(dead_code)]

use hvr_common::{Overrides, ParamValue, ToolConfig};
use hvr_harness::host::{HostControl, HostError, ResumeCommand};
use hvr_harness::tools::{SmartCheckProfile, ToolProfile};
use hvr_harness::{ProcessManager, ToolController};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[ctor::ctor]
fn setup() {
    hvr_common::testing::init_global_test_logging();
}

pub const PASSING_RUNCARD: &str = "[Test Status]\ncycle = 3\nloop = 1\ntest_result = PASSED\nerr_msg = Pass\n";
pub const FAILING_RUNCARD: &str =
    "[Test Status]\ncycle = 1\nloop = 1\ntest_result = FAILED\nerr_msg = SMART attribute 05 exceeded\n";

/// A fake SMART watchdog: a shell script installed as `SmartCheck.bat`
/// plus the directories the profile points at.
pub struct FakeTool {
    pub dir: TempDir,
}

impl FakeTool {
    /// `body` runs under `/bin/sh` with `$OUT` set to the output directory.
    pub fn new(body: &str) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let install = dir.path().join("tool");
        std::fs::create_dir_all(&install).expect("install dir");
        let script = install.join("SmartCheck.bat");
        let out = dir.path().join("out");
        std::fs::write(
            &script,
            format!("#!/bin/sh\nOUT='{}'\n{body}\n", out.display()),
        )
        .expect("write script");
        make_executable(&script);
        Self { dir }
    }

    /// Writes `runcard` after `delay_secs`, then keeps running.
    pub fn reporting(runcard: &str, delay_secs: f64) -> Self {
        Self::new(&format!(
            "sleep {delay_secs}\nmkdir -p \"$OUT/run1\"\nprintf '%s' '{runcard}' > \"$OUT/run1/RunCard.ini\"\nsleep 60"
        ))
    }

    /// Never writes a result.
    pub fn hanging() -> Self {
        Self::new("sleep 600")
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    /// Fast-polling configuration for this tool plus `extra` overrides.
    pub fn config(&self, extra: &[(&str, ParamValue)]) -> ToolConfig {
        let mut overrides: Overrides = [
            ("install_path", ParamValue::from(self.path().join("tool").display().to_string())),
            (
                "ini_path",
                ParamValue::from(self.path().join("tool").join("SmartCheck.ini").display().to_string()),
            ),
            ("output_dir", ParamValue::from(self.output_dir().display().to_string())),
            ("check_interval_seconds", ParamValue::from(0.05)),
            ("startup_timeout_seconds", ParamValue::from(2.0)),
            ("stop_timeout_seconds", ParamValue::from(1.0)),
            ("timeout_seconds", ParamValue::from(20)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        overrides.extend(extra.iter().map(|(k, v)| (k.to_string(), v.clone())));
        SmartCheckProfile
            .schema()
            .validate(&overrides)
            .expect("valid config")
    }

    /// Configured controller with a short launch grace.
    pub fn controller(&self, id: &str, extra: &[(&str, ParamValue)]) -> ToolController {
        let config = self.config(extra);
        let profile: Arc<dyn ToolProfile> = Arc::new(SmartCheckProfile);
        let spec = profile
            .process_spec(&config)
            .launch_grace(Duration::from_millis(100));
        let mut controller = ToolController::new(id, profile, ProcessManager::new(spec));
        controller.configure(config).expect("configure");
        controller
    }
}

fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod");
}

/// Host that records calls and panics instead of exiting.
#[derive(Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

impl HostControl for RecordingHost {
    fn register_resume(&self, _command: &ResumeCommand) -> Result<(), HostError> {
        self.record("register_resume");
        Ok(())
    }

    fn deregister_resume(&self) -> Result<(), HostError> {
        self.record("deregister_resume");
        Ok(())
    }

    fn schedule_reboot(&self, _delay: Duration) -> Result<(), HostError> {
        self.record("schedule_reboot");
        Ok(())
    }

    fn terminate_immediately(&self) -> ! {
        self.record("terminate_immediately");
        panic!("process terminated for reboot");
    }
}

/// Event names received so far.
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<String>) -> Vec<String> {
    let mut names = Vec::new();
    while let Ok(line) = rx.try_recv() {
        let value: serde_json::Value = serde_json::from_str(&line).expect("event json");
        names.push(value["event"].as_str().unwrap_or_default().to_string());
    }
    names
}
