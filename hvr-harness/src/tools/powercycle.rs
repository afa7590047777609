use super::{
    LaunchPlan, ToolProfile, absolute, ensure_dir, remove_stale, str_param, write_input,
};
use crate::process::{InstallerSpec, ProcessSpec, UninstallerSpec};
use crate::status::{SidecarParser, SidecarStatusSource, StatusSource};
use hvr_common::config::Constraint;
use hvr_common::{LaunchError, ParamType, StatusReport, TerminalStatus, ToolConfig, ToolSchema};
use regex::Regex;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

pub const TOOL: &str = "powercycle";

static VERDICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:test|overall)\s+result\s*[:\-]\s*(PASS|FAIL)")
        .expect("invalid verdict pattern")
});
static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:error|failure)\s*[:\-]\s*([^\n<]{5,})").expect("invalid error-line pattern")
});
static COMPLETED_CYCLES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)completed\s+cycles\s*[:\-]\s*(\d+)").expect("invalid cycle pattern")
});
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("invalid tag pattern"));

/// Modern-standby / reboot cycling tool driven by a settings file.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerCycleProfile;

impl PowerCycleProfile {
    pub fn settings(config: &ToolConfig) -> serde_json::Value {
        json!({
            "cycle_count": config.get_int("cycle_count").unwrap_or(10),
            "test_duration_minutes": config.get_int("test_duration_minutes").unwrap_or(60),
            "enable_modern_standby": config.get_bool("enable_modern_standby").unwrap_or(true),
            "dut_id": str_param(config, "dut_id"),
            "log_path": str_param(config, "log_path"),
        })
    }
}

impl ToolProfile for PowerCycleProfile {
    fn name(&self) -> &str {
        TOOL
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(TOOL)
            .param(
                "install_path",
                ParamType::Str,
                r"C:\Program Files\PowerhouseMountain",
                None,
                "install directory",
            )
            .param("executable_name", ParamType::Str, "PowerhouseMountain.exe", None, "primary executable")
            .param("installer_path", ParamType::Str, "", None, "NSIS installer; empty disables install")
            .param("settings_path", ParamType::Str, "./testlog/PHMSettings.json", None, "settings handed to the tool")
            .param("log_path", ParamType::Str, "./testlog/PHMLog", None, "HTML report directory")
            .param(
                "cycle_count",
                ParamType::Int,
                10,
                Some(Constraint::range(0.0, 100_000.0)),
                "power cycles to run",
            )
            .param(
                "test_duration_minutes",
                ParamType::Int,
                60,
                Some(Constraint::range(0.0, 10_080.0)),
                "run length",
            )
            .param("enable_modern_standby", ParamType::Bool, true, None, "use modern standby between cycles")
            .param("dut_id", ParamType::Str, "0", Some(Constraint::pattern("^([0-9]|10)$")), "disk index")
            .with_control_defaults(3600, 5.0)
    }

    fn process_spec(&self, config: &ToolConfig) -> ProcessSpec {
        let mut spec = ProcessSpec::new(
            str_param(config, "install_path"),
            str_param(config, "executable_name"),
        );
        if let Some(installer) = super::opt_path(config, "installer_path") {
            spec = spec.installer(InstallerSpec {
                path: installer,
                args: vec!["/S".into()],
                license: None,
            });
        }
        spec.uninstaller(UninstallerSpec {
            program: PathBuf::from("uninst.exe"),
            args: vec!["/S".into()],
        })
    }

    fn prepare(&self, config: &ToolConfig) -> Result<LaunchPlan, LaunchError> {
        let settings_path = absolute(&str_param(config, "settings_path"))?;
        let log_dir = absolute(&str_param(config, "log_path"))?;
        ensure_dir(&log_dir)?;
        for report in previous_reports(&log_dir)? {
            remove_stale(&report)?;
        }

        let settings = serde_json::to_string_pretty(&Self::settings(config))
            .map_err(|e| LaunchError::Prepare(format!("cannot encode settings: {e}")))?;
        write_input(&settings_path, &settings)?;
        debug!(settings = %settings_path.display(), "Power-cycle settings written");

        Ok(LaunchPlan {
            args: vec!["--settings".into(), settings_path.display().to_string()],
            written: vec![settings_path, log_dir],
        })
    }

    fn status_source(&self, config: &ToolConfig) -> Box<dyn StatusSource> {
        let pattern = format!(
            "{}/*.html",
            glob::Pattern::escape(&str_param(config, "log_path"))
        );
        let grace = config
            .get_duration_secs(hvr_common::config::TIMEOUT_SECONDS)
            .unwrap_or(Duration::from_secs(3600));
        Box::new(
            SidecarStatusSource::new("powercycle-report", pattern, Box::new(ReportVerdictParser))
                .appearance_grace(grace),
        )
    }
}

/// HTML reports already sitting in `log_dir`.
fn previous_reports(log_dir: &Path) -> Result<Vec<PathBuf>, LaunchError> {
    let entries = std::fs::read_dir(log_dir)
        .map_err(|e| LaunchError::Prepare(format!("cannot list {}: {e}", log_dir.display())))?;
    Ok(entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("html"))
        })
        .collect())
}

/// Reads the overall verdict from an HTML report.
///
/// A report without a `Test Result: PASS|FAIL` line is still being written.
/// Distinct `Error: ...` lines are counted as errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportVerdictParser;

impl SidecarParser for ReportVerdictParser {
    fn parse(&self, content: &str) -> Result<TerminalStatus, String> {
        let plain = TAG.replace_all(content, "\n").replace("&nbsp;", " ");

        let Some(verdict) = VERDICT.captures(&plain).and_then(|c| c.get(1)) else {
            return Ok(TerminalStatus::StillRunning);
        };

        let mut errors: Vec<String> = Vec::new();
        for capture in ERROR_LINE.captures_iter(&plain) {
            let message = capture[1].trim().to_string();
            if !message.is_empty() && !errors.contains(&message) {
                errors.push(message);
            }
        }
        let completed = COMPLETED_CYCLES
            .captures(&plain)
            .and_then(|c| c[1].parse::<u64>().ok());

        let mut report = StatusReport::with_errors(u32::try_from(errors.len()).unwrap_or(u32::MAX))
            .payload(json!({ "completed_cycles": completed, "errors": errors }));
        if verdict.as_str().eq_ignore_ascii_case("PASS") {
            return Ok(TerminalStatus::Passed(report));
        }
        if let Some(first) = errors.first() {
            report = report.message(first.clone());
        }
        Ok(TerminalStatus::Failed(report))
    }
}
