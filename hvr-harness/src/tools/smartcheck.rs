use super::{
    LaunchPlan, ToolProfile, absolute, clear_dir_contents, ensure_dir, str_param, write_input,
};
use crate::ini::Ini;
use crate::process::ProcessSpec;
use crate::status::{RunCardParser, SidecarStatusSource, StatusSource};
use hvr_common::config::Constraint;
use hvr_common::{LaunchError, ParamType, ToolConfig, ToolSchema};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const TOOL: &str = "smartcheck";

const GLOBAL_SECTION: &str = "global";
/// Log directory the watchdog falls back to next to its batch file.
const DEFAULT_LOG_DIR: &str = "log_SmartCheck";

/// SMART attribute watchdog driven through its `[global]` INI section.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmartCheckProfile;

impl SmartCheckProfile {
    /// Rewrite the `[global]` section of the watchdog INI, keeping every
    /// other section as found.
    pub fn write_ini(config: &ToolConfig, ini_path: &Path) -> Result<(), LaunchError> {
        let mut ini = match std::fs::read_to_string(ini_path) {
            Ok(text) => Ini::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ini::default(),
            Err(e) => {
                return Err(LaunchError::Prepare(format!(
                    "cannot read {}: {e}",
                    ini_path.display()
                )));
            }
        };

        let output_dir = absolute(&str_param(config, "output_dir"))?;
        ini.set(GLOBAL_SECTION, "output_dir", output_dir.display().to_string());
        for key in ["total_cycle", "total_time"] {
            ini.set(
                GLOBAL_SECTION,
                key,
                config.get_int(key).unwrap_or_default().to_string(),
            );
        }
        ini.set(GLOBAL_SECTION, "dut_id", str_param(config, "dut_id"));
        for key in [
            "enable_monitor_smart",
            "close_window_when_failed",
            "stop_when_failed",
        ] {
            let value = config.get_bool(key).unwrap_or_default();
            ini.set(GLOBAL_SECTION, key, value.to_string());
        }
        ini.set(
            GLOBAL_SECTION,
            "smart_config_file",
            str_param(config, "smart_config_file"),
        );

        write_input(ini_path, &ini.render())
    }
}

impl ToolProfile for SmartCheckProfile {
    fn name(&self) -> &str {
        TOOL
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(TOOL)
            .param("install_path", ParamType::Str, "./bin/SmiWinTools", None, "directory holding the batch file")
            .param("executable_name", ParamType::Str, "SmartCheck.bat", None, "watchdog entry point")
            .param("ini_path", ParamType::Str, "./bin/SmiWinTools/SmartCheck.ini", None, "watchdog INI rewritten before launch")
            .param("output_dir", ParamType::Str, "./testlog/SmartLog", None, "cleared before each run")
            .param("total_cycle", ParamType::Int, 0, Some(Constraint::range(0.0, f64::MAX)), "cycles, 0 for unlimited")
            .param("total_time", ParamType::Int, 60, Some(Constraint::range(1.0, f64::MAX)), "run length in minutes")
            .param("dut_id", ParamType::Str, "0", Some(Constraint::pattern("^([0-9]|10)$")), "disk index")
            .param("enable_monitor_smart", ParamType::Bool, true, None, "watch SMART attributes")
            .param("close_window_when_failed", ParamType::Bool, false, None, "close the console on failure")
            .param("stop_when_failed", ParamType::Bool, true, None, "stop at the first failure")
            .param("smart_config_file", ParamType::Str, r"config\SMART.ini", None, "attribute thresholds, relative to the batch file")
            .param(
                "runcard_grace_seconds",
                ParamType::Int,
                300,
                Some(Constraint::range(1.0, 86_400.0)),
                "wait for RunCard.ini to appear",
            )
            .with_control_defaults(3600, 3.0)
    }

    fn process_spec(&self, config: &ToolConfig) -> ProcessSpec {
        let install_dir = PathBuf::from(str_param(config, "install_path"));
        ProcessSpec::new(&install_dir, str_param(config, "executable_name")).working_dir(install_dir)
    }

    fn prepare(&self, config: &ToolConfig) -> Result<LaunchPlan, LaunchError> {
        let ini_path = absolute(&str_param(config, "ini_path"))?;
        Self::write_ini(config, &ini_path)?;
        debug!(ini = %ini_path.display(), "Watchdog INI written");

        let output_dir = absolute(&str_param(config, "output_dir"))?;
        clear_dir_contents(&output_dir)?;
        ensure_dir(&output_dir)?;

        let default_logs = absolute(&str_param(config, "install_path"))?.join(DEFAULT_LOG_DIR);
        if default_logs != output_dir && default_logs.is_dir() {
            if let Err(e) = clear_dir_contents(&default_logs) {
                warn!(dir = %default_logs.display(), error = %e, "Failed to clear default log directory");
            }
        }

        Ok(LaunchPlan {
            args: Vec::new(),
            written: vec![ini_path, output_dir],
        })
    }

    fn status_source(&self, config: &ToolConfig) -> Box<dyn StatusSource> {
        let output_dir = str_param(config, "output_dir");
        let pattern = format!("{}/**/RunCard.ini", glob::Pattern::escape(&output_dir));
        let grace = config.get_int("runcard_grace_seconds").unwrap_or(300);
        Box::new(
            SidecarStatusSource::new("smartcheck-runcard", pattern, Box::new(RunCardParser))
                .appearance_grace(Duration::from_secs(grace.unsigned_abs())),
        )
    }
}
