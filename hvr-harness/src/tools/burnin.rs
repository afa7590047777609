use super::{LaunchPlan, ToolProfile, absolute, opt_path, remove_stale, str_param, write_input};
use crate::process::{INSTALL_DIR_PLACEHOLDER, InstallerSpec, ProcessSpec, UninstallerSpec};
use crate::status::{
    CommandIndicator, CompositeStatusSource, LiveStatusSource, MarkerFileParser,
    SidecarStatusSource, StatusSource,
};
use hvr_common::config::Constraint;
use hvr_common::{LaunchError, ParamType, ToolConfig, ToolSchema};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub const TOOL: &str = "burnin";

/// Disk burn-in driven by a generated launch script.
#[derive(Debug, Clone, Copy, Default)]
pub struct BurnInProfile;

impl BurnInProfile {
    /// Script contents for `config`, with absolute paths.
    pub fn render_script(config: &ToolConfig) -> Result<String, LaunchError> {
        let cfg = absolute(&str_param(config, "config_file_path"))?;
        let log = absolute(&str_param(config, "log_path"))?;
        let minutes = config.get_int("test_duration_minutes").unwrap_or(1440);
        let drive = str_param(config, "test_drive_letter");
        Ok(format!(
            "LOAD \"{}\"\nSETLOG LOG yes Name \"{}\" TIME no REPORT text\nSETDURATION {minutes}\nSETDISK DISK {drive}:\nRUN DISK\n",
            cfg.display(),
            log.display(),
        ))
    }
}

impl ToolProfile for BurnInProfile {
    fn name(&self) -> &str {
        TOOL
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(TOOL)
            .param(
                "install_path",
                ParamType::Str,
                r"C:\Program Files\BurnInTest",
                None,
                "install directory",
            )
            .param("executable_name", ParamType::Str, "bit64.exe", None, "primary executable")
            .param("installer_path", ParamType::Str, "", None, "installer; empty disables install")
            .param("license_path", ParamType::Str, "", None, "licence copied after install")
            .param("script_path", ParamType::Str, "./Config/burnin_script.bits", None, "generated script")
            .param("config_file_path", ParamType::Str, "./Config/BurnInScript.bitcfg", None, "test configuration loaded by the script")
            .param("log_path", ParamType::Str, "./testlog/Burnin.log", None, "text log written by the tool")
            .param(
                "test_duration_minutes",
                ParamType::Int,
                1440,
                Some(Constraint::range(0.0, 10_080.0)),
                "run length",
            )
            .param(
                "test_drive_letter",
                ParamType::Str,
                "D",
                Some(Constraint::pattern("^[A-Z]$")),
                "drive under test",
            )
            .param("status_command", ParamType::Str, "", None, "command printing the status window text")
            .param(
                "ui_retry_max",
                ParamType::Int,
                60,
                Some(Constraint::range(1.0, 300.0)),
                "unreadable status polls tolerated",
            )
            .with_control_defaults(6000, 2.0)
    }

    fn process_spec(&self, config: &ToolConfig) -> ProcessSpec {
        let executable = str_param(config, "executable_name");
        let mut spec = ProcessSpec::new(str_param(config, "install_path"), executable.clone());
        if executable != "bit.exe" {
            spec = spec.fallback("bit.exe");
        }
        if let Some(installer) = opt_path(config, "installer_path") {
            spec = spec.installer(InstallerSpec {
                path: installer,
                args: vec![
                    "/SILENT".into(),
                    "/SUPPRESSMSGBOXES".into(),
                    "/NORESTART".into(),
                    format!("/DIR={INSTALL_DIR_PLACEHOLDER}"),
                ],
                license: opt_path(config, "license_path"),
            });
        }
        spec.uninstaller(UninstallerSpec {
            program: PathBuf::from("unins000.exe"),
            args: vec!["/VERYSILENT".into(), "/SUPPRESSMSGBOXES".into()],
        })
    }

    fn prepare(&self, config: &ToolConfig) -> Result<LaunchPlan, LaunchError> {
        let script = absolute(&str_param(config, "script_path"))?;
        let content = Self::render_script(config)?;
        write_input(&script, &content)?;
        debug!(script = %script.display(), "Burn-in script written");
        // The log is the verdict source; a previous run's copy must not decide this one.
        remove_stale(&absolute(&str_param(config, "log_path"))?)?;

        Ok(LaunchPlan {
            args: vec![
                "-S".into(),
                script.display().to_string(),
                "-K".into(),
                "-R".into(),
                "-W".into(),
            ],
            written: vec![script],
        })
    }

    fn status_source(&self, config: &ToolConfig) -> Box<dyn StatusSource> {
        let log = str_param(config, "log_path");
        let sidecar = SidecarStatusSource::new(
            "burnin-log",
            glob::Pattern::escape(&log),
            Box::new(MarkerFileParser::default()),
        )
        .appearance_grace(
            config
                .get_duration_secs(hvr_common::config::TIMEOUT_SECONDS)
                .unwrap_or(Duration::from_secs(6000)),
        );

        let mut composite = CompositeStatusSource::new(TOOL);
        if let Some(command) = config.get_str("status_command").filter(|s| !s.trim().is_empty()) {
            let mut parts = command.split_whitespace().map(str::to_string);
            if let Some(program) = parts.next() {
                let retries = config.get_int("ui_retry_max").unwrap_or(60);
                let live = LiveStatusSource::new(
                    "burnin-window",
                    Box::new(CommandIndicator::new(program, parts.collect())),
                )
                .max_unreadable(u32::try_from(retries).unwrap_or(60));
                composite = composite.with(Box::new(live));
            }
        }
        Box::new(composite.with(Box::new(sidecar)))
    }
}
