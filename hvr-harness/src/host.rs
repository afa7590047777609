//! Operating-system hooks used across a reboot: scheduling the reboot,
//! registering a one-shot relaunch and leaving the process abruptly.

use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{operation} failed: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code:?}")]
    CommandFailed { command: String, code: Option<i32> },

    #[error("no startup directory available on this platform")]
    NoStartupDir,
}

impl HostError {
    fn io(operation: &str, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.to_string(),
            source,
        }
    }
}

/// The command line to run again after the reboot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl ResumeCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
        }
    }

    /// Same program, arguments and working directory as this process.
    pub fn current_process() -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args().skip(1).collect(),
            working_dir: std::env::current_dir()?,
        })
    }
}

pub trait HostControl: Send + Sync {
    /// Arrange for `command` to run once at the next login.
    fn register_resume(&self, command: &ResumeCommand) -> Result<(), HostError>;

    /// Remove the relaunch entry. Succeeds when none exists.
    fn deregister_resume(&self) -> Result<(), HostError>;

    fn schedule_reboot(&self, delay: Duration) -> Result<(), HostError>;

    /// Leave the process now. Nothing after this call runs.
    fn terminate_immediately(&self) -> ! {
        terminate_process_immediately()
    }
}

/// Flush stdio and exit without unwinding or running destructors.
pub fn terminate_process_immediately() -> ! {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(0)
}

// ── System host ──────────────────────────────────────────────────────────

/// Real reboots through `shutdown`, relaunch through the user's startup
/// folder (XDG autostart on unix, the Startup folder on windows).
#[derive(Debug, Clone)]
pub struct SystemHost {
    entry_name: String,
    startup_dir: PathBuf,
}

impl SystemHost {
    pub fn new(entry_name: impl Into<String>) -> Result<Self, HostError> {
        let startup_dir = default_startup_dir().ok_or(HostError::NoStartupDir)?;
        Ok(Self::with_startup_dir(entry_name, startup_dir))
    }

    pub fn with_startup_dir(entry_name: impl Into<String>, startup_dir: impl Into<PathBuf>) -> Self {
        Self {
            entry_name: entry_name.into(),
            startup_dir: startup_dir.into(),
        }
    }

    pub fn entry_path(&self) -> PathBuf {
        let ext = if cfg!(windows) { "bat" } else { "desktop" };
        self.startup_dir.join(format!("{}.{ext}", self.entry_name))
    }

    /// Startup entry contents. The entry deletes itself before relaunching.
    pub fn render_entry(&self, command: &ResumeCommand) -> String {
        let entry = self.entry_path();
        if cfg!(windows) {
            render_batch(command, &entry)
        } else {
            render_desktop(&self.entry_name, command, &entry)
        }
    }
}

impl HostControl for SystemHost {
    fn register_resume(&self, command: &ResumeCommand) -> Result<(), HostError> {
        std::fs::create_dir_all(&self.startup_dir)
            .map_err(|e| HostError::io("create startup dir", e))?;
        let path = self.entry_path();
        std::fs::write(&path, self.render_entry(command))
            .map_err(|e| HostError::io("write startup entry", e))?;
        info!(entry = %path.display(), program = %command.program.display(), "Resume registered");
        Ok(())
    }

    fn deregister_resume(&self) -> Result<(), HostError> {
        let path = self.entry_path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(entry = %path.display(), "Resume deregistered");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(entry = %path.display(), "No resume entry to remove");
                Ok(())
            }
            Err(e) => Err(HostError::io("remove startup entry", e)),
        }
    }

    fn schedule_reboot(&self, delay: Duration) -> Result<(), HostError> {
        let args = reboot_args(delay);
        let command = format!("shutdown {}", args.join(" "));
        info!(%command, delay_secs = delay.as_secs(), "Scheduling reboot");
        let status = std::process::Command::new("shutdown")
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| HostError::io("run shutdown", e))?;
        if !status.success() {
            warn!(%command, code = ?status.code(), "Reboot scheduling failed");
            return Err(HostError::CommandFailed {
                command,
                code: status.code(),
            });
        }
        Ok(())
    }
}

#[cfg(windows)]
fn default_startup_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| {
        d.join("Microsoft")
            .join("Windows")
            .join("Start Menu")
            .join("Programs")
            .join("Startup")
    })
}

#[cfg(not(windows))]
fn default_startup_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("autostart"))
}

/// `shutdown` arguments for a reboot after `delay`.
pub fn reboot_args(delay: Duration) -> Vec<String> {
    if cfg!(windows) {
        vec!["/r".into(), "/t".into(), delay.as_secs().to_string()]
    } else {
        // Unix shutdown takes whole minutes.
        let minutes = delay.as_secs().div_ceil(60);
        vec!["-r".into(), format!("+{minutes}")]
    }
}

fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn render_desktop(name: &str, command: &ResumeCommand, entry: &Path) -> String {
    let mut line = sh_quote(&command.program.to_string_lossy());
    for arg in &command.args {
        line.push(' ');
        line.push_str(&sh_quote(arg));
    }
    let script = format!(
        "rm -f {} && cd {} && exec {line}",
        sh_quote(&entry.to_string_lossy()),
        sh_quote(&command.working_dir.to_string_lossy()),
    );
    // Desktop Exec values escape backslashes and double quotes.
    let exec = format!("sh -c \"{}\"", script.replace('\\', "\\\\").replace('"', "\\\""));
    format!(
        "[Desktop Entry]\nType=Application\nName={name}\nExec={exec}\nX-GNOME-Autostart-enabled=true\nNoDisplay=true\n"
    )
}

fn render_batch(command: &ResumeCommand, entry: &Path) -> String {
    let mut line = format!("\"{}\"", command.program.display());
    for arg in &command.args {
        line.push_str(&format!(" \"{arg}\""));
    }
    format!(
        "@echo off\r\ndel \"{}\"\r\ncd /d \"{}\"\r\nstart \"\" {line}\r\n",
        entry.display(),
        command.working_dir.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn command() -> ResumeCommand {
        ResumeCommand::new("/opt/hvr/bin/runner", vec!["--plan".into(), "it's.json".into()], "/srv/run")
    }

    #[test]
    fn register_and_deregister_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let host = SystemHost::with_startup_dir("hvr-resume", dir.path().join("autostart"));
        host.deregister_resume().unwrap();

        host.register_resume(&command()).unwrap();
        host.register_resume(&command()).unwrap();
        assert!(host.entry_path().is_file());

        host.deregister_resume().unwrap();
        host.deregister_resume().unwrap();
        assert!(!host.entry_path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn desktop_entry_relaunches_and_removes_itself() {
        let dir = TempDir::new().unwrap();
        let host = SystemHost::with_startup_dir("hvr-resume", dir.path());
        let entry = host.render_entry(&command());
        assert!(entry.starts_with("[Desktop Entry]\n"));
        assert!(entry.contains("Name=hvr-resume"));
        assert!(entry.contains(&format!("rm -f '{}'", host.entry_path().display())));
        assert!(entry.contains("cd '/srv/run'"));
        assert!(entry.contains("exec '/opt/hvr/bin/runner' '--plan' 'it'\\\\''s.json'"));
    }

    #[test]
    fn reboot_delay_arguments() {
        if cfg!(windows) {
            assert_eq!(reboot_args(Duration::from_secs(90)), ["/r", "/t", "90"]);
        } else {
            assert_eq!(reboot_args(Duration::from_secs(90)), ["-r", "+2"]);
            assert_eq!(reboot_args(Duration::ZERO), ["-r", "+0"]);
        }
    }

    #[test]
    fn current_process_command() {
        let cmd = ResumeCommand::current_process().unwrap();
        assert!(cmd.program.is_absolute());
        assert_eq!(cmd.working_dir, std::env::current_dir().unwrap());
    }
}
