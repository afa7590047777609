//! Vendor executable lifecycle: install, launch, poll, terminate.
//!
//! A [`ProcessManager`] owns at most one running child. All methods take
//! `&self` so the manager can be shared between a controller and its
//! monitor task behind an `Arc`.

use hvr_common::{InstallError, LaunchError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Placeholder replaced by the install directory in installer arguments.
pub const INSTALL_DIR_PLACEHOLDER: &str = "{install_dir}";

const DEFAULT_LAUNCH_GRACE: Duration = Duration::from_secs(2);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// How to install the tool.
#[derive(Debug, Clone)]
pub struct InstallerSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// Licence file copied into the install directory afterwards.
    pub license: Option<PathBuf>,
}

/// How to uninstall the tool. `program` is relative to the install dir.
#[derive(Debug, Clone)]
pub struct UninstallerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Static description of a vendor tool on disk.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub install_dir: PathBuf,
    /// Primary executable name first, then fallbacks.
    pub executables: Vec<String>,
    pub installer: Option<InstallerSpec>,
    pub uninstaller: Option<UninstallerSpec>,
    pub working_dir: Option<PathBuf>,
    /// A tool that exits inside this window failed to launch.
    pub launch_grace: Duration,
    /// Append the tool's stdout and stderr here instead of discarding them.
    pub output_log: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(install_dir: impl Into<PathBuf>, executable: impl Into<String>) -> Self {
        Self {
            install_dir: install_dir.into(),
            executables: vec![executable.into()],
            installer: None,
            uninstaller: None,
            working_dir: None,
            launch_grace: DEFAULT_LAUNCH_GRACE,
            output_log: None,
        }
    }

    #[must_use]
    pub fn fallback(mut self, executable: impl Into<String>) -> Self {
        self.executables.push(executable.into());
        self
    }

    #[must_use]
    pub fn installer(mut self, installer: InstallerSpec) -> Self {
        self.installer = Some(installer);
        self
    }

    #[must_use]
    pub fn uninstaller(mut self, uninstaller: UninstallerSpec) -> Self {
        self.uninstaller = Some(uninstaller);
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn launch_grace(mut self, grace: Duration) -> Self {
        self.launch_grace = grace;
        self
    }

    #[must_use]
    pub fn output_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_log = Some(path.into());
        self
    }
}

/// Identity of a launched tool instance.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub program: PathBuf,
    pub started_at: Instant,
}

struct Running {
    child: Child,
    handle: ProcessHandle,
}

pub struct ProcessManager {
    spec: ProcessSpec,
    running: Mutex<Option<Running>>,
}

impl ProcessManager {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            running: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// First existing executable among the primary name and its fallbacks.
    pub fn resolve_executable(&self) -> Option<PathBuf> {
        self.spec
            .executables
            .iter()
            .map(|name| self.spec.install_dir.join(name))
            .find(|p| p.is_file())
    }

    pub fn is_installed(&self) -> bool {
        self.resolve_executable().is_some()
    }

    // ── Install / uninstall ──────────────────────────────────────────────

    /// Run the installer. A no-op when the tool is already installed.
    pub async fn install(&self, timeout: Duration) -> Result<(), InstallError> {
        if self.is_installed() {
            debug!(install_dir = %self.spec.install_dir.display(), "Already installed");
            return Ok(());
        }
        let Some(installer) = &self.spec.installer else {
            return Err(InstallError::InstallerNotFound(self.spec.install_dir.clone()));
        };
        if !installer.path.is_file() {
            return Err(InstallError::InstallerNotFound(installer.path.clone()));
        }

        let install_dir = self.spec.install_dir.to_string_lossy();
        let args: Vec<String> = installer
            .args
            .iter()
            .map(|a| a.replace(INSTALL_DIR_PLACEHOLDER, &install_dir))
            .collect();
        info!(installer = %installer.path.display(), ?args, "Running installer");

        run_bounded("install", &installer.path, &args, timeout).await?;

        if let Some(license) = &installer.license {
            self.install_license(license)?;
        }

        if !self.is_installed() {
            return Err(InstallError::Verification {
                install_dir: self.spec.install_dir.clone(),
            });
        }
        info!(install_dir = %self.spec.install_dir.display(), "Installation complete");
        Ok(())
    }

    fn install_license(&self, license: &Path) -> Result<(), InstallError> {
        if !license.is_file() {
            return Err(InstallError::LicenseNotFound(license.to_path_buf()));
        }
        let Some(name) = license.file_name() else {
            return Err(InstallError::LicenseNotFound(license.to_path_buf()));
        };
        let target = self.spec.install_dir.join(name);
        std::fs::create_dir_all(&self.spec.install_dir)
            .and_then(|()| std::fs::copy(license, &target))
            .map_err(|e| InstallError::Io {
                operation: "license copy".to_string(),
                message: e.to_string(),
            })?;
        debug!(target = %target.display(), "Licence installed");
        Ok(())
    }

    /// Remove the tool. Without a usable uninstaller the install directory
    /// is deleted outright.
    pub async fn uninstall(&self, timeout: Duration) -> Result<(), InstallError> {
        if !self.is_installed() {
            return Ok(());
        }
        if let Err(e) = self.kill().await {
            warn!(error = %e, "Failed to kill tool before uninstall");
        }

        let uninstaller = self
            .spec
            .uninstaller
            .as_ref()
            .map(|u| (self.spec.install_dir.join(&u.program), &u.args))
            .filter(|(path, _)| path.is_file());

        match uninstaller {
            Some((path, args)) => {
                info!(uninstaller = %path.display(), "Running uninstaller");
                run_bounded("uninstall", &path, args, timeout).await?;
            }
            None => {
                warn!(
                    install_dir = %self.spec.install_dir.display(),
                    "Uninstaller not found, removing install directory"
                );
                std::fs::remove_dir_all(&self.spec.install_dir).map_err(|e| InstallError::Io {
                    operation: "uninstall".to_string(),
                    message: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    // ── Launch / observe ─────────────────────────────────────────────────

    /// Start the tool. A previous instance still running is terminated
    /// first.
    pub async fn launch(&self, args: &[String]) -> Result<ProcessHandle, LaunchError> {
        let Some(program) = self.resolve_executable() else {
            return Err(LaunchError::NotInstalled {
                install_dir: self.spec.install_dir.clone(),
                candidates: self.spec.executables.clone(),
            });
        };

        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            warn!(pid = ?previous.handle.pid, "Tool already running, stopping it before relaunch");
            stop_child(previous.child, previous.handle.pid, KILL_WAIT).await;
        }

        let mut command = Command::new(&program);
        command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }
        match &self.spec.output_log {
            Some(log) => {
                let (out, err) = open_output_log(log).map_err(|e| LaunchError::Spawn {
                    program: program.clone(),
                    message: format!("cannot open output log {}: {e}", log.display()),
                })?;
                command.stdout(out).stderr(err);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let mut child = command.spawn().map_err(|e| LaunchError::Spawn {
            program: program.clone(),
            message: e.to_string(),
        })?;
        let handle = ProcessHandle {
            pid: child.id(),
            program: program.clone(),
            started_at: Instant::now(),
        };
        info!(program = %program.display(), pid = ?handle.pid, ?args, "Tool launched");

        if !self.spec.launch_grace.is_zero() {
            tokio::time::sleep(self.spec.launch_grace).await;
        }
        if let Ok(Some(status)) = child.try_wait() {
            warn!(program = %program.display(), code = ?status.code(), "Tool exited during launch grace");
            return Err(LaunchError::ExitedImmediately {
                program,
                code: status.code(),
                grace_ms: self.spec.launch_grace.as_millis() as u64,
            });
        }

        *running = Some(Running {
            child,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    pub async fn is_running(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(r) = running.as_mut() else {
            return false;
        };
        match r.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid = ?r.handle.pid, code = ?status.code(), "Tool has exited");
                false
            }
            Err(e) => {
                warn!(pid = ?r.handle.pid, error = %e, "Failed to poll tool process");
                false
            }
        }
    }

    pub async fn handle(&self) -> Option<ProcessHandle> {
        self.running.lock().await.as_ref().map(|r| r.handle.clone())
    }

    // ── Stop ─────────────────────────────────────────────────────────────

    /// Ask the tool to exit, then force-kill it after `timeout`.
    /// Succeeds trivially when nothing is running.
    pub async fn terminate(&self, timeout: Duration) -> std::io::Result<()> {
        let Some(r) = self.running.lock().await.take() else {
            return Ok(());
        };
        stop_child(r.child, r.handle.pid, timeout).await;
        Ok(())
    }

    /// Force-kill the tool immediately.
    pub async fn kill(&self) -> std::io::Result<()> {
        let Some(mut r) = self.running.lock().await.take() else {
            return Ok(());
        };
        if let Ok(Some(_)) = r.child.try_wait() {
            return Ok(());
        }
        r.child.start_kill()?;
        let _ = tokio::time::timeout(KILL_WAIT, r.child.wait()).await;
        info!(pid = ?r.handle.pid, "Tool killed");
        Ok(())
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Graceful signal, bounded wait, then kill.
async fn stop_child(mut child: Child, pid: Option<u32>, timeout: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Some(pid) = pid {
        send_graceful_stop(pid);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?pid, code = ?status.code(), "Tool stopped");
        }
        Ok(Err(e)) => warn!(?pid, error = %e, "Failed waiting for tool to stop"),
        Err(_) => {
            warn!(?pid, timeout_ms = timeout.as_millis() as u64, "Tool ignored stop request, killing");
            if let Err(e) = child.start_kill() {
                warn!(?pid, error = %e, "Kill failed");
            }
            let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
        }
    }
}

#[cfg(unix)]
fn send_graceful_stop(pid: u32) -> bool {
    match std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!(pid, error = %e, "Failed to send TERM");
            false
        }
    }
}

#[cfg(windows)]
fn send_graceful_stop(pid: u32) -> bool {
    match std::process::Command::new("taskkill")
        .arg("/PID")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!(pid, error = %e, "Failed to send close request");
            false
        }
    }
}

fn open_output_log(path: &Path) -> std::io::Result<(std::fs::File, std::fs::File)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let out = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let err = out.try_clone()?;
    Ok((out, err))
}

/// Run a helper program to completion within `timeout`.
async fn run_bounded(
    operation: &str,
    program: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<(), InstallError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| InstallError::Io {
            operation: operation.to_string(),
            message: format!("failed to start {}: {e}", program.display()),
        })?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(InstallError::ToolReported {
            operation: operation.to_string(),
            code: status.code(),
        }),
        Ok(Err(e)) => Err(InstallError::Io {
            operation: operation.to_string(),
            message: e.to_string(),
        }),
        Err(_) => {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
            Err(InstallError::TimedOut {
                operation: operation.to_string(),
                after_secs: timeout.as_secs(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn sh_manager(grace: Duration) -> ProcessManager {
        ProcessManager::new(ProcessSpec::new("/bin", "sh").launch_grace(grace))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn fallback_executable_is_used() {
        let pm = ProcessManager::new(ProcessSpec::new("/bin", "no-such-tool-64").fallback("sh"));
        assert!(pm.is_installed());
        assert_eq!(pm.resolve_executable(), Some(PathBuf::from("/bin/sh")));
    }

    #[test]
    fn missing_executables_mean_not_installed() {
        let dir = TempDir::new().unwrap();
        let pm = ProcessManager::new(ProcessSpec::new(dir.path(), "bit64.exe").fallback("bit.exe"));
        assert!(!pm.is_installed());
    }

    #[tokio::test]
    async fn launch_not_installed_is_reported() {
        let dir = TempDir::new().unwrap();
        let pm = ProcessManager::new(ProcessSpec::new(dir.path(), "bit.exe"));
        let err = pm.launch(&[]).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotInstalled { .. }));
    }

    #[tokio::test]
    async fn launch_detects_immediate_exit() {
        let pm = sh_manager(Duration::from_millis(200));
        let err = pm.launch(&sh("exit 3")).await.unwrap_err();
        match err {
            LaunchError::ExitedImmediately { code, .. } => assert_eq!(code, Some(3)),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!pm.is_running().await);
    }

    #[tokio::test]
    async fn terminate_stops_running_tool_and_is_idempotent() {
        let pm = sh_manager(Duration::from_millis(50));
        let handle = pm.launch(&sh("exec sleep 30")).await.unwrap();
        assert!(handle.pid.is_some());
        assert!(pm.is_running().await);

        pm.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(!pm.is_running().await);
        pm.terminate(Duration::from_secs(5)).await.unwrap();
        pm.kill().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_escalates_when_term_is_ignored() {
        let pm = sh_manager(Duration::from_millis(100));
        pm.launch(&sh("trap '' TERM; while true; do sleep 1; done"))
            .await
            .unwrap();
        let started = Instant::now();
        pm.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(!pm.is_running().await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn relaunch_stops_previous_instance() {
        let pm = sh_manager(Duration::from_millis(50));
        let first = pm.launch(&sh("exec sleep 30")).await.unwrap();
        let second = pm.launch(&sh("exec sleep 30")).await.unwrap();
        assert_ne!(first.pid, second.pid);
        assert_eq!(pm.handle().await.unwrap().pid, second.pid);
        pm.kill().await.unwrap();
    }

    #[tokio::test]
    async fn output_is_redirected_to_log() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("logs").join("tool.log");
        let pm = ProcessManager::new(
            ProcessSpec::new("/bin", "sh")
                .launch_grace(Duration::from_millis(300))
                .output_log(&log),
        );
        pm.launch(&sh("echo hello-from-tool; exec sleep 30"))
            .await
            .unwrap();
        pm.kill().await.unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("hello-from-tool"));
    }

    #[tokio::test]
    async fn install_copies_license_and_verifies() {
        let dir = TempDir::new().unwrap();
        let install_dir = dir.path().join("tool");
        let installer = write_script(
            dir.path(),
            "setup.sh",
            "mkdir -p \"$1\" && printf '#!/bin/sh\\n' > \"$1/bit.exe\" && chmod +x \"$1/bit.exe\"",
        );
        let license = dir.path().join("key.dat");
        std::fs::write(&license, b"licence").unwrap();

        let pm = ProcessManager::new(ProcessSpec::new(&install_dir, "bit.exe").installer(
            InstallerSpec {
                path: installer,
                args: vec![INSTALL_DIR_PLACEHOLDER.to_string()],
                license: Some(license),
            },
        ));
        pm.install(Duration::from_secs(10)).await.unwrap();
        assert!(pm.is_installed());
        assert!(install_dir.join("key.dat").is_file());

        // Second call is a no-op.
        pm.install(Duration::from_secs(10)).await.unwrap();
    }

    #[tokio::test]
    async fn install_timeout_differs_from_tool_failure() {
        let dir = TempDir::new().unwrap();
        let slow = write_script(dir.path(), "slow.sh", "sleep 30");
        let failing = write_script(dir.path(), "fail.sh", "exit 7");

        let pm = ProcessManager::new(ProcessSpec::new(dir.path().join("a"), "bit.exe").installer(
            InstallerSpec {
                path: slow,
                args: vec![],
                license: None,
            },
        ));
        let err = pm.install(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, InstallError::TimedOut { .. }));

        let pm = ProcessManager::new(ProcessSpec::new(dir.path().join("b"), "bit.exe").installer(
            InstallerSpec {
                path: failing,
                args: vec![],
                license: None,
            },
        ));
        let err = pm.install(Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(
            err,
            InstallError::ToolReported {
                operation: "install".into(),
                code: Some(7)
            }
        );
    }

    #[tokio::test]
    async fn install_without_installer_fails() {
        let dir = TempDir::new().unwrap();
        let pm = ProcessManager::new(ProcessSpec::new(dir.path(), "bit.exe"));
        assert!(matches!(
            pm.install(Duration::from_secs(1)).await,
            Err(InstallError::InstallerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn uninstall_falls_back_to_removing_directory() {
        let dir = TempDir::new().unwrap();
        let install_dir = dir.path().join("tool");
        std::fs::create_dir_all(&install_dir).unwrap();
        write_script(&install_dir, "bit.exe", "exit 0");

        let pm = ProcessManager::new(ProcessSpec::new(&install_dir, "bit.exe").uninstaller(
            UninstallerSpec {
                program: "unins000.exe".into(),
                args: vec![],
            },
        ));
        assert!(pm.is_installed());
        pm.uninstall(Duration::from_secs(5)).await.unwrap();
        assert!(!install_dir.exists());
        pm.uninstall(Duration::from_secs(5)).await.unwrap();
    }
}
