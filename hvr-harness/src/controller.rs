//! One lifecycle for every vendor tool.
//!
//! `NotInstalled → Installed → Configured → Launched → Monitoring →
//! {Passed | Failed | TimedOut | InfrastructureError} → Terminated`
//!
//! The run itself happens on a tokio task spawned by [`ToolController::start`].
//! The task owns the status source; the process manager is shared with the
//! controller so [`ToolController::stop`] can terminate the tool while the
//! task is polling.

use crate::events::{self, EventBus};
use crate::process::ProcessManager;
use crate::status::StatusSource;
use crate::tools::{LaunchPlan, ToolProfile};
use hvr_common::config::{
    CHECK_INTERVAL_SECONDS, INSTALL_TIMEOUT_SECONDS, STARTUP_TIMEOUT_SECONDS,
    STOP_TIMEOUT_SECONDS, TIMEOUT_SECONDS,
};
use hvr_common::{
    ConfigError, ConfigIssue, ControllerOutcome, ControllerState, ControllerStatus,
    HarnessError, LaunchError, OutcomeKind, Overrides, StatusSourceError, TerminalStatus,
    ToolConfig,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

// ── Cancellation ─────────────────────────────────────────────────────────

/// Cooperative cancel flag plus a wake-up for the poll sleep.
#[derive(Debug, Default)]
struct CancelSignal {
    requested: AtomicBool,
    wake: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a sleep that starts later still wakes.
        self.wake.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for `period` unless cancelled first.
    async fn sleep(&self, period: Duration) {
        tokio::select! {
            () = tokio::time::sleep(period) => {}
            () = self.wake.notified() => {}
        }
    }
}

// ── Run result ───────────────────────────────────────────────────────────

/// How a monitor task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// The run reached a verdict (or failed to).
    Completed(ControllerOutcome),
    /// `stop()` was called before a verdict. No outcome is produced.
    Cancelled,
    /// `join()` gave up waiting and aborted the task.
    Aborted,
}

impl RunResult {
    pub fn outcome(&self) -> Option<&ControllerOutcome> {
        match self {
            Self::Completed(outcome) => Some(outcome),
            Self::Cancelled | Self::Aborted => None,
        }
    }
}

/// Point-in-time view of a controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub id: String,
    pub tool: String,
    pub state: ControllerState,
    pub running: bool,
    pub result: Option<OutcomeKind>,
    pub error_count: u32,
}

#[derive(Serialize)]
struct StateEvent<'a> {
    controller_id: &'a str,
    state: ControllerState,
}

// ── Controller ───────────────────────────────────────────────────────────

pub struct ToolController {
    id: String,
    profile: Arc<dyn ToolProfile>,
    process: Arc<ProcessManager>,
    config: ToolConfig,
    plan: Option<LaunchPlan>,
    /// Inputs were written for the next run and not consumed yet.
    inputs_fresh: bool,
    // Behind a lock so the controller stays `Sync` across awaits.
    status_override: Mutex<Option<Box<dyn StatusSource>>>,
    events: EventBus,
    state: Arc<watch::Sender<ControllerState>>,
    outcome: Arc<watch::Sender<Option<ControllerOutcome>>>,
    cancel: Arc<CancelSignal>,
    task: Option<JoinHandle<RunResult>>,
}

impl ToolController {
    /// Controller over an explicit process manager, starting from the
    /// profile's default configuration.
    pub fn new(
        id: impl Into<String>,
        profile: Arc<dyn ToolProfile>,
        process: ProcessManager,
    ) -> Self {
        let initial = if process.is_installed() {
            ControllerState::Installed
        } else {
            ControllerState::NotInstalled
        };
        let config = profile.schema().defaults();
        Self {
            id: id.into(),
            profile,
            process: Arc::new(process),
            config,
            plan: None,
            inputs_fresh: false,
            status_override: Mutex::new(None),
            events: EventBus::default(),
            state: Arc::new(watch::channel(initial).0),
            outcome: Arc::new(watch::channel(None).0),
            cancel: Arc::new(CancelSignal::default()),
            task: None,
        }
    }

    /// Controller whose process manager is derived from `config`.
    pub fn from_config(
        id: impl Into<String>,
        profile: Arc<dyn ToolProfile>,
        config: ToolConfig,
    ) -> Self {
        let process = ProcessManager::new(profile.process_spec(&config));
        let mut controller = Self::new(id, profile, process);
        controller.config = config;
        controller
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Use `source` for the next run instead of the profile's own.
    #[must_use]
    pub fn with_status_source(mut self, source: Box<dyn StatusSource>) -> Self {
        *self
            .status_override
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner) = Some(source);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    pub fn process(&self) -> &ProcessManager {
        &self.process
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Receiver that sees every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ControllerState) {
        publish_state(&self.state, &self.events, &self.id, state);
    }

    // ── Install ──────────────────────────────────────────────────────────

    pub fn is_installed(&self) -> bool {
        self.process.is_installed()
    }

    pub async fn install(&self) -> Result<(), HarnessError> {
        let timeout = self
            .config
            .get_duration_secs(INSTALL_TIMEOUT_SECONDS)
            .unwrap_or(DEFAULT_INSTALL_TIMEOUT);
        self.process.install(timeout).await?;
        if self.state() == ControllerState::NotInstalled {
            self.set_state(ControllerState::Installed);
        }
        Ok(())
    }

    pub async fn uninstall(&mut self) -> Result<(), HarnessError> {
        let stop_timeout = self.stop_timeout();
        self.stop(stop_timeout).await;
        self.join(stop_timeout + Duration::from_secs(5)).await;
        let timeout = self
            .config
            .get_duration_secs(INSTALL_TIMEOUT_SECONDS)
            .unwrap_or(DEFAULT_INSTALL_TIMEOUT);
        self.process.uninstall(timeout).await?;
        self.plan = None;
        self.set_state(ControllerState::NotInstalled);
        Ok(())
    }

    // ── Configure ────────────────────────────────────────────────────────

    /// Adopt `config` and write the tool's inputs for it.
    pub fn configure(&mut self, config: ToolConfig) -> Result<(), HarnessError> {
        if config.tool() != self.profile.name() {
            return Err(ConfigError::new(
                self.profile.name(),
                vec![ConfigIssue::Malformed {
                    raw: config.tool().to_string(),
                    reason: format!("configuration is for '{}'", config.tool()),
                }],
            )
            .into());
        }
        if self.is_running() {
            return Err(self.infrastructure("cannot reconfigure while running"));
        }
        if !self.is_installed() {
            let spec = self.process.spec();
            return Err(LaunchError::NotInstalled {
                install_dir: spec.install_dir.clone(),
                candidates: spec.executables.clone(),
            }
            .into());
        }

        let plan = self.profile.prepare(&config)?;
        debug!(controller = %self.id, args = ?plan.args, written = plan.written.len(), "Tool inputs prepared");
        self.config = config;
        self.plan = Some(plan);
        self.inputs_fresh = true;
        self.set_state(ControllerState::Configured);
        Ok(())
    }

    /// Merge `overrides` into the current configuration and apply it.
    pub fn set_config(&mut self, overrides: &Overrides) -> Result<(), HarnessError> {
        let merged = self.config.merge(overrides)?;
        self.configure(merged)
    }

    // ── Run ──────────────────────────────────────────────────────────────

    pub fn start(&mut self) -> Result<(), HarnessError> {
        self.spawn(None)
    }

    /// Like [`start`](Self::start), additionally sending the outcome on `tx`.
    pub fn start_with_reporter(
        &mut self,
        tx: mpsc::Sender<ControllerOutcome>,
    ) -> Result<(), HarnessError> {
        self.spawn(Some(tx))
    }

    fn spawn(&mut self, reporter: Option<mpsc::Sender<ControllerOutcome>>) -> Result<(), HarnessError> {
        if self.is_running() {
            return Err(self.infrastructure("already running"));
        }
        if self.plan.is_none() {
            return Err(LaunchError::Prepare(format!("{} is not configured", self.id)).into());
        }
        // A rerun rewrites the inputs so the last run's results are gone.
        if !self.inputs_fresh {
            self.plan = Some(self.profile.prepare(&self.config)?);
        }
        self.inputs_fresh = false;
        let Some(plan) = &self.plan else {
            return Err(LaunchError::Prepare(format!("{} is not configured", self.id)).into());
        };

        let cfg = &self.config;
        let source = self
            .status_override
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.profile.status_source(cfg));
        let run = MonitorRun {
            id: self.id.clone(),
            process: Arc::clone(&self.process),
            source,
            args: plan.args.clone(),
            budget: cfg
                .get_duration_secs(TIMEOUT_SECONDS)
                .unwrap_or(Duration::from_secs(3600)),
            interval: cfg
                .get_duration_secs(CHECK_INTERVAL_SECONDS)
                .unwrap_or(Duration::from_secs(2)),
            startup_timeout: cfg
                .get_duration_secs(STARTUP_TIMEOUT_SECONDS)
                .unwrap_or(Duration::from_secs(30)),
            stop_timeout: self.stop_timeout(),
            cancel: Arc::new(CancelSignal::default()),
            state: Arc::clone(&self.state),
            outcome: Arc::clone(&self.outcome),
            reporter,
            events: self.events.clone(),
        };

        self.cancel = Arc::clone(&run.cancel);
        self.outcome.send_replace(None);
        info!(controller = %self.id, tool = self.profile.name(), budget_secs = run.budget.as_secs(), "Starting controller");
        self.task = Some(tokio::spawn(run.run()));
        Ok(())
    }

    /// Whether a monitor task is still in flight.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the run and terminate the tool. Safe to call repeatedly and
    /// when nothing was ever started.
    pub async fn stop(&self, timeout: Duration) {
        self.cancel.cancel();
        if let Err(e) = self.process.terminate(timeout).await {
            warn!(controller = %self.id, error = %e, "Terminate failed, killing");
            if let Err(e) = self.process.kill().await {
                warn!(controller = %self.id, error = %e, "Kill failed");
            }
        }
    }

    /// Wait up to `timeout` for the monitor task. On expiry the task is
    /// aborted and the tool killed. `None` when nothing was started.
    pub async fn join(&mut self, timeout: Duration) -> Option<RunResult> {
        let mut task = self.task.take()?;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(e)) => {
                warn!(controller = %self.id, error = %e, "Monitor task failed");
                self.abandon().await;
                Some(RunResult::Aborted)
            }
            Err(_) => {
                warn!(controller = %self.id, timeout_ms = timeout.as_millis() as u64, "Monitor task did not finish, aborting");
                task.abort();
                self.abandon().await;
                Some(RunResult::Aborted)
            }
        }
    }

    async fn abandon(&self) {
        if let Err(e) = self.process.kill().await {
            warn!(controller = %self.id, error = %e, "Kill failed");
        }
        self.set_state(ControllerState::Terminated);
    }

    /// Start, then wait for the outcome. Cancelled or aborted runs yield
    /// `HarnessError::Cancelled`.
    pub async fn run_to_completion(&mut self) -> Result<ControllerOutcome, HarnessError> {
        self.start()?;
        let budget = self
            .config
            .get_duration_secs(TIMEOUT_SECONDS)
            .unwrap_or(Duration::from_secs(3600));
        let startup = self
            .config
            .get_duration_secs(STARTUP_TIMEOUT_SECONDS)
            .unwrap_or_default();
        let wait = budget + startup + self.stop_timeout() + Duration::from_secs(30);
        match self.join(wait).await {
            Some(RunResult::Completed(outcome)) => Ok(outcome),
            _ => Err(HarnessError::Cancelled {
                controller: self.id.clone(),
            }),
        }
    }

    // ── Observation ──────────────────────────────────────────────────────

    pub fn outcome(&self) -> Option<ControllerOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn status(&self) -> ControllerStatus {
        match &*self.outcome.borrow() {
            None => ControllerStatus::Running,
            Some(o) if o.is_passed() => ControllerStatus::Passed,
            Some(_) => ControllerStatus::Failed,
        }
    }

    pub fn error_count(&self) -> u32 {
        self.outcome.borrow().as_ref().map_or(0, |o| o.error_count)
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let outcome = self.outcome.borrow();
        ControllerSnapshot {
            id: self.id.clone(),
            tool: self.profile.name().to_string(),
            state: self.state(),
            running: self.is_running(),
            result: outcome.as_ref().map(|o| o.kind.clone()),
            error_count: outcome.as_ref().map_or(0, |o| o.error_count),
        }
    }

    pub(crate) fn stop_timeout(&self) -> Duration {
        self.config
            .get_duration_secs(STOP_TIMEOUT_SECONDS)
            .unwrap_or(DEFAULT_STOP_TIMEOUT)
    }

    fn infrastructure(&self, reason: &str) -> HarnessError {
        HarnessError::Infrastructure {
            controller: self.id.clone(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for ToolController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolController")
            .field("id", &self.id)
            .field("tool", &self.profile.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for ToolController {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn publish_state(
    tx: &watch::Sender<ControllerState>,
    events: &EventBus,
    id: &str,
    state: ControllerState,
) {
    let previous = tx.send_replace(state);
    if previous != state {
        debug!(controller = id, from = %previous, to = %state, "State transition");
        events.emit(
            events::CONTROLLER_STATE,
            &StateEvent {
                controller_id: id,
                state,
            },
        );
    }
}

// ── Monitor task ─────────────────────────────────────────────────────────

struct MonitorRun {
    id: String,
    process: Arc<ProcessManager>,
    source: Box<dyn StatusSource>,
    args: Vec<String>,
    budget: Duration,
    interval: Duration,
    startup_timeout: Duration,
    stop_timeout: Duration,
    cancel: Arc<CancelSignal>,
    state: Arc<watch::Sender<ControllerState>>,
    outcome: Arc<watch::Sender<Option<ControllerOutcome>>>,
    reporter: Option<mpsc::Sender<ControllerOutcome>>,
    events: EventBus,
}

/// What ended the monitor loop before the process is cleaned up.
enum Ending {
    Verdict(OutcomeKind, Option<ControllerOutcome>),
    Cancelled,
}

impl MonitorRun {
    fn set_state(&self, state: ControllerState) {
        publish_state(&self.state, &self.events, &self.id, state);
    }

    async fn run(mut self) -> RunResult {
        let started = Instant::now();
        let ending = self.drive(started).await;

        let result = match ending {
            Ending::Cancelled => {
                info!(controller = %self.id, "Run cancelled before a verdict");
                RunResult::Cancelled
            }
            Ending::Verdict(kind, outcome) => {
                let outcome = outcome
                    .unwrap_or_else(|| ControllerOutcome::new(&self.id, kind, started.elapsed()));
                self.set_state(ControllerState::for_outcome(&outcome.kind));
                self.publish(&outcome).await;
                RunResult::Completed(outcome)
            }
        };

        if let Err(e) = self.process.terminate(self.stop_timeout).await {
            warn!(controller = %self.id, error = %e, "Terminate failed, killing");
            let _ = self.process.kill().await;
        }
        self.set_state(ControllerState::Terminated);
        result
    }

    async fn drive(&mut self, started: Instant) -> Ending {
        if self.cancel.is_cancelled() {
            return Ending::Cancelled;
        }
        if let Err(e) = self.process.launch(&self.args).await {
            warn!(controller = %self.id, error = %e, "Launch failed");
            return infrastructure(HarnessError::from(e));
        }
        self.set_state(ControllerState::Launched);
        self.source.reset();

        // Launched → Monitoring once the status source can be read.
        let ready_deadline = Instant::now() + self.startup_timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Ending::Cancelled;
            }
            if self.source.is_ready() {
                break;
            }
            if Instant::now() >= ready_deadline {
                return infrastructure(HarnessError::from(StatusSourceError::NeverReady {
                    waited_secs: self.startup_timeout.as_secs(),
                }));
            }
            self.cancel.sleep(self.interval).await;
        }
        self.set_state(ControllerState::Monitoring);

        loop {
            if self.cancel.is_cancelled() {
                return Ending::Cancelled;
            }
            if started.elapsed() >= self.budget {
                warn!(controller = %self.id, budget_secs = self.budget.as_secs(), "Time budget exhausted");
                return Ending::Verdict(OutcomeKind::TimedOut, None);
            }
            match self.source.poll() {
                Ok(TerminalStatus::StillRunning) => {}
                Ok(status) => {
                    if let Some(outcome) =
                        ControllerOutcome::from_status(&self.id, status, started.elapsed())
                    {
                        return Ending::Verdict(outcome.kind.clone(), Some(outcome));
                    }
                }
                Err(e) => {
                    warn!(controller = %self.id, source = self.source.name(), error = %e, "Status source failed");
                    return infrastructure(HarnessError::from(e));
                }
            }
            self.cancel.sleep(self.interval).await;
        }
    }

    // `&mut self` keeps the task future `Send`: the status source is not `Sync`.
    async fn publish(&mut self, outcome: &ControllerOutcome) {
        info!(
            controller = %self.id,
            result = %outcome.kind,
            error_count = outcome.error_count,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Controller finished"
        );
        self.outcome.send_replace(Some(outcome.clone()));
        self.events.emit(events::CONTROLLER_OUTCOME, outcome);
        if let Some(tx) = &self.reporter {
            if tx.send(outcome.clone()).await.is_err() {
                debug!(controller = %self.id, "Outcome receiver dropped");
            }
        }
    }
}

fn infrastructure(error: HarnessError) -> Ending {
    Ending::Verdict(OutcomeKind::InfrastructureError(error.to_string()), None)
}
