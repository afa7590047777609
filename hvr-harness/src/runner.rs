//! Checkpointed step sequence that survives reboots.
//!
//! Progress is persisted after every step. A step that needs a reboot is
//! recorded as complete, the relaunch is registered, the reboot scheduled
//! and the process leaves at once; the relaunched process skips every
//! completed step.

use crate::events::{self, EventBus};
use crate::host::{HostControl, HostError, ResumeCommand};
use crate::race::RaceError;
use hvr_common::{CheckpointError, CheckpointStore, ExecutionState, HarnessError};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub type StepFuture = Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send>>;

/// What a step asks of the runner once it has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    RebootRequired { delay: Duration, reason: String },
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Harness(#[from] HarnessError),

    #[error(transparent)]
    Race(#[from] RaceError),

    #[error("{0}")]
    Other(String),
}

impl StepError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// One named unit of work. Ids must be unique within a runner.
pub struct Step {
    id: String,
    action: Box<dyn Fn() -> StepFuture + Send + Sync>,
}

impl Step {
    pub fn new<F, Fut>(id: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            action: Box::new(move || Box::pin(action())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("id", &self.id).finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("reboot hand-off failed: {0}")]
    Host(#[from] HostError),

    #[error("step '{id}' failed: {source}")]
    StepFailed {
        id: String,
        #[source]
        source: StepError,
    },

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),
}

/// What a finished `run` did in this process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub reboot_count: u32,
}

#[derive(Serialize)]
struct StepEvent<'a> {
    step: &'a str,
}

pub struct ResumableRunner {
    steps: Vec<Step>,
    store: CheckpointStore,
    host: Arc<dyn HostControl>,
    resume: ResumeCommand,
    events: EventBus,
}

impl ResumableRunner {
    pub fn new(
        steps: Vec<Step>,
        store: CheckpointStore,
        host: Arc<dyn HostControl>,
        resume: ResumeCommand,
    ) -> Result<Self, RunnerError> {
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(RunnerError::DuplicateStep(step.id.clone()));
            }
        }
        Ok(Self {
            steps,
            store,
            host,
            resume,
            events: EventBus::default(),
        })
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.id.as_str())
    }

    /// Run every step not yet completed.
    ///
    /// Returns only when the sequence finished or failed; a step requesting
    /// a reboot ends the process inside this call.
    pub async fn run(&self) -> Result<RunSummary, RunnerError> {
        let mut state = self.store.load();
        if state.is_recovering {
            info!(
                reboot_count = state.reboot_count,
                last_step = ?state.current_step,
                completed = state.completed_steps.len(),
                "Resuming after reboot"
            );
            self.events.emit(events::RUNNER_RESUMING, &state);
        } else {
            info!(completed = state.completed_steps.len(), steps = self.steps.len(), "Starting step sequence");
            self.events.emit(events::RUNNER_STARTING_FRESH, &state);
        }

        let mut summary = RunSummary::default();
        for step in &self.steps {
            if state.is_completed(&step.id) {
                info!(step = %step.id, "Step already completed, skipping");
                self.events.emit(events::RUNNER_STEP_SKIPPED, &StepEvent { step: &step.id });
                summary.skipped.push(step.id.clone());
                continue;
            }

            state.is_recovering = false;
            state.current_step = Some(step.id.clone());
            self.store.save(&state)?;

            info!(step = %step.id, "Step started");
            self.events.emit(events::RUNNER_STEP_STARTED, &StepEvent { step: &step.id });

            match (step.action)().await {
                Ok(StepOutcome::Completed) => {
                    state.mark_completed(&step.id);
                    state.current_step = None;
                    self.store.save(&state)?;
                    info!(step = %step.id, "Step completed");
                    self.events.emit(events::RUNNER_STEP_COMPLETED, &StepEvent { step: &step.id });
                    summary.executed.push(step.id.clone());
                }
                Ok(StepOutcome::RebootRequired { delay, reason }) => {
                    state.mark_completed(&step.id);
                    state.is_recovering = true;
                    state.reboot_count += 1;
                    self.store.save(&state)?;
                    info!(step = %step.id, %reason, delay_secs = delay.as_secs(), reboot_count = state.reboot_count, "Step requested reboot");
                    self.events.emit(
                        events::RUNNER_REBOOT_REQUESTED,
                        &serde_json::json!({
                            "step": step.id,
                            "reason": reason,
                            "delay_secs": delay.as_secs(),
                            "reboot_count": state.reboot_count,
                        }),
                    );
                    return Err(self.hand_off(&mut state, &step.id, delay));
                }
                Err(source) => {
                    state.is_recovering = false;
                    self.store.save(&state)?;
                    error!(step = %step.id, error = %source, "Step failed");
                    self.events.emit(
                        events::RUNNER_STEP_FAILED,
                        &serde_json::json!({ "step": step.id, "error": source.to_string() }),
                    );
                    return Err(RunnerError::StepFailed {
                        id: step.id.clone(),
                        source,
                    });
                }
            }
        }

        self.finish(&mut state)?;
        summary.reboot_count = state.reboot_count;
        info!(executed = summary.executed.len(), skipped = summary.skipped.len(), reboot_count = summary.reboot_count, "Step sequence finished");
        self.events.emit(events::RUNNER_FINISHED, &summary);
        Ok(summary)
    }

    /// Register the relaunch, schedule the reboot and exit. Returns only
    /// when the hand-off could not be arranged, after rolling back so the
    /// reboot step runs again on the next attempt.
    fn hand_off(&self, state: &mut ExecutionState, step_id: &str, delay: Duration) -> RunnerError {
        let arranged = self
            .host
            .register_resume(&self.resume)
            .and_then(|()| self.host.schedule_reboot(delay));
        let error = match arranged {
            Ok(()) => {
                info!(delay_secs = delay.as_secs(), "Reboot scheduled, exiting");
                self.host.terminate_immediately()
            }
            Err(e) => e,
        };

        warn!(step = step_id, error = %error, "Reboot hand-off failed, rolling back");
        state.is_recovering = false;
        state.completed_steps.remove(step_id);
        state.current_step = Some(step_id.to_string());
        if let Err(e) = self.store.save(state) {
            error!(error = %e, "Failed to persist rollback");
        }
        if let Err(e) = self.host.deregister_resume() {
            warn!(error = %e, "Failed to remove resume entry during rollback");
        }
        RunnerError::Host(error)
    }

    fn finish(&self, state: &mut ExecutionState) -> Result<(), RunnerError> {
        state.is_recovering = false;
        state.current_step = None;
        self.store.save(state)?;
        self.host.deregister_resume()?;
        self.store.delete()?;
        Ok(())
    }
}
