//! Run controllers side by side and keep the first decisive outcome, or
//! wait for all of them.
//!
//! Whatever ends the race (a decisive verdict, the overall timeout, or every
//! controller finishing without one) every controller is stopped and
//! joined before [`RaceCoordinator::race`] or [`RaceCoordinator::race_all`]
//! returns.

use crate::controller::ToolController;
use crate::events::{self, EventBus};
use hvr_common::{AllCompletedResult, ControllerOutcome, HarnessError, OutcomeKind, RaceResult};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Extra time granted to each controller's monitor task after `stop`.
const JOIN_SLACK: Duration = Duration::from_secs(5);

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Caller's reading of one controller's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// This outcome decides the race.
    Decisive(ControllerOutcome),
    /// Keep waiting for the others.
    Continue,
}

/// Default interpretation: any outcome decides the race.
pub fn first_outcome(_id: &str, outcome: &ControllerOutcome) -> Verdict {
    Verdict::Decisive(outcome.clone())
}

/// Only failures decide; a pass lets the others keep running.
pub fn first_failure(_id: &str, outcome: &ControllerOutcome) -> Verdict {
    if outcome.is_passed() {
        Verdict::Continue
    } else {
        Verdict::Decisive(outcome.clone())
    }
}

#[derive(Debug, Error)]
pub enum RaceError {
    #[error("no controllers to race")]
    Empty,

    #[error("failed to start {controller}: {source}")]
    Start {
        controller: String,
        #[source]
        source: HarnessError,
    },
}

#[derive(Serialize)]
struct RaceStarted<'a> {
    controllers: Vec<&'a str>,
    timeout_ms: u64,
}

#[derive(Serialize)]
struct AllCompleted<'a> {
    reported: Vec<&'a str>,
    unfinished: &'a [String],
    all_stopped: bool,
}

#[derive(Serialize)]
struct RaceDecided<'a> {
    winner_id: Option<&'a str>,
    outcome: &'a ControllerOutcome,
    loser_stopped: bool,
}

/// Races controllers against each other.
#[derive(Debug, Clone, Default)]
pub struct RaceCoordinator {
    events: EventBus,
}

impl RaceCoordinator {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    /// Start every controller, wait for the first decisive verdict, then
    /// stop and join all of them.
    ///
    /// When every controller reports without a decisive verdict, the last
    /// outcome received is returned with its controller as winner.
    pub async fn race<F>(
        &self,
        controllers: &mut [&mut ToolController],
        overall_timeout: Duration,
        interpret: F,
    ) -> Result<RaceResult, RaceError>
    where
        F: Fn(&str, &ControllerOutcome) -> Verdict,
    {
        let started = Instant::now();
        let mut rx = self.start_all(controllers, overall_timeout).await?;

        let deadline = deadline_after(overall_timeout);
        let mut last: Option<ControllerOutcome> = None;
        let decided = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(outcome)) => {
                    debug!(controller = %outcome.controller_id, result = %outcome.kind, "Race participant reported");
                    match interpret(&outcome.controller_id, &outcome) {
                        Verdict::Decisive(decisive) => break Some(decisive),
                        Verdict::Continue => last = Some(outcome),
                    }
                }
                // Every reporter is gone: nobody else will report.
                Ok(None) => break last.take(),
                Err(_) => break None,
            }
        };

        stop_all(controllers).await;
        let loser_stopped = all_stopped(controllers).await;

        let (winner_id, outcome) = match decided {
            Some(outcome) => (Some(outcome.controller_id.clone()), outcome),
            None => {
                warn!(timeout_secs = overall_timeout.as_secs(), "Race timed out without a decisive result");
                self.emit_timed_out(overall_timeout);
                (
                    None,
                    ControllerOutcome::new("race", OutcomeKind::TimedOut, started.elapsed()),
                )
            }
        };

        self.events.emit(
            events::RACE_DECIDED,
            &RaceDecided {
                winner_id: winner_id.as_deref(),
                outcome: &outcome,
                loser_stopped,
            },
        );
        info!(winner = ?winner_id, result = %outcome.kind, loser_stopped, "Race decided");

        Ok(RaceResult {
            winner_id,
            outcome,
            loser_stopped,
        })
    }

    /// Start every controller and wait until each one has reported or the
    /// overall timeout fires, then stop and join all of them.
    pub async fn race_all(
        &self,
        controllers: &mut [&mut ToolController],
        overall_timeout: Duration,
    ) -> Result<AllCompletedResult, RaceError> {
        let mut rx = self.start_all(controllers, overall_timeout).await?;

        let deadline = deadline_after(overall_timeout);
        let mut outcomes: Vec<ControllerOutcome> = Vec::with_capacity(controllers.len());
        while outcomes.len() < controllers.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(outcome)) => {
                    debug!(controller = %outcome.controller_id, result = %outcome.kind, "Race participant reported");
                    outcomes.push(outcome);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        timeout_secs = overall_timeout.as_secs(),
                        reported = outcomes.len(),
                        "Race timed out before every controller reported"
                    );
                    self.emit_timed_out(overall_timeout);
                    break;
                }
            }
        }

        stop_all(controllers).await;
        let all_stopped = all_stopped(controllers).await;
        let unfinished: Vec<String> = controllers
            .iter()
            .map(|c| c.id())
            .filter(|id| !outcomes.iter().any(|o| o.controller_id == *id))
            .map(str::to_string)
            .collect();

        self.events.emit(
            events::RACE_ALL_COMPLETED,
            &AllCompleted {
                reported: outcomes.iter().map(|o| o.controller_id.as_str()).collect(),
                unfinished: &unfinished,
                all_stopped,
            },
        );
        info!(
            reported = outcomes.len(),
            unfinished = unfinished.len(),
            all_stopped,
            "Race finished with every controller"
        );

        Ok(AllCompletedResult {
            outcomes,
            unfinished,
            all_stopped,
        })
    }

    /// Start every controller with a shared reporter. On a start failure the
    /// already started ones are stopped and joined.
    async fn start_all(
        &self,
        controllers: &mut [&mut ToolController],
        overall_timeout: Duration,
    ) -> Result<mpsc::Receiver<ControllerOutcome>, RaceError> {
        if controllers.is_empty() {
            return Err(RaceError::Empty);
        }
        let (tx, rx) = mpsc::channel(controllers.len());

        for i in 0..controllers.len() {
            if let Err(source) = controllers[i].start_with_reporter(tx.clone()) {
                let controller = controllers[i].id().to_string();
                warn!(%controller, error = %source, "Race start failed, stopping started controllers");
                stop_all(&mut controllers[..i]).await;
                return Err(RaceError::Start { controller, source });
            }
        }

        self.events.emit(
            events::RACE_STARTED,
            &RaceStarted {
                controllers: controllers.iter().map(|c| c.id()).collect(),
                timeout_ms: millis(overall_timeout),
            },
        );
        info!(
            controllers = controllers.len(),
            timeout_secs = overall_timeout.as_secs(),
            "Race started"
        );
        Ok(rx)
    }

    fn emit_timed_out(&self, overall_timeout: Duration) {
        self.events.emit(
            events::RACE_TIMED_OUT,
            &serde_json::json!({ "timeout_ms": millis(overall_timeout) }),
        );
    }
}

fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Stop every controller, then join each with a bounded wait.
async fn stop_all(controllers: &mut [&mut ToolController]) {
    for controller in controllers.iter() {
        controller.stop(controller.stop_timeout()).await;
    }
    for controller in controllers.iter_mut() {
        let timeout = controller.stop_timeout() + JOIN_SLACK;
        controller.join(timeout).await;
    }
}

async fn all_stopped(controllers: &[&mut ToolController]) -> bool {
    for controller in controllers {
        if controller.is_running() || controller.process().is_running().await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, kind: OutcomeKind) -> ControllerOutcome {
        ControllerOutcome::new(id, kind, Duration::from_secs(1))
    }

    #[test]
    fn builtin_interpretations() {
        let pass = outcome("a", OutcomeKind::Passed);
        let fail = outcome("b", OutcomeKind::Failed("boom".into()));
        assert!(matches!(first_outcome("a", &pass), Verdict::Decisive(_)));
        assert_eq!(first_failure("a", &pass), Verdict::Continue);
        assert_eq!(first_failure("b", &fail), Verdict::Decisive(fail.clone()));
    }

    #[tokio::test]
    async fn empty_race_is_rejected() {
        let coordinator = RaceCoordinator::default();
        let result = coordinator
            .race(&mut [], Duration::from_secs(1), first_outcome)
            .await;
        assert!(matches!(result, Err(RaceError::Empty)));
        let result = coordinator.race_all(&mut [], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RaceError::Empty)));
    }

    #[tokio::test]
    async fn unbounded_timeout_does_not_overflow() {
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > tokio::time::Instant::now() + Duration::from_secs(86_400));
        assert_eq!(millis(Duration::MAX), u64::MAX);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
