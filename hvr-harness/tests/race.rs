#![cfg(unix)]

mod common;

use common::{FAILING_RUNCARD, FakeTool, PASSING_RUNCARD, drain_events};
use hvr_common::testing::{TestGuard, TestPhase};
use hvr_common::{ControllerState, OutcomeKind};
use hvr_harness::events;
use hvr_harness::{EventBus, RaceCoordinator, RaceError, first_failure, first_outcome};
use std::time::{Duration, Instant};

#[tokio::test]
async fn failing_tool_beats_hanging_tool() {
    let guard = TestGuard::new("failing_tool_beats_hanging_tool");
    let failing = FakeTool::reporting(FAILING_RUNCARD, 0.2);
    let hanging = FakeTool::hanging();
    let mut a = failing.controller("a", &[]);
    let mut b = hanging.controller("b", &[]);

    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let started = Instant::now();
    guard.log(TestPhase::Execute, "racing failing tool against hanging tool");
    let result = RaceCoordinator::new(bus)
        .race(&mut [&mut a, &mut b], Duration::from_secs(30), first_outcome)
        .await
        .unwrap();
    guard.log(TestPhase::Verify, "checking winner and cleanup");

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(result.winner_id.as_deref(), Some("a"));
    assert!(matches!(result.outcome.kind, OutcomeKind::Failed(_)));
    assert!(result.loser_stopped);

    assert!(b.outcome().is_none());
    assert_eq!(b.state(), ControllerState::Terminated);
    assert!(!b.process().is_running().await);
    assert!(!a.process().is_running().await);

    let names = drain_events(&mut rx);
    assert_eq!(names.first().map(String::as_str), Some(events::RACE_STARTED));
    assert_eq!(names.last().map(String::as_str), Some(events::RACE_DECIDED));
}

#[tokio::test]
async fn overall_timeout_stops_everyone() {
    let guard = TestGuard::new("overall_timeout_stops_everyone");
    let x = FakeTool::hanging();
    let y = FakeTool::hanging();
    let mut a = x.controller("a", &[]);
    let mut b = y.controller("b", &[]);

    let result = RaceCoordinator::default()
        .race(&mut [&mut a, &mut b], Duration::from_secs(1), first_outcome)
        .await
        .unwrap();
    guard.log(TestPhase::Verify, "race returned after timeout");

    assert_eq!(result.winner_id, None);
    assert_eq!(result.outcome.kind, OutcomeKind::TimedOut);
    assert!(result.loser_stopped);
    for controller in [&a, &b] {
        assert!(controller.outcome().is_none());
        assert!(!controller.is_running());
        assert!(!controller.process().is_running().await);
    }
}

#[tokio::test]
async fn non_decisive_outcomes_keep_the_race_going() {
    let fast = FakeTool::reporting(PASSING_RUNCARD, 0.1);
    let slow = FakeTool::reporting(PASSING_RUNCARD, 0.8);
    let mut a = fast.controller("fast", &[]);
    let mut b = slow.controller("slow", &[]);

    let result = RaceCoordinator::default()
        .race(&mut [&mut a, &mut b], Duration::from_secs(30), first_failure)
        .await
        .unwrap();

    // Nobody failed: the last report stands.
    assert_eq!(result.winner_id.as_deref(), Some("slow"));
    assert!(result.outcome.is_passed());
    assert!(result.loser_stopped);
    assert!(a.outcome().unwrap().is_passed());
}

#[tokio::test]
async fn start_failure_stops_already_started() {
    let ok = FakeTool::hanging();
    let mut a = ok.controller("a", &[]);
    let mut b = ok.controller("b", &[]);
    // Starting the same controller twice is refused.
    b.start().unwrap();

    let err = RaceCoordinator::default()
        .race(&mut [&mut a, &mut b], Duration::from_secs(30), first_outcome)
        .await
        .unwrap_err();
    assert!(matches!(err, RaceError::Start { ref controller, .. } if controller == "b"));
    assert!(!a.is_running());
    assert!(a.outcome().is_none());

    b.stop(Duration::from_secs(1)).await;
    b.join(Duration::from_secs(10)).await;
}

#[tokio::test]
async fn all_completed_waits_for_every_tool() {
    let guard = TestGuard::new("all_completed_waits_for_every_tool");
    let fast = FakeTool::reporting(PASSING_RUNCARD, 0.1);
    let slow = FakeTool::reporting(FAILING_RUNCARD, 0.8);
    let mut a = fast.controller("fast", &[]);
    let mut b = slow.controller("slow", &[]);

    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    guard.log(TestPhase::Execute, "running both tools to completion");
    // No overall bound at all.
    let result = RaceCoordinator::new(bus)
        .race_all(&mut [&mut a, &mut b], Duration::MAX)
        .await
        .unwrap();

    guard.log(TestPhase::Verify, "checking both outcomes");
    let ids: Vec<&str> = result.outcomes.iter().map(|o| o.controller_id.as_str()).collect();
    assert_eq!(ids, ["fast", "slow"]);
    assert!(result.outcomes[0].is_passed());
    assert!(matches!(result.outcomes[1].kind, OutcomeKind::Failed(_)));
    assert!(result.unfinished.is_empty());
    assert!(result.all_stopped);
    assert!(!result.all_passed());
    for controller in [&a, &b] {
        assert!(!controller.process().is_running().await);
    }

    let names = drain_events(&mut rx);
    assert_eq!(names.first().map(String::as_str), Some(events::RACE_STARTED));
    assert_eq!(names.last().map(String::as_str), Some(events::RACE_ALL_COMPLETED));
}

#[tokio::test]
async fn all_completed_timeout_names_unfinished_tools() {
    let guard = TestGuard::new("all_completed_timeout_names_unfinished_tools");
    let done = FakeTool::reporting(PASSING_RUNCARD, 0.1);
    let stuck = FakeTool::hanging();
    let mut a = done.controller("done", &[]);
    let mut b = stuck.controller("stuck", &[]);

    let result = RaceCoordinator::default()
        .race_all(&mut [&mut a, &mut b], Duration::from_secs(2))
        .await
        .unwrap();
    guard.log(TestPhase::Verify, "race returned after timeout");

    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.outcomes[0].controller_id, "done");
    assert_eq!(result.unfinished, ["stuck"]);
    assert!(result.timed_out());
    assert!(result.all_stopped);
    assert!(b.outcome().is_none());
    assert!(!b.process().is_running().await);
}
