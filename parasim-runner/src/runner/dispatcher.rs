// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for the test runner.
//!
//! The dispatcher is the run's single mutation point: lane tasks execute
//! concurrently, but every completion funnels through this event loop, so
//! the shared pass/fail sets need no further locking. On each finished
//! attempt it applies the retry policy, and on retry exhaustion or a
//! shutdown signal it broadcasts cancellation: queued attempts are dropped,
//! in-flight subprocesses get a best-effort terminate, and results recorded
//! so far are preserved.

use super::internal_events::{AttemptOutcome, ExecutorEvent, LaneAttempt, RetryDecision};
use crate::{
    config::RetryLimits,
    inventory::TestId,
    reporter::{CancelReason, LaneEvent, LaneStatus, RunStats},
    signal::SignalHandler,
    time::StopwatchStart,
};
use debug_ignore::DebugIgnore;
use std::collections::BTreeSet;
use tokio::sync::{broadcast, mpsc::UnboundedReceiver, oneshot};
use tracing::debug;

/// Verdict of the retry policy for one finished attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum PolicyVerdict {
    /// The lane passed; nothing further to do.
    Done,
    /// Dispatch a retry carrying the incremented counters.
    Retry {
        retry_count: usize,
        launch_retry_count: usize,
    },
    /// A ceiling was exceeded (or there is nothing retryable); the lane is
    /// permanently failed.
    GiveUp,
}

/// The retry policy.
///
/// Only an actual test failure consumes the test-retry budget; launch
/// timeouts, stalls, and abnormal termination consume the separate
/// infrastructure budget. A retry also requires a non-empty failed subset
/// to re-attempt.
pub(super) fn evaluate_retry(
    status: LaneStatus,
    retry_count: usize,
    launch_retry_count: usize,
    has_failed_tests: bool,
    limits: RetryLimits,
) -> PolicyVerdict {
    if status == LaneStatus::Success {
        return PolicyVerdict::Done;
    }
    let retry_count = retry_count + usize::from(status == LaneStatus::Failed);
    let launch_retry_count = launch_retry_count + usize::from(status.is_infrastructure());

    if retry_count < limits.retry_limit
        && launch_retry_count < limits.launch_retry_limit
        && has_failed_tests
    {
        PolicyVerdict::Retry {
            retry_count,
            launch_retry_count,
        }
    } else {
        PolicyVerdict::GiveUp
    }
}

/// Context for the dispatcher.
#[derive(Debug)]
pub(super) struct DispatcherContext<F> {
    callback: DebugIgnore<F>,
    stats: RunStats,
    limits: RetryLimits,
    lane_count: usize,
    cancel_tx: broadcast::Sender<()>,
    stopwatch: StopwatchStart,
}

impl<F> DispatcherContext<F>
where
    F: FnMut(LaneEvent),
{
    pub(super) fn new(
        callback: F,
        limits: RetryLimits,
        attempted: BTreeSet<TestId>,
        lane_count: usize,
        cancel_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            callback: DebugIgnore(callback),
            stats: RunStats {
                attempted,
                ..RunStats::default()
            },
            limits,
            lane_count,
            cancel_tx,
            stopwatch: crate::time::stopwatch(),
        }
    }

    pub(super) fn run_started(&mut self) {
        debug!(
            start_time = %self.stopwatch.snapshot().start_time,
            "run starting",
        );
        (self.callback)(LaneEvent::RunStarted {
            lane_count: self.lane_count,
            test_count: self.stats.attempted.len(),
        });
    }

    /// Runs the dispatcher until every lane task has dropped its event
    /// sender, handling shutdown signals along the way.
    pub(super) async fn run(
        &mut self,
        mut events_rx: UnboundedReceiver<ExecutorEvent>,
        signal_handler: &mut SignalHandler,
    ) {
        let mut signals_done = false;
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                event = signal_handler.recv(), if !signals_done => {
                    match event {
                        Some(event) => {
                            debug!(?event, "shutdown signal received");
                            self.cancel(CancelReason::Signal);
                        }
                        None => signals_done = true,
                    }
                }
            }
        }
    }

    /// Finalizes and returns the run's aggregate results.
    pub(super) fn run_finished(&mut self) -> RunStats {
        self.stats.duration = self.stopwatch.snapshot().duration;
        let stats = self.stats.clone();
        (self.callback)(LaneEvent::RunFinished {
            stats: stats.clone(),
        });
        stats
    }

    pub(super) fn handle_event(&mut self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::AttemptStarted {
                simulator_name,
                test_count,
                retry_count,
                launch_retry_count,
            } => {
                (self.callback)(LaneEvent::AttemptStarted {
                    simulator_name,
                    test_count,
                    retry_count,
                    launch_retry_count,
                });
            }
            ExecutorEvent::AttemptFinished {
                attempt,
                outcome,
                decision_tx,
            } => self.attempt_finished(attempt, outcome, decision_tx),
        }
    }

    fn attempt_finished(
        &mut self,
        attempt: LaneAttempt,
        outcome: AttemptOutcome,
        decision_tx: oneshot::Sender<RetryDecision>,
    ) {
        debug!(
            lane = attempt.lane_index,
            simulator = %attempt.simulator.name,
            status = %outcome.status,
            failed = outcome.failed.len(),
            "lane attempt finished",
        );

        // A test that ever passed stays passed, even if an earlier attempt
        // reported it failed.
        self.stats.passed.extend(outcome.passed.iter().cloned());

        let decision = if self.stats.cancel_reason.is_some() {
            RetryDecision::Cancel
        } else {
            match evaluate_retry(
                outcome.status,
                attempt.retry_count,
                attempt.launch_retry_count,
                !outcome.failed.is_empty(),
                self.limits,
            ) {
                PolicyVerdict::Done => RetryDecision::Done,
                PolicyVerdict::Retry {
                    retry_count,
                    launch_retry_count,
                } => RetryDecision::Retry {
                    tests: outcome.failed.clone(),
                    retry_count,
                    launch_retry_count,
                },
                PolicyVerdict::GiveUp => RetryDecision::Cancel,
            }
        };

        let lane_retries = self
            .stats
            .lane_retries
            .entry(attempt.simulator.name.clone())
            .or_default();
        if let RetryDecision::Retry {
            retry_count,
            launch_retry_count,
            ..
        } = &decision
        {
            lane_retries.retry_count = *retry_count;
            lane_retries.launch_retry_count = *launch_retry_count;
        }

        (self.callback)(LaneEvent::AttemptFinished {
            simulator_name: attempt.simulator.name.clone(),
            status: outcome.status,
            failed_count: outcome.failed.len(),
            duration: outcome.duration,
            will_retry: matches!(decision, RetryDecision::Retry { .. }),
        });

        let exhausted = decision == RetryDecision::Cancel
            && self.stats.cancel_reason.is_none()
            && outcome.status != LaneStatus::Success;
        if exhausted {
            self.cancel(CancelReason::RetryExhausted {
                simulator_name: attempt.simulator.name.clone(),
            });
        }

        // The lane task may already be gone under cancellation.
        let _ = decision_tx.send(decision);
    }

    fn cancel(&mut self, reason: CancelReason) {
        if self.stats.cancel_reason.is_some() {
            return;
        }
        self.stats.cancel_reason = Some(reason.clone());
        (self.callback)(LaneEvent::RunCancelled { reason });
        // Receivers may all be gone if every lane already finished.
        let _ = self.cancel_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simctl::Simulator;
    use maplit::btreeset;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn limits(retry: usize, launch: usize) -> RetryLimits {
        RetryLimits {
            retry_limit: retry,
            launch_retry_limit: launch,
        }
    }

    #[test]
    fn launch_failures_never_consume_the_test_retry_budget() {
        let limits = limits(5, 10);
        let mut retry_count = 0;
        let mut launch_retry_count = 0;

        for round in 1..=9 {
            match evaluate_retry(
                LaneStatus::LaunchTimeout,
                retry_count,
                launch_retry_count,
                true,
                limits,
            ) {
                PolicyVerdict::Retry {
                    retry_count: rc,
                    launch_retry_count: lrc,
                } => {
                    retry_count = rc;
                    launch_retry_count = lrc;
                    assert_eq!(lrc, round);
                }
                verdict => panic!("round {round}: expected retry, got {verdict:?}"),
            }
        }
        assert_eq!(retry_count, 0, "test-retry budget untouched");

        // The tenth launch failure hits the launch ceiling.
        assert_eq!(
            evaluate_retry(
                LaneStatus::TestTimeout,
                retry_count,
                launch_retry_count,
                true,
                limits,
            ),
            PolicyVerdict::GiveUp,
        );
    }

    #[test]
    fn test_failures_never_consume_the_launch_retry_budget() {
        let limits = limits(5, 10);
        let mut retry_count = 0;
        let mut launch_retry_count = 0;

        for _ in 1..=4 {
            match evaluate_retry(
                LaneStatus::Failed,
                retry_count,
                launch_retry_count,
                true,
                limits,
            ) {
                PolicyVerdict::Retry {
                    retry_count: rc,
                    launch_retry_count: lrc,
                } => {
                    retry_count = rc;
                    launch_retry_count = lrc;
                }
                verdict => panic!("expected retry, got {verdict:?}"),
            }
        }
        assert_eq!(launch_retry_count, 0, "launch budget untouched");
        assert_eq!(retry_count, 4);
    }

    #[test]
    fn nothing_retryable_gives_up() {
        // A failed attempt with an empty failed subset (e.g. the harness
        // crashed after the last pass record) cannot be retried.
        assert_eq!(
            evaluate_retry(LaneStatus::TerminatedAbnormally, 0, 0, false, limits(5, 10)),
            PolicyVerdict::GiveUp,
        );
    }

    // Harness for driving the dispatcher synchronously.
    struct Harness {
        ctx: DispatcherContext<Box<dyn FnMut(LaneEvent)>>,
        _cancel_tx: broadcast::Sender<()>,
        cancel_rx: broadcast::Receiver<()>,
    }

    impl Harness {
        fn new(limits: RetryLimits, attempted: &[&str]) -> Self {
            let (cancel_tx, cancel_rx) = broadcast::channel(1);
            let ctx = DispatcherContext::new(
                Box::new(|_event| {}) as Box<dyn FnMut(LaneEvent)>,
                limits,
                attempted.iter().map(TestId::new).collect(),
                2,
                cancel_tx.clone(),
            );
            Self {
                ctx,
                _cancel_tx: cancel_tx,
                cancel_rx,
            }
        }

        fn finish_attempt(
            &mut self,
            simulator: &Simulator,
            tests: &[&str],
            retry_count: usize,
            launch_retry_count: usize,
            status: LaneStatus,
            passed: &[&str],
        ) -> RetryDecision {
            let passed: BTreeSet<TestId> = passed.iter().map(TestId::new).collect();
            let failed = tests
                .iter()
                .map(TestId::new)
                .filter(|t| !passed.contains(t))
                .collect();
            let (decision_tx, mut decision_rx) = oneshot::channel();
            self.ctx.handle_event(ExecutorEvent::AttemptFinished {
                attempt: LaneAttempt {
                    lane_index: 0,
                    simulator: simulator.clone(),
                    tests: tests.iter().map(TestId::new).collect(),
                    retry_count,
                    launch_retry_count,
                },
                outcome: AttemptOutcome {
                    status,
                    passed,
                    failed,
                    duration: Duration::from_millis(10),
                },
                decision_tx,
            });
            decision_rx.try_recv().expect("decision sent synchronously")
        }
    }

    fn simulator(name: &str) -> Simulator {
        Simulator {
            name: name.to_owned(),
            udid: format!("UDID-{name}"),
        }
    }

    #[test]
    fn two_lanes_with_one_retry_converge_to_success() {
        // Lane A passes all 5 up front; lane B fails 2 of 5, then passes
        // both on its retry.
        let lane_a = ["A/t0", "A/t1", "A/t2", "A/t3", "A/t4"];
        let lane_b = ["B/t0", "B/t1", "B/t2", "B/t3", "B/t4"];
        let all: Vec<&str> = lane_a.iter().chain(lane_b.iter()).copied().collect();
        let mut harness = Harness::new(RetryLimits::default(), &all);

        let sim_a = simulator("lane-a");
        let sim_b = simulator("lane-b");

        let decision = harness.finish_attempt(
            &sim_a,
            &lane_a,
            0,
            0,
            LaneStatus::Success,
            &lane_a,
        );
        assert_eq!(decision, RetryDecision::Done);

        let decision = harness.finish_attempt(
            &sim_b,
            &lane_b,
            0,
            0,
            LaneStatus::Failed,
            &["B/t0", "B/t2", "B/t4"],
        );
        let RetryDecision::Retry {
            tests,
            retry_count,
            launch_retry_count,
        } = decision
        else {
            panic!("expected retry, got {decision:?}");
        };
        // The retry carries only the failed subset, which is a strict
        // subset of the prior attempt's tests.
        assert_eq!(tests, vec![TestId::new("B/t1"), TestId::new("B/t3")]);
        assert_eq!((retry_count, launch_retry_count), (1, 0));

        let decision = harness.finish_attempt(
            &sim_b,
            &["B/t1", "B/t3"],
            retry_count,
            launch_retry_count,
            LaneStatus::Success,
            &["B/t1", "B/t3"],
        );
        assert_eq!(decision, RetryDecision::Done);

        let stats = harness.ctx.run_finished();
        assert!(stats.failed().is_empty());
        assert!(stats.is_success());
        assert_eq!(stats.lane_retries["lane-b"].retry_count, 1);
    }

    #[test]
    fn a_test_that_eventually_passes_is_reported_passed() {
        let mut harness = Harness::new(RetryLimits::default(), &["A/t0", "A/t1"]);
        let sim = simulator("lane-a");

        harness.finish_attempt(
            &sim,
            &["A/t0", "A/t1"],
            0,
            0,
            LaneStatus::Failed,
            &["A/t0"],
        );
        harness.finish_attempt(&sim, &["A/t1"], 1, 0, LaneStatus::Success, &["A/t1"]);

        let stats = harness.ctx.run_finished();
        assert_eq!(stats.passed, btreeset! { TestId::new("A/t0"), TestId::new("A/t1") });
        assert!(stats.failed().is_empty());
    }

    #[test]
    fn retry_exhaustion_cancels_the_run_and_reports_the_test() {
        let mut harness = Harness::new(limits(2, 10), &["A/t0", "B/t0"]);
        let sim_a = simulator("lane-a");
        let sim_b = simulator("lane-b");

        // Lane B records its pass before lane A exhausts its budget.
        let decision = harness.finish_attempt(
            &sim_b,
            &["B/t0"],
            0,
            0,
            LaneStatus::Success,
            &["B/t0"],
        );
        assert_eq!(decision, RetryDecision::Done);

        let decision =
            harness.finish_attempt(&sim_a, &["A/t0"], 0, 0, LaneStatus::Failed, &[]);
        assert!(matches!(decision, RetryDecision::Retry { retry_count: 1, .. }));

        let decision =
            harness.finish_attempt(&sim_a, &["A/t0"], 1, 0, LaneStatus::Failed, &[]);
        assert_eq!(decision, RetryDecision::Cancel);

        // Cancellation was broadcast to all lanes.
        assert!(harness.cancel_rx.try_recv().is_ok());

        let stats = harness.ctx.run_finished();
        assert!(!stats.is_success());
        assert_eq!(stats.failed(), btreeset! { TestId::new("A/t0") });
        assert_eq!(
            stats.cancel_reason,
            Some(CancelReason::RetryExhausted {
                simulator_name: "lane-a".to_owned(),
            }),
        );
        // Lane B's pass survives cancellation.
        assert!(stats.passed.contains(&TestId::new("B/t0")));
    }

    #[test]
    fn attempts_finishing_after_cancellation_are_told_to_stop() {
        let mut harness = Harness::new(limits(1, 1), &["A/t0", "B/t0"]);
        let sim_a = simulator("lane-a");
        let sim_b = simulator("lane-b");

        let decision =
            harness.finish_attempt(&sim_a, &["A/t0"], 0, 0, LaneStatus::Failed, &[]);
        assert_eq!(decision, RetryDecision::Cancel);

        // A lane finishing after cancellation gets Cancel regardless of its
        // own status, but its passes are still recorded.
        let decision = harness.finish_attempt(
            &sim_b,
            &["B/t0"],
            0,
            0,
            LaneStatus::Success,
            &["B/t0"],
        );
        assert_eq!(decision, RetryDecision::Cancel);

        let stats = harness.ctx.run_finished();
        assert!(stats.passed.contains(&TestId::new("B/t0")));
    }
}
