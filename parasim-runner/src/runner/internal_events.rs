// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Internal events used between the runner components.
//!
//! These are sent by the executor (the part that runs subprocesses) to the
//! dispatcher (the part that owns shared run state). A finished attempt
//! carries a response channel: the dispatcher alone decides whether the lane
//! retries, stops, or the whole run is cancelled.

use crate::{inventory::TestId, reporter::LaneStatus, simctl::Simulator};
use std::{collections::BTreeSet, time::Duration};
use tokio::sync::oneshot;

/// One subprocess invocation bound to one simulator and one ordered test
/// subset. Retries create a fresh attempt carrying only the failed subset
/// and incremented counters, on the same simulator.
#[derive(Clone, Debug)]
pub(crate) struct LaneAttempt {
    pub(crate) lane_index: usize,
    pub(crate) simulator: Simulator,
    pub(crate) tests: Vec<TestId>,
    /// Retries caused by actual test failures so far.
    pub(crate) retry_count: usize,
    /// Retries caused by infrastructure flakiness so far.
    pub(crate) launch_retry_count: usize,
}

/// The classified result of one attempt, derived from log evidence rather
/// than the raw exit code.
#[derive(Clone, Debug)]
pub(crate) struct AttemptOutcome {
    pub(crate) status: LaneStatus,
    /// Requested tests the log records as passed.
    pub(crate) passed: BTreeSet<TestId>,
    /// Requested tests with no pass record, in dispatch order.
    pub(crate) failed: Vec<TestId>,
    pub(crate) duration: Duration,
}

/// An event from a lane task to the dispatcher.
#[derive(Debug)]
pub(crate) enum ExecutorEvent {
    AttemptStarted {
        simulator_name: String,
        test_count: usize,
        retry_count: usize,
        launch_retry_count: usize,
    },
    AttemptFinished {
        attempt: LaneAttempt,
        outcome: AttemptOutcome,
        /// The dispatcher's verdict for this lane. Exactly one decision is
        /// sent per finished attempt.
        decision_tx: oneshot::Sender<RetryDecision>,
    },
}

/// The dispatcher's verdict on a finished attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum RetryDecision {
    /// The lane is done; no further attempts.
    Done,
    /// Wipe the simulator and dispatch a new attempt with only the failed
    /// subset.
    Retry {
        tests: Vec<TestId>,
        retry_count: usize,
        launch_retry_count: usize,
    },
    /// The run is being cancelled; the lane must not dispatch again.
    Cancel,
}
