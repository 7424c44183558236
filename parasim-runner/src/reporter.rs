// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events and final reporting for a run.
//!
//! The runner surfaces progress through a caller-supplied callback receiving
//! [`LaneEvent`]s, and aggregates per-lane outcomes into a [`RunStats`] that
//! determines the process exit code: success iff every attempted test
//! eventually passed on some attempt.

use crate::{helpers::plural, inventory::TestId};
use owo_colors::{OwoColorize, Style};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, io,
    io::Write,
    time::Duration,
};

/// Terminal status of one lane attempt.
///
/// `Stopped` and `Running` states exist only as control flow inside the
/// executor; an attempt always reports exactly one of these.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LaneStatus {
    /// Every requested test passed and no watchdog fired.
    Success,
    /// One or more requested tests did not report passing.
    Failed,
    /// The suite-started marker never appeared within the launch timeout.
    LaunchTimeout,
    /// The subprocess produced no output for the test timeout window.
    TestTimeout,
    /// The subprocess was killed by a signal or could not be spawned.
    TerminatedAbnormally,
}

impl LaneStatus {
    /// True for statuses caused by infrastructure flakiness rather than
    /// test-code failure.
    pub fn is_infrastructure(self) -> bool {
        matches!(
            self,
            Self::LaunchTimeout | Self::TestTimeout | Self::TerminatedAbnormally
        )
    }
}

impl fmt::Display for LaneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "passed",
            Self::Failed => "failed",
            Self::LaunchTimeout => "launch timeout",
            Self::TestTimeout => "stalled",
            Self::TerminatedAbnormally => "terminated abnormally",
        };
        f.write_str(s)
    }
}

/// Why a run was cancelled before all lanes finished.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CancelReason {
    /// A lane exhausted one of its retry ceilings.
    RetryExhausted {
        /// The lane's simulator name.
        simulator_name: String,
    },
    /// A shutdown signal was received.
    Signal,
}

/// Retry totals for one lane.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LaneRetries {
    /// Retries caused by actual test failures.
    pub retry_count: usize,
    /// Retries caused by infrastructure flakiness.
    pub launch_retry_count: usize,
}

/// Aggregate results for a run, built incrementally as lane attempts
/// complete.
#[derive(Clone, Debug, Default)]
pub struct RunStats {
    /// Every test assigned to some lane in this run.
    pub attempted: BTreeSet<TestId>,
    /// Every test that passed on any attempt.
    pub passed: BTreeSet<TestId>,
    /// Retry totals per simulator name.
    pub lane_retries: BTreeMap<String, LaneRetries>,
    /// Set once if the run was cancelled.
    pub cancel_reason: Option<CancelReason>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl RunStats {
    /// The tests that never passed on any attempt.
    pub fn failed(&self) -> BTreeSet<TestId> {
        self.attempted.difference(&self.passed).cloned().collect()
    }

    /// Overall verdict: every attempted test eventually passed, and the run
    /// was not cancelled.
    pub fn is_success(&self) -> bool {
        self.cancel_reason.is_none() && self.failed().is_empty()
    }
}

/// A progress event delivered to the run callback.
#[derive(Clone, Debug)]
pub enum LaneEvent {
    /// All lanes are about to be dispatched.
    RunStarted {
        /// Number of non-empty lanes.
        lane_count: usize,
        /// Total tests across all lanes.
        test_count: usize,
    },
    /// One lane attempt is starting.
    AttemptStarted {
        /// The lane's simulator name.
        simulator_name: String,
        /// Number of tests in this attempt.
        test_count: usize,
        /// Test-failure retry counter carried into this attempt.
        retry_count: usize,
        /// Infrastructure retry counter carried into this attempt.
        launch_retry_count: usize,
    },
    /// One lane attempt reached a terminal status.
    AttemptFinished {
        /// The lane's simulator name.
        simulator_name: String,
        /// The attempt's terminal status.
        status: LaneStatus,
        /// Number of tests that did not report passing.
        failed_count: usize,
        /// Attempt duration.
        duration: Duration,
        /// True if a retry attempt will be dispatched.
        will_retry: bool,
    },
    /// The run was cancelled.
    RunCancelled {
        /// Why the run was cancelled.
        reason: CancelReason,
    },
    /// All lanes reached a terminal state.
    RunFinished {
        /// Final aggregate results.
        stats: RunStats,
    },
}

#[derive(Clone, Copy, Debug, Default)]
struct Styles {
    pass: Style,
    fail: Style,
    count: Style,
}

impl Styles {
    fn colorized() -> Self {
        Self {
            pass: Style::new().green().bold(),
            fail: Style::new().red().bold(),
            count: Style::new().bold(),
        }
    }
}

/// Writes lane events and the final summary in human-readable form.
#[derive(Clone, Debug)]
pub struct Reporter {
    styles: Styles,
}

impl Reporter {
    /// Creates a reporter; `colorize` enables ANSI styling.
    pub fn new(colorize: bool) -> Self {
        let styles = if colorize {
            Styles::colorized()
        } else {
            Styles::default()
        };
        Self { styles }
    }

    /// Writes one progress line for `event`.
    pub fn report_event(&self, event: &LaneEvent, mut writer: impl Write) -> io::Result<()> {
        match event {
            LaneEvent::RunStarted {
                lane_count,
                test_count,
            } => {
                writeln!(
                    writer,
                    "running {} {} across {} {}",
                    test_count.style(self.styles.count),
                    plural::tests_str(*test_count),
                    lane_count.style(self.styles.count),
                    plural::lanes_str(*lane_count),
                )
            }
            LaneEvent::AttemptStarted {
                simulator_name,
                test_count,
                retry_count,
                launch_retry_count,
            } => {
                if *retry_count == 0 && *launch_retry_count == 0 {
                    writeln!(
                        writer,
                        "[{simulator_name}] starting {} {}",
                        test_count.style(self.styles.count),
                        plural::tests_str(*test_count),
                    )
                } else {
                    writeln!(
                        writer,
                        "[{simulator_name}] retrying {} {} (retries {retry_count}, launch retries {launch_retry_count})",
                        test_count.style(self.styles.count),
                        plural::tests_str(*test_count),
                    )
                }
            }
            LaneEvent::AttemptFinished {
                simulator_name,
                status,
                failed_count,
                duration,
                will_retry,
            } => {
                let status_str = match status {
                    LaneStatus::Success => format!("{}", "passed".style(self.styles.pass)),
                    status => format!("{}", status.style(self.styles.fail)),
                };
                write!(
                    writer,
                    "[{simulator_name}] {status_str} in {}",
                    crate::helpers::display_duration(*duration),
                )?;
                if *failed_count > 0 {
                    write!(
                        writer,
                        ", {} {} failing",
                        failed_count.style(self.styles.fail),
                        plural::tests_str(*failed_count),
                    )?;
                }
                if *will_retry {
                    write!(writer, " (will retry)")?;
                }
                writeln!(writer)
            }
            LaneEvent::RunCancelled { reason } => match reason {
                CancelReason::RetryExhausted { simulator_name } => writeln!(
                    writer,
                    "{}: retry budget exhausted on {simulator_name}, cancelling remaining work",
                    "cancelled".style(self.styles.fail),
                ),
                CancelReason::Signal => writeln!(
                    writer,
                    "{}: shutdown signal received, cancelling remaining work",
                    "cancelled".style(self.styles.fail),
                ),
            },
            LaneEvent::RunFinished { stats } => self.write_summary(stats, writer),
        }
    }

    /// Writes the final de-duplicated, sorted pass/fail listing.
    pub fn write_summary(&self, stats: &RunStats, mut writer: impl Write) -> io::Result<()> {
        let failed = stats.failed();
        writeln!(writer, "------------------------------------------------")?;
        writeln!(
            writer,
            "{} {} run in {}: {} passed, {} failed",
            stats.attempted.len().style(self.styles.count),
            plural::tests_str(stats.attempted.len()),
            crate::helpers::display_duration(stats.duration),
            stats.passed.len().style(self.styles.pass),
            failed.len().style(self.styles.fail),
        )?;

        for (simulator_name, retries) in &stats.lane_retries {
            if retries.retry_count > 0 || retries.launch_retry_count > 0 {
                writeln!(
                    writer,
                    "  {simulator_name}: {} {}, {} launch {}",
                    retries.retry_count,
                    plural::retries_str(retries.retry_count),
                    retries.launch_retry_count,
                    plural::retries_str(retries.launch_retry_count),
                )?;
            }
        }

        for test in &stats.passed {
            writeln!(writer, "    {} {test}", "PASS".style(self.styles.pass))?;
        }
        for test in &failed {
            writeln!(writer, "    {} {test}", "FAIL".style(self.styles.fail))?;
        }

        if let Some(reason) = &stats.cancel_reason {
            let reason = match reason {
                CancelReason::RetryExhausted { simulator_name } => {
                    format!("retry budget exhausted on {simulator_name}")
                }
                CancelReason::Signal => "shutdown signal".to_owned(),
            };
            writeln!(
                writer,
                "run {}: {reason}; results above cover work completed before cancellation",
                "cancelled".style(self.styles.fail),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreeset;

    fn stats() -> RunStats {
        RunStats {
            attempted: btreeset! {
                TestId::new("LoginTests/testLogin"),
                TestId::new("LoginTests/testLogout"),
            },
            passed: btreeset! { TestId::new("LoginTests/testLogin") },
            ..RunStats::default()
        }
    }

    #[test]
    fn failed_is_attempted_minus_passed() {
        let stats = stats();
        assert_eq!(
            stats.failed(),
            btreeset! { TestId::new("LoginTests/testLogout") },
        );
        assert!(!stats.is_success());
    }

    #[test]
    fn pass_on_any_attempt_counts_as_passed() {
        let mut stats = stats();
        // The second attempt passes the remaining test.
        stats.passed.insert(TestId::new("LoginTests/testLogout"));
        assert!(stats.failed().is_empty());
        assert!(stats.is_success());
    }

    #[test]
    fn cancellation_forces_failure() {
        let mut stats = stats();
        stats.passed.insert(TestId::new("LoginTests/testLogout"));
        stats.cancel_reason = Some(CancelReason::Signal);
        assert!(!stats.is_success());
    }

    #[test]
    fn summary_lists_sorted_outcomes() {
        let reporter = Reporter::new(false);
        let mut out = Vec::new();
        reporter
            .write_summary(&stats(), &mut out)
            .expect("wrote summary");
        let out = String::from_utf8(out).expect("utf-8 output");
        assert!(out.contains("2 tests run"), "summary: {out}");
        assert!(out.contains("PASS LoginTests/testLogin"), "summary: {out}");
        assert!(out.contains("FAIL LoginTests/testLogout"), "summary: {out}");
    }
}
