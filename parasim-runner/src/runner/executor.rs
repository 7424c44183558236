// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives one lane: subprocess execution, watchdogs, and outcome
//! classification.
//!
//! A lane task runs its initial attempt and then as many retry attempts as
//! the dispatcher grants, always on the same (wiped, not recreated)
//! simulator. While an attempt's subprocess runs, two watchdogs are armed:
//!
//! - the launch watchdog, which fires if the suite-started marker does not
//!   appear in the log within the launch timeout, and
//! - the heartbeat watchdog, which fires if the subprocess produces no
//!   output at all for the test timeout window. A deadline reset on every
//!   output chunk tolerates long-but-progressing runs while catching true
//!   stalls.
//!
//! Both watchdogs live inside the attempt's single select loop, so a timer
//! can never fire after the attempt has already reached a terminal state.

use super::{
    internal_events::{AttemptOutcome, ExecutorEvent, LaneAttempt, RetryDecision},
    launch_gate::{LaunchGate, LaunchPermit},
};
use crate::{
    config::{TestRunConfig, TimeoutConfig},
    helpers,
    inventory::TestId,
    reporter::LaneStatus,
    simctl::{SimctlClient, Simulator},
    test_command::{TestAction, TestCommand},
    test_output::ResultExtractor,
};
use camino::Utf8Path;
use std::{pin::pin, process::Stdio, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{broadcast, mpsc::UnboundedSender, oneshot},
    time::Instant,
};
use tracing::{debug, warn};

/// Cadence of the launch-marker check. The accumulated log is scanned on
/// this fixed low-frequency schedule rather than per output chunk.
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Shared context for all lane tasks of a run.
pub(super) struct ExecutorContext<'a> {
    config: &'a TestRunConfig,
    simctl: &'a SimctlClient,
    extractor: &'static dyn ResultExtractor,
    gate: Arc<LaunchGate>,
    cancel_tx: broadcast::Sender<()>,
}

impl<'a> ExecutorContext<'a> {
    pub(super) fn new(
        config: &'a TestRunConfig,
        simctl: &'a SimctlClient,
        extractor: &'static dyn ResultExtractor,
        gate: Arc<LaunchGate>,
        cancel_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            simctl,
            extractor,
            gate,
            cancel_tx,
        }
    }

    /// Runs one lane to completion: the initial attempt plus however many
    /// retries the dispatcher grants.
    pub(super) async fn run_lane(
        &self,
        lane_index: usize,
        simulator: Simulator,
        tests: Vec<TestId>,
        events_tx: UnboundedSender<ExecutorEvent>,
    ) {
        let mut cancel_rx = self.cancel_tx.subscribe();
        let mut attempt = LaneAttempt {
            lane_index,
            simulator,
            tests,
            retry_count: 0,
            launch_retry_count: 0,
        };

        loop {
            let permit = tokio::select! {
                permit = self.gate.admit() => permit,
                _ = cancel_rx.recv() => return,
            };

            let _ = events_tx.send(ExecutorEvent::AttemptStarted {
                simulator_name: attempt.simulator.name.clone(),
                test_count: attempt.tests.len(),
                retry_count: attempt.retry_count,
                launch_retry_count: attempt.launch_retry_count,
            });

            let Some(outcome) = self.execute_attempt(&attempt, permit, &mut cancel_rx).await
            else {
                // Cancelled mid-attempt.
                return;
            };

            let (decision_tx, decision_rx) = oneshot::channel();
            if events_tx
                .send(ExecutorEvent::AttemptFinished {
                    attempt: attempt.clone(),
                    outcome,
                    decision_tx,
                })
                .is_err()
            {
                return;
            }

            match decision_rx.await {
                Ok(RetryDecision::Retry {
                    tests,
                    retry_count,
                    launch_retry_count,
                }) => {
                    // Warm retry: clear app data and stray processes, keep
                    // the simulator.
                    if let Err(error) = self.simctl.reuse(&attempt.simulator).await {
                        warn!(
                            simulator = %attempt.simulator.name,
                            %error,
                            "failed to wipe simulator before retry",
                        );
                    }
                    attempt.tests = tests;
                    attempt.retry_count = retry_count;
                    attempt.launch_retry_count = launch_retry_count;
                }
                Ok(RetryDecision::Done | RetryDecision::Cancel) | Err(_) => return,
            }
        }
    }

    async fn execute_attempt(
        &self,
        attempt: &LaneAttempt,
        permit: LaunchPermit,
        cancel_rx: &mut broadcast::Receiver<()>,
    ) -> Option<AttemptOutcome> {
        let stopwatch = crate::time::stopwatch();
        let log_path = self
            .config
            .attempt_log_path(&attempt.simulator, attempt.retry_count);

        let command = TestCommand::new(
            self.config,
            TestAction::Test {
                simulator: &attempt.simulator,
                tests: &attempt.tests,
            },
        );
        debug!(
            simulator = %attempt.simulator.name,
            command = %command.command_line(),
            "launching lane attempt",
        );

        let drive = drive_child(
            command.into_command(),
            self.extractor,
            self.config.timeouts,
            permit,
            cancel_rx,
            &log_path,
        )
        .await?;

        let duration = stopwatch.snapshot().duration;
        Some(classify(attempt, self.extractor, &drive, duration))
    }
}

/// Raw observations from driving one subprocess to a terminal condition.
struct DriveOutput {
    log: String,
    timeout_status: Option<LaneStatus>,
    exit_status: Option<std::process::ExitStatus>,
    spawn_failed: bool,
}

/// Spawns `command` and pumps it until exit, a watchdog firing, or
/// cancellation. Returns `None` iff the run was cancelled.
async fn drive_child(
    mut command: Command,
    extractor: &dyn ResultExtractor,
    timeouts: TimeoutConfig,
    mut permit: LaunchPermit,
    cancel_rx: &mut broadcast::Receiver<()>,
    log_path: &Utf8Path,
) -> Option<DriveOutput> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            warn!(%error, "failed to spawn test subprocess");
            return Some(DriveOutput {
                log: String::new(),
                timeout_status: None,
                exit_status: None,
                spawn_failed: true,
            });
        }
    };

    let mut log_file = match tokio::fs::File::create(log_path).await {
        Ok(file) => Some(file),
        Err(error) => {
            warn!(%log_path, %error, "failed to create lane log file");
            None
        }
    };

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_done = false;
    let mut stderr_done = false;

    let mut log = String::new();
    let mut launched = false;
    let mut timeout_status = None;
    let mut exit_status = None;

    let mut heartbeat = pin!(tokio::time::sleep(timeouts.test_timeout));
    let mut launch_deadline = pin!(tokio::time::sleep(timeouts.launch_timeout));
    let mut launch_poll = tokio::time::interval(LAUNCH_POLL_INTERVAL);

    loop {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        append_line(&mut log, &mut log_file, &line).await;
                        heartbeat.as_mut().reset(Instant::now() + timeouts.test_timeout);
                    }
                    Ok(None) | Err(_) => stdout_done = true,
                }
            }
            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        append_line(&mut log, &mut log_file, &line).await;
                        heartbeat.as_mut().reset(Instant::now() + timeouts.test_timeout);
                    }
                    Ok(None) | Err(_) => stderr_done = true,
                }
            }
            status = child.wait(), if stdout_done && stderr_done => {
                match status {
                    Ok(status) => {
                        debug!(
                            status = %helpers::display_exit_status(status),
                            "test subprocess exited",
                        );
                        exit_status = Some(status);
                    }
                    Err(error) => warn!(%error, "failed to await test subprocess"),
                }
                break;
            }
            _ = launch_poll.tick(), if !launched => {
                if extractor.suite_started(&log) {
                    launched = true;
                    // Unblocks the next queued lane's cold launch.
                    permit.mark_launched();
                }
            }
            _ = &mut launch_deadline, if !launched => {
                timeout_status = Some(LaneStatus::LaunchTimeout);
                break;
            }
            _ = &mut heartbeat => {
                timeout_status = Some(LaneStatus::TestTimeout);
                break;
            }
            _ = cancel_rx.recv() => {
                terminate(&child);
                return None;
            }
        }
    }

    if timeout_status.is_some() {
        // The subprocess is abandoned with a best-effort terminate; a child
        // that ignores it may run on in the background.
        terminate(&child);
    }

    if let Some(file) = log_file.as_mut() {
        let _ = file.flush().await;
    }

    Some(DriveOutput {
        log,
        timeout_status,
        exit_status,
        spawn_failed: false,
    })
}

async fn append_line(log: &mut String, log_file: &mut Option<tokio::fs::File>, line: &str) {
    log.push_str(line);
    log.push('\n');
    if let Some(file) = log_file {
        if file.write_all(line.as_bytes()).await.is_err() || file.write_all(b"\n").await.is_err() {
            *log_file = None;
        }
    }
}

/// Computes the attempt's terminal status from log evidence. The raw exit
/// code is informative but never trusted on its own: a pass record for
/// every requested test is required for success, and a watchdog firing or
/// signal-kill forces a non-success status even on exit code 0.
fn classify(
    attempt: &LaneAttempt,
    extractor: &dyn ResultExtractor,
    drive: &DriveOutput,
    duration: Duration,
) -> AttemptOutcome {
    let passed = extractor.passed_tests(&drive.log, &attempt.tests);
    let failed: Vec<TestId> = attempt
        .tests
        .iter()
        .filter(|test| !passed.contains(test))
        .cloned()
        .collect();

    let status = if let Some(status) = drive.timeout_status {
        status
    } else if drive.spawn_failed {
        LaneStatus::TerminatedAbnormally
    } else if drive.exit_status.is_some_and(helpers::killed_by_signal) {
        LaneStatus::TerminatedAbnormally
    } else if !failed.is_empty() {
        LaneStatus::Failed
    } else {
        LaneStatus::Success
    };

    AttemptOutcome {
        status,
        passed,
        failed,
        duration,
    }
}

/// Best-effort terminate; escalation to a force-kill is deliberately not
/// attempted.
fn terminate(child: &Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::{
            sys::signal::{Signal, kill},
            unistd::Pid,
        };
        if let Err(error) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, %error, "failed to terminate test subprocess");
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_output::XcodebuildLogParser;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;

    const SUITE_STARTED: &str = "Test Suite 'App.xctest' started at 2019-03-02";

    fn pass_line(class: &str, method: &str) -> String {
        format!("Test Case '-[App.{class} {method}]' passed (0.01 seconds).")
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        command
    }

    fn attempt(tests: &[&str]) -> LaneAttempt {
        LaneAttempt {
            lane_index: 0,
            simulator: Simulator {
                name: "Parasim 1, iPhone 8, iOS 12.4".to_owned(),
                udid: "AAAA-BBBB".to_owned(),
            },
            tests: tests.iter().map(TestId::new).collect(),
            retry_count: 0,
            launch_retry_count: 0,
        }
    }

    fn timeouts(test_ms: u64, launch_ms: u64) -> TimeoutConfig {
        TimeoutConfig {
            test_timeout: Duration::from_millis(test_ms),
            launch_timeout: Duration::from_millis(launch_ms),
        }
    }

    async fn drive(script: &str, timeouts: TimeoutConfig) -> (DriveOutput, LaneAttempt) {
        drive_with_tests(script, timeouts, &["LoginTests/testLogin", "LoginTests/testLogout"])
            .await
    }

    async fn drive_with_tests(
        script: &str,
        timeouts: TimeoutConfig,
        tests: &[&str],
    ) -> (DriveOutput, LaneAttempt) {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let log_path = dir.path().join("lane.log");
        let gate = LaunchGate::new();
        let permit = gate.admit().await;
        let (_cancel_tx, mut cancel_rx) = broadcast::channel(1);

        let drive = drive_child(
            sh(script),
            &XcodebuildLogParser,
            timeouts,
            permit,
            &mut cancel_rx,
            &log_path,
        )
        .await
        .expect("not cancelled");
        (drive, attempt(tests))
    }

    #[tokio::test]
    async fn all_passes_and_clean_exit_is_success() {
        let script = format!(
            "echo \"{SUITE_STARTED}\"; echo \"{}\"; echo \"{}\"",
            pass_line("LoginTests", "testLogin"),
            pass_line("LoginTests", "testLogout"),
        );
        let (drive, attempt) = drive(&script, timeouts(5_000, 5_000)).await;
        let outcome = classify(&attempt, &XcodebuildLogParser, &drive, Duration::ZERO);

        assert_eq!(outcome.status, LaneStatus::Success);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.passed.len(), 2);
    }

    #[tokio::test]
    async fn exit_zero_without_pass_records_is_failure() {
        // The harness exiting 0 is not believed without per-test evidence.
        let script = format!(
            "echo \"{SUITE_STARTED}\"; echo \"{}\"; exit 0",
            pass_line("LoginTests", "testLogin"),
        );
        let (drive, attempt) = drive(&script, timeouts(5_000, 5_000)).await;
        let outcome = classify(&attempt, &XcodebuildLogParser, &drive, Duration::ZERO);

        assert_eq!(outcome.status, LaneStatus::Failed);
        assert_eq!(outcome.failed, vec![TestId::new("LoginTests/testLogout")]);
    }

    #[tokio::test]
    async fn nonzero_exit_with_all_passes_is_success() {
        let script = format!(
            "echo \"{SUITE_STARTED}\"; echo \"{}\"; echo \"{}\"; exit 65",
            pass_line("LoginTests", "testLogin"),
            pass_line("LoginTests", "testLogout"),
        );
        let (drive, attempt) = drive(&script, timeouts(5_000, 5_000)).await;
        let outcome = classify(&attempt, &XcodebuildLogParser, &drive, Duration::ZERO);

        assert_eq!(outcome.status, LaneStatus::Success);
    }

    #[tokio::test]
    async fn silence_past_the_heartbeat_window_is_a_stall() {
        let script = format!("echo \"{SUITE_STARTED}\"; sleep 20");
        let start = std::time::Instant::now();
        let (drive, attempt) = drive(&script, timeouts(300, 5_000)).await;
        let outcome = classify(&attempt, &XcodebuildLogParser, &drive, Duration::ZERO);

        assert_eq!(outcome.status, LaneStatus::TestTimeout);
        assert_eq!(outcome.failed.len(), 2);
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "watchdog fired well before the child would have exited",
        );
    }

    #[tokio::test]
    async fn missing_suite_marker_is_a_launch_timeout() {
        let (drive, attempt) = drive("sleep 20", timeouts(60_000, 200)).await;
        let outcome = classify(&attempt, &XcodebuildLogParser, &drive, Duration::ZERO);

        assert_eq!(outcome.status, LaneStatus::LaunchTimeout);
    }

    #[tokio::test]
    async fn signal_killed_child_is_abnormal_termination() {
        let script = format!(
            "echo \"{SUITE_STARTED}\"; echo \"{}\"; kill -9 $$",
            pass_line("LoginTests", "testLogin"),
        );
        let (drive, attempt) = drive(&script, timeouts(5_000, 5_000)).await;
        let outcome = classify(&attempt, &XcodebuildLogParser, &drive, Duration::ZERO);

        assert_eq!(outcome.status, LaneStatus::TerminatedAbnormally);
        assert_eq!(outcome.failed, vec![TestId::new("LoginTests/testLogout")]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_attempt() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let log_path = dir.path().join("lane.log");
        let gate = LaunchGate::new();
        let permit = gate.admit().await;
        let (cancel_tx, mut cancel_rx) = broadcast::channel(1);

        let start = std::time::Instant::now();
        let drive_fut = drive_child(
            sh("sleep 20"),
            &XcodebuildLogParser,
            timeouts(60_000, 60_000),
            permit,
            &mut cancel_rx,
            &log_path,
        );
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = cancel_tx.send(());
        });

        assert!(drive_fut.await.is_none(), "cancelled attempt yields None");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn spawn_failure_is_abnormal_termination() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let log_path = dir.path().join("lane.log");
        let gate = LaunchGate::new();
        let permit = gate.admit().await;
        let (_cancel_tx, mut cancel_rx) = broadcast::channel(1);

        let drive = drive_child(
            Command::new("/nonexistent/parasim-test-binary"),
            &XcodebuildLogParser,
            timeouts(1_000, 1_000),
            permit,
            &mut cancel_rx,
            &log_path,
        )
        .await
        .expect("not cancelled");
        let attempt = attempt(&["LoginTests/testLogin"]);
        let outcome = classify(&attempt, &XcodebuildLogParser, &drive, Duration::ZERO);

        assert_eq!(outcome.status, LaneStatus::TerminatedAbnormally);
    }
}
