// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolved run parameters.
//!
//! A [`TestRunConfig`] is assembled once by the CLI layer and is immutable
//! for the duration of a run.

use crate::{
    partition::PartitionSpec,
    simctl::{DeviceSpec, Simulator},
    test_command::TestTool,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;

/// Retry ceilings for a run.
///
/// Genuine test failures and infrastructure flakiness are budgeted
/// separately: conflating them would either burn retry budget on tests that
/// are actually broken when the real cause was a stuck simulator, or give up
/// too early on a flaky simulator that would succeed on a warm retry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryLimits {
    /// Ceiling on retries caused by actual test failures.
    pub retry_limit: usize,
    /// Ceiling on retries caused by launch timeouts, stalls, and abnormal
    /// termination.
    pub launch_retry_limit: usize,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            launch_retry_limit: 10,
        }
    }
}

/// Watchdog timeouts for a lane attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeoutConfig {
    /// Maximum time without any subprocess output before the attempt is
    /// presumed hung.
    pub test_timeout: Duration,
    /// Maximum time from subprocess launch to the test-suite-started marker
    /// appearing in the log.
    pub launch_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            test_timeout: Duration::from_secs(120),
            launch_timeout: Duration::from_secs(30),
        }
    }
}

/// The Xcode project or workspace the scheme lives in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProjectPath {
    /// An `.xcodeproj` path, passed as `-project`.
    Project(Utf8PathBuf),
    /// An `.xcworkspace` path, passed as `-workspace`.
    Workspace(Utf8PathBuf),
}

impl ProjectPath {
    /// The directory the project or workspace lives in, used as the working
    /// directory for build and test subprocesses.
    pub fn parent_dir(&self) -> &Utf8Path {
        let path = match self {
            Self::Project(path) | Self::Workspace(path) => path,
        };
        path.parent().unwrap_or(Utf8Path::new("."))
    }
}

/// Immutable, resolved parameters for one run.
#[derive(Clone, Debug)]
pub struct TestRunConfig {
    /// The scheme to build and test.
    pub scheme: String,
    /// Test target to restrict the inventory to, if any.
    pub target: Option<String>,
    /// The project or workspace path.
    pub project: ProjectPath,
    /// The device matrix: one entry per device family to test on.
    pub device_specs: Vec<DeviceSpec>,
    /// Simulator lanes per device family.
    pub simulator_count: usize,
    /// Which partition of the inventory this process owns.
    pub partition: PartitionSpec,
    /// Retry ceilings.
    pub retry_limits: RetryLimits,
    /// Watchdog timeouts.
    pub timeouts: TimeoutConfig,
    /// Seed for the per-lane anti-flake shuffle; `None` leaves lanes in
    /// sorted order.
    pub shuffle_seed: Option<u64>,
    /// Which external test tool generation to drive.
    pub tool: TestTool,
    /// Build output directory; derived data and logs live beneath it.
    pub build_dir: Utf8PathBuf,
}

impl TestRunConfig {
    /// The derived-data directory for build products.
    pub fn derived_data_dir(&self) -> Utf8PathBuf {
        self.build_dir.join("derivedData")
    }

    /// The directory holding per-lane logs and the inventory artifact.
    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.build_dir.join("logs")
    }

    /// The built-products directory handed to the test tool.
    pub fn product_dir(&self) -> Utf8PathBuf {
        self.derived_data_dir().join("output")
    }

    /// The path of the test inventory artifact written by the list pass.
    pub fn tests_json_path(&self) -> Utf8PathBuf {
        self.logs_dir().join("tests.json")
    }

    /// The log file for one lane attempt. The first attempt logs to
    /// `<udid>.log`; retries log to `<udid>-<retry_count>.log`.
    pub fn attempt_log_path(&self, simulator: &Simulator, retry_count: usize) -> Utf8PathBuf {
        let file = if retry_count == 0 {
            format!("{}.log", simulator.udid)
        } else {
            format!("{}-{}.log", simulator.udid, retry_count)
        };
        self.logs_dir().join(file)
    }

    /// Total number of lanes in this run.
    pub fn lane_count(&self) -> usize {
        self.device_specs.len() * self.simulator_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_command::TestTool;

    fn config() -> TestRunConfig {
        TestRunConfig {
            scheme: "App".to_owned(),
            target: None,
            project: ProjectPath::Project("ios/App.xcodeproj".into()),
            device_specs: vec!["iPhone 8, iOS 12.4".parse().expect("valid spec")],
            simulator_count: 2,
            partition: PartitionSpec::default(),
            retry_limits: RetryLimits::default(),
            timeouts: TimeoutConfig::default(),
            shuffle_seed: None,
            tool: TestTool::Xcodebuild,
            build_dir: "ios/build".into(),
        }
    }

    #[test]
    fn attempt_log_path_omits_zero_retry_suffix() {
        let config = config();
        let simulator = Simulator {
            name: "Parasim 1, iPhone 8, iOS 12.4".to_owned(),
            udid: "AAAA-BBBB".to_owned(),
        };
        assert_eq!(
            config.attempt_log_path(&simulator, 0),
            Utf8PathBuf::from("ios/build/logs/AAAA-BBBB.log"),
        );
        assert_eq!(
            config.attempt_log_path(&simulator, 2),
            Utf8PathBuf::from("ios/build/logs/AAAA-BBBB-2.log"),
        );
    }

    #[test]
    fn project_parent_dir() {
        let config = config();
        assert_eq!(config.project.parent_dir(), Utf8Path::new("ios"));
        assert_eq!(config.lane_count(), 2);
    }
}
