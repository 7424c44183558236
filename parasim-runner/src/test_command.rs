// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Construction of build/list/test subprocess invocations.
//!
//! Successive generations of the external tooling (xcodebuild,
//! xctool) expose the same capability set: launch, stream output, wait,
//! terminate, exit status. One builder covers all of them, parameterized by
//! a [`TestTool`] strategy value rather than by inheritance.

use crate::{
    config::{ProjectPath, TestRunConfig},
    errors::TestToolParseError,
    inventory::TestId,
    simctl::Simulator,
};
use itertools::Itertools;
use std::{process::Stdio, str::FromStr};
use tokio::process::Command;

/// Which external test tool generation to drive.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TestTool {
    /// Apple's `xcodebuild`, with text log markers as test evidence.
    #[default]
    Xcodebuild,
    /// Facebook's `xctool`, with a line-oriented JSON event stream.
    Xctool,
}

impl TestTool {
    /// Returns the string values accepted by [`FromStr`].
    pub fn variants() -> [&'static str; 2] {
        ["xcodebuild", "xctool"]
    }
}

impl FromStr for TestTool {
    type Err = TestToolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xcodebuild" => Ok(Self::Xcodebuild),
            "xctool" => Ok(Self::Xctool),
            other => Err(TestToolParseError::new(other)),
        }
    }
}

/// The one-shot or per-lane action a [`TestCommand`] performs.
#[derive(Clone, Copy, Debug)]
pub enum TestAction<'a> {
    /// Build the scheme for testing, without running anything.
    BuildForTesting,
    /// Produce the flat test inventory without running tests.
    ///
    /// With xcodebuild the test host writes the artifact itself (signalled
    /// via the `LIST_TESTS` environment variable); with xctool the caller
    /// parses the JSON event stream from stdout.
    ListTests,
    /// Run an explicit subset of tests on one simulator.
    Test {
        /// The lane's simulator.
        simulator: &'a Simulator,
        /// The tests to run, in dispatch order.
        tests: &'a [TestId],
    },
}

/// A fully-rendered subprocess invocation.
pub struct TestCommand {
    command: Command,
    command_line: String,
}

impl TestCommand {
    /// Builds the invocation for `action` under `config`.
    pub fn new(config: &TestRunConfig, action: TestAction<'_>) -> Self {
        let mut args: Vec<String> = Vec::new();

        match config.project {
            ProjectPath::Project(ref path) => {
                args.extend(["-project".to_owned(), path.to_string()]);
            }
            ProjectPath::Workspace(ref path) => {
                args.extend(["-workspace".to_owned(), path.to_string()]);
            }
        }
        args.extend([
            "-scheme".to_owned(),
            config.scheme.clone(),
            "-sdk".to_owned(),
            "iphonesimulator".to_owned(),
            "-derivedDataPath".to_owned(),
            config.derived_data_dir().to_string(),
            format!("CONFIGURATION_BUILD_DIR={}", config.product_dir()),
        ]);

        match config.tool {
            TestTool::Xcodebuild => Self::xcodebuild_args(config, action, &mut args),
            TestTool::Xctool => Self::xctool_args(config, action, &mut args),
        }

        let program = match config.tool {
            TestTool::Xcodebuild => "xcodebuild",
            TestTool::Xctool => "xctool",
        };

        let mut rendered = vec![program.to_owned()];
        rendered.extend(args.iter().cloned());
        let command_line = shell_words::join(&rendered);

        let mut command = match config.tool {
            TestTool::Xcodebuild => {
                let mut command = Command::new("xcrun");
                command.arg("xcodebuild");
                command
            }
            TestTool::Xctool => Command::new("xctool"),
        };
        command
            .args(&args)
            .current_dir(config.project.parent_dir())
            .stdin(Stdio::null());

        if matches!(
            (config.tool, action),
            (TestTool::Xcodebuild, TestAction::ListTests)
        ) {
            command.env("LIST_TESTS", config.tests_json_path());
        }

        Self {
            command,
            command_line,
        }
    }

    fn xcodebuild_args(config: &TestRunConfig, action: TestAction<'_>, args: &mut Vec<String>) {
        match action {
            TestAction::BuildForTesting => {
                args.extend(["clean".to_owned(), "build-for-testing".to_owned()]);
            }
            TestAction::ListTests => {
                // The test host observes LIST_TESTS, dumps the inventory, and
                // exits without running anything.
                args.push("test".to_owned());
                if let Some(spec) = config.device_specs.first() {
                    args.extend([
                        "-destination".to_owned(),
                        format!(
                            "platform=iOS Simulator,name={},OS={}",
                            spec.device_type,
                            spec.os_number()
                        ),
                    ]);
                }
            }
            TestAction::Test { simulator, tests } => {
                args.extend([
                    "test-without-building".to_owned(),
                    "-destination".to_owned(),
                    format!("id={}", simulator.udid),
                ]);
                for test in tests {
                    match &config.target {
                        Some(target) => args.push(format!("-only-testing:{target}/{test}")),
                        None => args.push(format!("-only-testing:{test}")),
                    }
                }
            }
        }
    }

    fn xctool_args(config: &TestRunConfig, action: TestAction<'_>, args: &mut Vec<String>) {
        match action {
            TestAction::BuildForTesting => args.push("build-tests".to_owned()),
            TestAction::ListTests => {
                args.extend([
                    "run-tests".to_owned(),
                    "-listTestsOnly".to_owned(),
                    "-reporter".to_owned(),
                    "json-stream".to_owned(),
                ]);
                if let Some(target) = &config.target {
                    args.extend(["-only".to_owned(), target.clone()]);
                }
            }
            TestAction::Test { simulator, tests } => {
                args.extend([
                    "run-tests".to_owned(),
                    "-destination".to_owned(),
                    format!("id={}", simulator.udid),
                    "-newSimulatorInstance".to_owned(),
                ]);
                if let Some(target) = &config.target {
                    let joined = tests.iter().map(TestId::as_str).join(",");
                    args.extend(["-only".to_owned(), format!("{target}:{joined}")]);
                }
                // The JSON event stream on stdout is both the heartbeat
                // source and the post-hoc test evidence.
                args.extend(["-reporter".to_owned(), "json-stream".to_owned()]);
            }
        }
    }

    /// The rendered command line, for logging.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Consumes the builder, returning the underlying command for spawning.
    /// Stdout/stderr configuration is left to the caller.
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RetryLimits, TimeoutConfig},
        partition::PartitionSpec,
    };

    fn config(tool: TestTool, target: Option<&str>) -> TestRunConfig {
        TestRunConfig {
            scheme: "App".to_owned(),
            target: target.map(str::to_owned),
            project: ProjectPath::Workspace("ios/App.xcworkspace".into()),
            device_specs: vec!["iPhone 8, iOS 12.4".parse().expect("valid spec")],
            simulator_count: 1,
            partition: PartitionSpec::default(),
            retry_limits: RetryLimits::default(),
            timeouts: TimeoutConfig::default(),
            shuffle_seed: None,
            tool,
            build_dir: "ios/build".into(),
        }
    }

    fn simulator() -> Simulator {
        Simulator {
            name: "Parasim 1, iPhone 8, iOS 12.4".to_owned(),
            udid: "AAAA-BBBB".to_owned(),
        }
    }

    #[test]
    fn xcodebuild_test_invocation() {
        let config = config(TestTool::Xcodebuild, Some("AppTests"));
        let simulator = simulator();
        let tests = vec![TestId::new("LoginTests/testLogin")];
        let command = TestCommand::new(
            &config,
            TestAction::Test {
                simulator: &simulator,
                tests: &tests,
            },
        );
        let line = command.command_line();
        assert!(line.starts_with("xcodebuild "), "line: {line}");
        assert!(line.contains("test-without-building"), "line: {line}");
        assert!(line.contains("id=AAAA-BBBB"), "line: {line}");
        assert!(
            line.contains("-only-testing:AppTests/LoginTests/testLogin"),
            "line: {line}",
        );
    }

    #[test]
    fn xctool_test_invocation_joins_tests() {
        let config = config(TestTool::Xctool, Some("AppTests"));
        let simulator = simulator();
        let tests = vec![
            TestId::new("LoginTests/testLogin"),
            TestId::new("LoginTests/testLogout"),
        ];
        let command = TestCommand::new(
            &config,
            TestAction::Test {
                simulator: &simulator,
                tests: &tests,
            },
        );
        let line = command.command_line();
        assert!(line.starts_with("xctool "), "line: {line}");
        assert!(
            line.contains("AppTests:LoginTests/testLogin,LoginTests/testLogout"),
            "line: {line}",
        );
        assert!(line.contains("json-stream"), "line: {line}");
    }

    #[test]
    fn test_tool_from_str() {
        assert_eq!(
            "xcodebuild".parse::<TestTool>().expect("valid tool"),
            TestTool::Xcodebuild,
        );
        assert_eq!(
            "xctool".parse::<TestTool>().expect("valid tool"),
            TestTool::Xctool,
        );
        "bluepill".parse::<TestTool>().expect_err("unknown tool");
    }
}
