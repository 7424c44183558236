// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::ExpectedError,
    output::{OutputContext, OutputOpts},
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use parasim_runner::{
    config::{ProjectPath, RetryLimits, TestRunConfig, TimeoutConfig},
    inventory::TestInventory,
    partition::{PartitionPlan, PartitionSpec},
    reporter::Reporter,
    runner::TestRunnerBuilder,
    simctl::parse_device_matrix,
    test_build::TestBuild,
    test_command::TestTool,
};
use std::{future::Future, time::Duration};

/// Parallel iOS simulator test runner.
///
/// Builds a test bundle once, partitions the full test list across N
/// simulator lanes, runs each lane with hung-run detection and
/// failed-subset retries, and reports a consolidated verdict.
#[derive(Debug, Parser)]
#[command(version, bin_name = "parasim")]
pub struct ParasimApp {
    #[command(flatten)]
    output: OutputOpts,

    #[command(subcommand)]
    command: Command,
}

impl ParasimApp {
    /// Executes the app, returning the process exit code.
    pub fn exec(self) -> Result<i32, ExpectedError> {
        let output = self.output.init();
        self.command.exec(output)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the scheme for testing and refresh the test inventory
    Build {
        #[command(flatten)]
        app_opts: AppOpts,
    },
    /// List this partition's tests, lane by lane
    List {
        #[command(flatten)]
        app_opts: AppOpts,

        /// Use the existing build and inventory artifact
        #[arg(long)]
        no_build: bool,
    },
    /// Build, then run tests across simulator lanes
    Run {
        #[command(flatten)]
        app_opts: AppOpts,

        /// Use the existing build and inventory artifact
        #[arg(long)]
        no_build: bool,
    },
}

impl Command {
    fn exec(self, output: OutputContext) -> Result<i32, ExpectedError> {
        match self {
            Self::Build { app_opts } => {
                let config = app_opts.into_config()?;
                block_on(async {
                    let build = TestBuild::new(&config);
                    build.build().await?;
                    build.list_tests().await?;
                    Ok(())
                })?;
                Ok(0)
            }
            Self::List { app_opts, no_build } => {
                let config = app_opts.into_config()?;
                let inventory = load_inventory(&config, no_build)?;
                let plan =
                    PartitionPlan::new(&inventory, config.partition.count(), config.simulator_count);

                println!(
                    "partition {}: {} tests",
                    config.partition,
                    plan.lanes(config.partition)
                        .iter()
                        .map(Vec::len)
                        .sum::<usize>(),
                );
                for (index, lane) in plan.lanes(config.partition).iter().enumerate() {
                    println!("lane {index} ({} tests):", lane.len());
                    for test in lane {
                        println!("    {test}");
                    }
                }
                Ok(0)
            }
            Self::Run { app_opts, no_build } => {
                let config = app_opts.into_config()?;
                let inventory = load_inventory(&config, no_build)?;
                let plan =
                    PartitionPlan::new(&inventory, config.partition.count(), config.simulator_count);

                let runner = TestRunnerBuilder::new().build(&config, &plan)?;
                let reporter =
                    Reporter::new(output.color.should_colorize(std::io::stdout()));
                let stats = runner.execute(|event| {
                    let _ = reporter.report_event(&event, std::io::stdout().lock());
                })?;

                if stats.is_success() {
                    Ok(0)
                } else {
                    Err(ExpectedError::TestRunFailed)
                }
            }
        }
    }
}

/// Runs the build/list passes if requested, then loads the inventory
/// artifact. The artifact may still be mid-write by a concurrent list pass,
/// so loading retries up to the test-retry limit.
fn load_inventory(config: &TestRunConfig, no_build: bool) -> Result<TestInventory, ExpectedError> {
    block_on(async {
        if !no_build {
            let build = TestBuild::new(config);
            build.build().await?;
            build.list_tests().await?;
        }
        let inventory = TestInventory::load(
            &config.tests_json_path(),
            config.target.as_deref(),
            config.retry_limits.retry_limit,
        )
        .await?;
        Ok(inventory)
    })
}

fn block_on<T>(future: impl Future<Output = Result<T, ExpectedError>>) -> Result<T, ExpectedError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ExpectedError::RuntimeCreate)?;
    runtime.block_on(future)
}

#[derive(Debug, Args)]
struct AppOpts {
    /// Scheme to build and test
    #[arg(long, value_name = "SCHEME")]
    scheme: String,

    /// Path to the .xcodeproj
    #[arg(
        long,
        value_name = "PATH",
        required_unless_present = "workspace",
        conflicts_with = "workspace"
    )]
    project: Option<Utf8PathBuf>,

    /// Path to the .xcworkspace
    #[arg(long, value_name = "PATH")]
    workspace: Option<Utf8PathBuf>,

    /// Test target to restrict the inventory to
    #[arg(long, value_name = "TARGET")]
    target: Option<String>,

    /// Device matrix: `;`-separated "<device type>, <os>" entries
    #[arg(
        long,
        value_name = "MATRIX",
        default_value = "iPhone 8, iOS 12.4",
        help_heading = "LANE OPTIONS"
    )]
    devices: String,

    /// Simulator lanes per device family
    #[arg(
        long,
        value_name = "N",
        default_value_t = 1,
        help_heading = "LANE OPTIONS"
    )]
    simulators: usize,

    /// Partition owned by this process, as "I/N" (0-based)
    #[arg(
        long,
        value_name = "I/N",
        default_value = "0/1",
        help_heading = "LANE OPTIONS"
    )]
    partition: PartitionSpec,

    /// Shuffle each lane's test order with this seed
    #[arg(long, value_name = "SEED", help_heading = "LANE OPTIONS")]
    shuffle_seed: Option<u64>,

    /// Retry budget for genuine test failures
    #[arg(
        long,
        value_name = "N",
        default_value_t = 5,
        help_heading = "RETRY OPTIONS"
    )]
    retry_limit: usize,

    /// Retry budget for simulator/launch flakiness
    #[arg(
        long,
        value_name = "N",
        default_value_t = 10,
        help_heading = "RETRY OPTIONS"
    )]
    launch_retry_limit: usize,

    /// Fail an attempt after this long with no subprocess output
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "120s",
        value_parser = humantime::parse_duration,
        help_heading = "RETRY OPTIONS"
    )]
    test_timeout: Duration,

    /// Fail an attempt whose suite has not started after this long
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "30s",
        value_parser = humantime::parse_duration,
        help_heading = "RETRY OPTIONS"
    )]
    launch_timeout: Duration,

    /// External test tool generation to drive
    #[arg(long, value_name = "TOOL", default_value = "xcodebuild")]
    tool: TestTool,

    /// Build output directory [default: <project dir>/build]
    #[arg(long, value_name = "DIR")]
    build_dir: Option<Utf8PathBuf>,
}

impl AppOpts {
    fn into_config(self) -> Result<TestRunConfig, ExpectedError> {
        let project = match (self.project, self.workspace) {
            (Some(path), None) => ProjectPath::Project(path),
            (None, Some(path)) => ProjectPath::Workspace(path),
            _ => unreachable!("clap enforces exactly one of --project/--workspace"),
        };
        let device_specs = parse_device_matrix(&self.devices)?;
        let build_dir = self
            .build_dir
            .unwrap_or_else(|| project.parent_dir().join("build"));

        Ok(TestRunConfig {
            scheme: self.scheme,
            target: self.target,
            project,
            device_specs,
            simulator_count: self.simulators,
            partition: self.partition,
            retry_limits: RetryLimits {
                retry_limit: self.retry_limit,
                launch_retry_limit: self.launch_retry_limit,
            },
            timeouts: TimeoutConfig {
                test_timeout: self.test_timeout,
                launch_timeout: self.launch_timeout,
            },
            shuffle_seed: self.shuffle_seed,
            tool: self.tool,
            build_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        ParasimApp::command().debug_assert();
    }

    #[test]
    fn partition_and_matrix_flags_resolve() {
        let app = ParasimApp::try_parse_from([
            "parasim",
            "run",
            "--scheme",
            "App",
            "--project",
            "ios/App.xcodeproj",
            "--devices",
            "iPhone 8, iOS 12.4; iPad Air 2, iOS 12.4",
            "--simulators",
            "2",
            "--partition",
            "1/4",
        ])
        .expect("valid arguments");
        let Command::Run { app_opts, .. } = app.command else {
            panic!("expected run subcommand");
        };
        let config = app_opts.into_config().expect("valid config");

        assert_eq!(config.partition.index(), 1);
        assert_eq!(config.partition.count(), 4);
        assert_eq!(config.device_specs.len(), 2);
        assert_eq!(config.lane_count(), 4);
        assert_eq!(config.build_dir, Utf8PathBuf::from("ios/build"));
    }

    #[test]
    fn out_of_range_partition_is_rejected() {
        ParasimApp::try_parse_from([
            "parasim",
            "run",
            "--scheme",
            "App",
            "--project",
            "ios/App.xcodeproj",
            "--partition",
            "4/4",
        ])
        .expect_err("partition index must be below count");
    }
}
