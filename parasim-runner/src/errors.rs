// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by parasim.

use camino::Utf8PathBuf;
use std::{borrow::Cow, fmt};
use thiserror::Error;

/// An error that occurs while parsing a
/// [`PartitionSpec`](crate::partition::PartitionSpec) input.
#[derive(Clone, Debug, Error)]
pub struct PartitionSpecParseError {
    expected_format: Option<&'static str>,
    message: Cow<'static, str>,
}

impl PartitionSpecParseError {
    pub(crate) fn new(
        expected_format: Option<&'static str>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            expected_format,
            message: message.into(),
        }
    }
}

impl fmt::Display for PartitionSpecParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.expected_format {
            Some(format) => {
                write!(
                    f,
                    "partition must be in the format \"{}\":\n{}",
                    format, self.message
                )
            }
            None => write!(f, "{}", self.message),
        }
    }
}

/// An error that occurs while parsing a device matrix entry such as
/// `"iPhone 8, iOS 12.4"`.
#[derive(Clone, Debug, Error)]
#[error("invalid device spec '{input}': expected \"<device type>, <os version>\"")]
pub struct DeviceSpecParseError {
    input: String,
}

impl DeviceSpecParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurs while parsing a
/// [`TestTool`](crate::test_command::TestTool) value from a string.
#[derive(Clone, Debug, Error)]
#[error(
    "unrecognized test tool: {input}\n(known values: {})",
    crate::test_command::TestTool::variants().join(", "),
)]
pub struct TestToolParseError {
    input: String,
}

impl TestToolParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurs while loading the test inventory artifact.
///
/// The artifact may be written asynchronously by a concurrently-running list
/// pass, so reads are retried with backoff; `Unavailable` is returned once
/// the retry budget is exhausted.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The inventory file could not be read.
    #[error("failed to read test inventory at `{path}`")]
    Read {
        /// The path to the inventory artifact.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The inventory file was not valid JSON.
    #[error("failed to parse test inventory at `{path}`")]
    Parse {
        /// The path to the inventory artifact.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The inventory stayed missing or empty for every reload attempt.
    #[error("test inventory at `{path}` missing or empty after {attempts} attempts")]
    Unavailable {
        /// The path to the inventory artifact.
        path: Utf8PathBuf,
        /// The number of reload attempts made.
        attempts: usize,
    },
}

/// An error that occurs while driving `xcrun simctl`.
#[derive(Debug, Error)]
pub enum SimctlError {
    /// A simctl invocation could not be spawned or awaited.
    #[error("failed to execute `{command}`")]
    Exec {
        /// The rendered command line.
        command: String,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A simctl invocation exited with a failure status.
    #[error("`{command}` failed with {status}: {stderr}")]
    CommandFailed {
        /// The rendered command line.
        command: String,
        /// The exit status.
        status: std::process::ExitStatus,
        /// Captured standard error.
        stderr: String,
    },

    /// `simctl list -j` produced output that could not be deserialized.
    #[error("failed to parse `simctl list -j` output")]
    ListParse(#[source] serde_json::Error),

    /// A configured device type is not known to this host's simctl.
    #[error("unknown simulator device type: {name}")]
    UnknownDeviceType {
        /// The device type name as configured.
        name: String,
    },

    /// A configured OS version has no matching simctl runtime.
    #[error("unknown simulator runtime: {name}")]
    UnknownRuntime {
        /// The runtime name as configured.
        name: String,
    },
}

/// An error that occurs while running the one-shot build or list-tests pass.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The build subprocess could not be spawned or awaited.
    #[error("failed to execute `{command}`")]
    Exec {
        /// The rendered command line.
        command: String,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The build subprocess exited with a failure status.
    #[error("build failed with {status}; log tail:\n{log_tail}")]
    Failed {
        /// The exit status.
        status: std::process::ExitStatus,
        /// The last portion of the captured build log.
        log_tail: String,
    },

    /// A build directory could not be prepared.
    #[error("failed to prepare directory `{path}`")]
    PrepareDir {
        /// The directory being created or cleared.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurs while setting up a test runner.
#[derive(Debug, Error)]
pub enum RunnerBuildError {
    /// The tokio runtime could not be created.
    #[error("error creating tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// The signal handler could not be installed.
    #[error("error setting up signal handler")]
    SignalHandlerSetup(#[from] SignalHandlerSetupError),

    /// The per-lane log directory could not be created.
    #[error("failed to create log directory `{path}`")]
    CreateLogDir {
        /// The log directory path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurs while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// An error that occurs while executing a test run.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// Simulator provisioning failed before any lane could start.
    #[error("failed to provision simulators")]
    Provision(#[source] SimctlError),

    /// No usable simulator lane could be created.
    #[error("no simulator lanes available for the configured device matrix")]
    NoLanes,

    /// One or more lane tasks panicked.
    #[error("{} lane task(s) panicked", .0.len())]
    LaneJoin(Vec<tokio::task::JoinError>),
}
