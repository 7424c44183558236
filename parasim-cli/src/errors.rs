// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use parasim_runner::errors::{
    BuildError, DeviceSpecParseError, ExecuteError, InventoryError, RunnerBuildError,
};
use thiserror::Error;

/// An error which occurred during the course of expected operation: it is
/// reported to the user as a diagnostic plus an exit code rather than as a
/// panic or backtrace.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExpectedError {
    /// The device matrix flag could not be parsed.
    #[error("invalid device matrix")]
    DeviceMatrixParse(#[from] DeviceSpecParseError),

    /// The tokio runtime for the build phase could not be created.
    #[error("error creating tokio runtime")]
    RuntimeCreate(#[source] std::io::Error),

    /// The build or list pass failed.
    #[error("building tests failed")]
    Build(#[from] BuildError),

    /// The test inventory could not be loaded.
    #[error("unable to load list of tests")]
    Inventory(#[from] InventoryError),

    /// The runner could not be constructed.
    #[error("failed to set up test runner")]
    RunnerBuild(#[from] RunnerBuildError),

    /// The run aborted before producing a verdict.
    #[error("test run aborted")]
    Execute(#[from] ExecuteError),

    /// The run completed with residual test failures or a cancellation.
    #[error("one or more tests failed")]
    TestRunFailed,
}

impl ExpectedError {
    /// The exit code for this error. Configuration errors exit 2; every
    /// runtime failure, including residual test failures, exits 1.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::DeviceMatrixParse(_) => 2,
            Self::RuntimeCreate(_)
            | Self::Build(_)
            | Self::Inventory(_)
            | Self::RunnerBuild(_)
            | Self::Execute(_)
            | Self::TestRunFailed => 1,
        }
    }

    /// Writes the error and its source chain to standard error.
    pub fn display_to_stderr(&self) {
        eprintln!("error: {self}");
        let mut source = std::error::Error::source(self);
        while let Some(error) = source {
            eprintln!("  caused by: {error}");
            source = error.source();
        }
    }
}
