// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The one-shot build-for-testing and list-tests passes.
//!
//! Both run to completion before any lane is dispatched: the test bundle is
//! built exactly once, and the inventory artifact the partitioner reads is
//! produced by a dedicated list pass.

use crate::{
    config::TestRunConfig,
    errors::BuildError,
    test_command::{TestAction, TestCommand, TestTool},
    test_output,
};
use camino::Utf8Path;
use tracing::info;

/// How much of the captured log to embed in a build failure.
const LOG_TAIL_BYTES: usize = 4096;

/// Drives the one-shot build and list passes for a run.
#[derive(Debug)]
pub struct TestBuild<'cfg> {
    config: &'cfg TestRunConfig,
}

impl<'cfg> TestBuild<'cfg> {
    /// Creates a build driver for `config`.
    pub fn new(config: &'cfg TestRunConfig) -> Self {
        Self { config }
    }

    /// Clears derived data and logs, then builds the scheme for testing.
    pub async fn build(&self) -> Result<(), BuildError> {
        self.clear_dir(&self.config.derived_data_dir()).await?;
        self.clear_dir(&self.config.logs_dir()).await?;

        info!(scheme = %self.config.scheme, "building for testing");
        self.run_logged(TestAction::BuildForTesting, "build.log")
            .await?;
        Ok(())
    }

    /// Produces the test inventory artifact at
    /// [`TestRunConfig::tests_json_path`].
    pub async fn list_tests(&self) -> Result<(), BuildError> {
        info!(scheme = %self.config.scheme, "listing tests");
        let log = self.run_logged(TestAction::ListTests, "list-tests.log").await?;

        // xcodebuild's list pass writes the artifact from inside the test
        // host; for xctool the event stream on stdout is the inventory.
        if self.config.tool == TestTool::Xctool {
            let tests = test_output::listed_tests(&log);
            let contents =
                serde_json::to_string_pretty(&tests).expect("string array serializes");
            let path = self.config.tests_json_path();
            tokio::fs::write(&path, contents)
                .await
                .map_err(|error| BuildError::PrepareDir { path, error })?;
        }
        Ok(())
    }

    async fn run_logged(
        &self,
        action: TestAction<'_>,
        log_name: &str,
    ) -> Result<String, BuildError> {
        let command = TestCommand::new(self.config, action);
        let command_line = command.command_line().to_owned();
        info!(command = %command_line, "running");

        let output = command
            .into_command()
            .output()
            .await
            .map_err(|error| BuildError::Exec {
                command: command_line,
                error,
            })?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            log.push_str(&stderr);
        }

        let log_path = self.config.logs_dir().join(log_name);
        if let Err(error) = tokio::fs::write(&log_path, &log).await {
            return Err(BuildError::PrepareDir {
                path: log_path,
                error,
            });
        }

        if !output.status.success() {
            return Err(BuildError::Failed {
                status: output.status,
                log_tail: log_tail(&log),
            });
        }
        Ok(log)
    }

    async fn clear_dir(&self, path: &Utf8Path) -> Result<(), BuildError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(BuildError::PrepareDir {
                    path: path.to_owned(),
                    error,
                });
            }
        }
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|error| BuildError::PrepareDir {
                path: path.to_owned(),
                error,
            })
    }
}

fn log_tail(log: &str) -> String {
    if log.len() <= LOG_TAIL_BYTES {
        return log.to_owned();
    }
    let start = log.len() - LOG_TAIL_BYTES;
    // Round forward to a character boundary.
    let start = (start..log.len())
        .find(|&i| log.is_char_boundary(i))
        .unwrap_or(log.len());
    log[start..].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_tail_bounds() {
        assert_eq!(log_tail("short"), "short");
        let long = "x".repeat(LOG_TAIL_BYTES * 2);
        assert_eq!(log_tail(&long).len(), LOG_TAIL_BYTES);
    }
}
