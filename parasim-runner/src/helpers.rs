// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for parasim-runner.

use std::{process::ExitStatus, time::Duration};

/// Utilities for pluralizing various words based on count.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "retry" if `count` is 1, otherwise "retries".
    pub fn retries_str(count: usize) -> &'static str {
        if count == 1 { "retry" } else { "retries" }
    }

    /// Returns "simulator" if `count` is 1, otherwise "simulators".
    pub fn simulators_str(count: usize) -> &'static str {
        if count == 1 { "simulator" } else { "simulators" }
    }

    /// Returns "lane" if `count` is 1, otherwise "lanes".
    pub fn lanes_str(count: usize) -> &'static str {
        if count == 1 { "lane" } else { "lanes" }
    }
}

/// Formats a duration as seconds with two decimal places.
pub(crate) fn display_duration(duration: Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}

/// True if the process was killed by a signal rather than exiting.
pub(crate) fn killed_by_signal(status: ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().is_some()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        false
    }
}

/// Describes an exit status, including the terminating signal on unix.
pub(crate) fn display_exit_status(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "unknown exit status".to_owned(),
    }
}
