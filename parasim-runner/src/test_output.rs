// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deriving per-test pass/fail evidence from a lane's log output.
//!
//! The subprocess exit code alone is not trusted: harnesses have been
//! observed to report success after crashing mid-suite. Instead, the log a
//! lane produced is parsed post-hoc for per-test records. Depending on the
//! configured tool generation the evidence is either line-oriented text
//! markers (xcodebuild) or one JSON event record per line (xctool); both are
//! implementations of the same [`ResultExtractor`] capability.

use crate::{inventory::TestId, test_command::TestTool};
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::BTreeSet,
    sync::LazyLock,
};

/// Extracts the launch marker and per-test outcomes from a lane's log.
pub trait ResultExtractor: Send + Sync {
    /// Returns true once the log shows the test suite has started, which is
    /// the signal that the simulator has finished its cold launch.
    fn suite_started(&self, log: &str) -> bool;

    /// Returns the subset of `requested` tests the log records as passed.
    fn passed_tests(&self, log: &str, requested: &[TestId]) -> BTreeSet<TestId>;
}

/// Returns the extractor matching the configured tool generation.
pub fn extractor_for(tool: TestTool) -> &'static dyn ResultExtractor {
    match tool {
        TestTool::Xcodebuild => &XcodebuildLogParser,
        TestTool::Xctool => &XctoolJsonParser,
    }
}

static TEST_CASE_PASSED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Test Case '-\[([^\[\] ]+) ([^\[\]]+)\]' passed").expect("valid regex")
});

static TEST_SUITE_STARTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Test Suite '.+\.xctest' started").expect("valid regex"));

/// Parses xcodebuild's line-oriented text markers.
///
/// Pass records look like
/// `Test Case '-[AppTests.LoginTests testLogin]' passed (0.123 seconds).`.
#[derive(Debug)]
pub struct XcodebuildLogParser;

impl ResultExtractor for XcodebuildLogParser {
    fn suite_started(&self, log: &str) -> bool {
        TEST_SUITE_STARTED_RE.is_match(log)
    }

    fn passed_tests(&self, log: &str, requested: &[TestId]) -> BTreeSet<TestId> {
        let mut passed = BTreeSet::new();
        for capture in TEST_CASE_PASSED_RE.captures_iter(log) {
            let class = &capture[1];
            // The class may carry a module prefix (`Module.Class`).
            let class = class.rsplit('.').next().unwrap_or(class);
            passed.insert(format!("{}/{}", class, &capture[2]));
        }
        requested
            .iter()
            .filter(|id| passed.contains(id.class_method()))
            .cloned()
            .collect()
    }
}

/// One record of xctool's JSON event stream. Unknown events deserialize with
/// all optional fields absent and are skipped.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolEvent {
    event: String,
    class_name: Option<String>,
    method_name: Option<String>,
    succeeded: Option<bool>,
    #[expect(dead_code, reason = "present in the stream, unused here")]
    total_duration: Option<f64>,
}

/// Parses xctool's one-JSON-object-per-line event stream.
#[derive(Debug)]
pub struct XctoolJsonParser;

impl XctoolJsonParser {
    fn events(log: &str) -> impl Iterator<Item = ToolEvent> + '_ {
        log.lines()
            .filter_map(|line| serde_json::from_str::<ToolEvent>(line.trim()).ok())
    }
}

/// Extracts `Class/method` identifiers from a `-listTestsOnly` event
/// stream, in first-seen order.
pub(crate) fn listed_tests(log: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut tests = Vec::new();
    for event in XctoolJsonParser::events(log) {
        let (Some(class), Some(method)) = (event.class_name, event.method_name) else {
            continue;
        };
        let class = class.rsplit('.').next().unwrap_or(&class);
        let id = format!("{class}/{method}");
        if seen.insert(id.clone()) {
            tests.push(id);
        }
    }
    tests
}

impl ResultExtractor for XctoolJsonParser {
    fn suite_started(&self, log: &str) -> bool {
        Self::events(log).any(|event| event.event == "begin-test-suite")
    }

    fn passed_tests(&self, log: &str, requested: &[TestId]) -> BTreeSet<TestId> {
        let mut passed = BTreeSet::new();
        for event in Self::events(log) {
            if event.event != "end-test" || event.succeeded != Some(true) {
                continue;
            }
            let (Some(class), Some(method)) = (event.class_name, event.method_name) else {
                continue;
            };
            let class = class.rsplit('.').next().unwrap_or(&class).to_owned();
            passed.insert(format!("{class}/{method}"));
        }
        requested
            .iter()
            .filter(|id| passed.contains(id.class_method()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    fn requested(ids: &[&str]) -> Vec<TestId> {
        ids.iter().map(|id| TestId::new(id)).collect()
    }

    #[test]
    fn xcodebuild_passed_tests() {
        let log = indoc! {"
            Test Suite 'AppTests.xctest' started at 2019-03-02 10:01:12.000
            Test Case '-[AppTests.LoginTests testLogin]' started.
            Test Case '-[AppTests.LoginTests testLogin]' passed (0.120 seconds).
            Test Case '-[AppTests.LoginTests testLogout]' started.
            Test Case '-[AppTests.LoginTests testLogout]' failed (1.534 seconds).
            Test Case '-[AppTests.AccountTests testRename]' started.
        "};
        let requested = requested(&[
            "LoginTests/testLogin",
            "LoginTests/testLogout",
            "AccountTests/testRename",
        ]);

        let parser = XcodebuildLogParser;
        assert!(parser.suite_started(log));
        assert_eq!(
            parser.passed_tests(log, &requested),
            btreeset! { TestId::new("LoginTests/testLogin") },
        );
    }

    #[test]
    fn xcodebuild_suite_prefixed_request_matches() {
        let log = "Test Case '-[AppTests.LoginTests testLogin]' passed (0.120 seconds).";
        let requested = requested(&["AppTests/LoginTests/testLogin"]);
        let parser = XcodebuildLogParser;
        assert_eq!(
            parser.passed_tests(log, &requested),
            btreeset! { TestId::new("AppTests/LoginTests/testLogin") },
        );
    }

    #[test]
    fn xcodebuild_no_marker_means_not_launched() {
        let parser = XcodebuildLogParser;
        assert!(!parser.suite_started("Compiling dependencies...\n"));
    }

    #[test]
    fn xctool_event_stream() {
        let log = indoc! {r#"
            {"event":"begin-test-suite","suite":"AppTests.xctest"}
            {"event":"end-test","className":"AppTests.LoginTests","methodName":"testLogin","succeeded":true,"totalDuration":0.12}
            {"event":"end-test","className":"AppTests.LoginTests","methodName":"testLogout","succeeded":false,"totalDuration":1.53}
            not json at all
            {"event":"end-test-suite","testCaseCount":2}
        "#};
        let requested = requested(&["LoginTests/testLogin", "LoginTests/testLogout"]);

        let parser = XctoolJsonParser;
        assert!(parser.suite_started(log));
        assert_eq!(
            parser.passed_tests(log, &requested),
            btreeset! { TestId::new("LoginTests/testLogin") },
        );
    }

    #[test]
    fn xctool_empty_log() {
        let parser = XctoolJsonParser;
        assert!(!parser.suite_started(""));
        assert!(
            parser
                .passed_tests("", &requested(&["LoginTests/testLogin"]))
                .is_empty()
        );
    }
}
