// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for [parasim](https://crates.io/crates/parasim), a
//! macOS-only tool that fans an iOS test suite out across multiple simulator
//! instances, retries failures, and aggregates the results.
//!
//! The flow of a run: a previously-produced test inventory is partitioned
//! into per-simulator lanes ([`partition`]), one simulator is provisioned per
//! lane ([`simctl`]), and the [`runner`] drives one subprocess per lane
//! through launch/heartbeat watchdogs and a failed-subset retry loop, feeding
//! a final pass/fail report ([`reporter`]).

pub mod config;
pub mod errors;
mod helpers;
pub mod inventory;
pub mod partition;
pub mod reporter;
pub mod runner;
pub mod signal;
pub mod simctl;
pub mod test_build;
pub mod test_command;
pub mod test_output;
mod time;
