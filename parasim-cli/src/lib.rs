// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parallel iOS simulator test runner.
//!
//! Parasim builds an iOS test bundle once, partitions the test inventory
//! across simulator lanes, runs each lane's tests via repeated invocations
//! of Apple's tooling with hung-run detection and failed-subset retries,
//! and aggregates everything into one pass/fail report.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
