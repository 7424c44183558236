// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test-run orchestration engine.
//!
//! The runner is split into an executor (drives one subprocess per lane
//! attempt, including its watchdogs) and a dispatcher (the single owner of
//! shared run state, deciding retries and cancellation). They communicate
//! over channels; completion callbacks never mutate shared state directly.

mod dispatcher;
mod executor;
mod imp;
mod internal_events;
mod launch_gate;

pub use imp::*;
