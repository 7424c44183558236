// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialization of cold simulator launches.
//!
//! A simulator's first boot is materially more expensive than test
//! execution on an already-booted instance, and concurrent cold boots
//! starve each other. The gate admits at most one attempt into its cold
//! launch phase at a time: admission blocks while any admitted attempt has
//! not yet observed its suite-started marker, and launch-complete
//! notifications release waiters in FIFO order. Everything after launch
//! runs fully in parallel.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct GateState {
    /// True while some admitted attempt has not reported launch-complete.
    cold_launch_active: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// The launch-serialization barrier shared by all lanes of a run.
#[derive(Debug, Default)]
pub(super) struct LaunchGate {
    state: Mutex<GateState>,
}

impl LaunchGate {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Admits one attempt, waiting until no other admitted attempt is still
    /// in its cold launch phase. The returned permit must be released
    /// exactly once; dropping it unreleased releases it.
    pub(super) async fn admit(self: &Arc<Self>) -> LaunchPermit {
        let waiter = {
            let mut state = self.state.lock().expect("gate lock not poisoned");
            if state.cold_launch_active {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            } else {
                state.cold_launch_active = true;
                None
            }
        };
        if let Some(rx) = waiter {
            // The releaser transfers cold-launch ownership to us before
            // sending. An error means the gate was torn down; proceed.
            let _ = rx.await;
        }
        LaunchPermit {
            gate: Arc::clone(self),
            released: false,
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("gate lock not poisoned");
        // Hand the cold-launch slot to the first waiter still listening.
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.cold_launch_active = false;
    }
}

/// Cold-launch ownership held by one admitted attempt.
#[derive(Debug)]
pub(super) struct LaunchPermit {
    gate: Arc<LaunchGate>,
    released: bool,
}

impl LaunchPermit {
    /// Reports launch-complete, releasing the next waiting attempt. The
    /// flag is one-way: later calls are no-ops.
    pub(super) fn mark_launched(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.release();
        }
    }
}

impl Drop for LaunchPermit {
    fn drop(&mut self) {
        // An attempt that ends without ever launching must still unblock
        // the queue.
        self.mark_launched();
    }
}
