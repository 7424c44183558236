// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    dispatcher::DispatcherContext, executor::ExecutorContext, launch_gate::LaunchGate,
};
use crate::{
    config::TestRunConfig,
    errors::{ExecuteError, RunnerBuildError},
    helpers::plural,
    inventory::TestId,
    partition::{self, PartitionPlan},
    reporter::{LaneEvent, RunStats},
    signal::{SignalHandler, SignalHandlerKind},
    simctl::{SimctlClient, Simulator},
    test_output,
};
use async_scoped::TokioScope;
use std::collections::BTreeSet;
use tokio::{runtime::Runtime, sync::broadcast, sync::mpsc::unbounded_channel};
use tracing::{info, warn};

/// Test runner options.
#[derive(Debug)]
pub struct TestRunnerBuilder {
    signal_handler_kind: SignalHandlerKind,
}

impl Default for TestRunnerBuilder {
    fn default() -> Self {
        Self {
            signal_handler_kind: SignalHandlerKind::Standard,
        }
    }
}

impl TestRunnerBuilder {
    /// Creates a builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides signal handling; tests use [`SignalHandlerKind::Noop`].
    pub fn set_signal_handler_kind(&mut self, kind: SignalHandlerKind) -> &mut Self {
        self.signal_handler_kind = kind;
        self
    }

    /// Creates a new test runner for this process's partition of `plan`.
    pub fn build<'a>(
        self,
        config: &'a TestRunConfig,
        plan: &PartitionPlan,
    ) -> Result<TestRunner<'a>, RunnerBuildError> {
        let mut lanes: Vec<Vec<TestId>> = plan.lanes(config.partition).to_vec();
        if let Some(seed) = config.shuffle_seed {
            for (lane_index, lane) in lanes.iter_mut().enumerate() {
                partition::shuffle_lane(lane, seed, lane_index);
            }
        }

        let logs_dir = config.logs_dir();
        std::fs::create_dir_all(&logs_dir).map_err(|error| RunnerBuildError::CreateLogDir {
            path: logs_dir,
            error,
        })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("parasim-runner-worker")
            .build()
            .map_err(RunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = self.signal_handler_kind.build()?;

        Ok(TestRunner {
            config,
            lanes,
            runtime,
            signal_handler,
            simctl: SimctlClient::new(),
        })
    }
}

/// Context for running one partition's lanes to completion.
///
/// Created using [`TestRunnerBuilder::build`].
pub struct TestRunner<'a> {
    config: &'a TestRunConfig,
    /// Per-lane test slices for this partition. Every device family runs
    /// the same slices, one simulator per slice.
    lanes: Vec<Vec<TestId>>,
    runtime: Runtime,
    signal_handler: SignalHandler,
    simctl: SimctlClient,
}

impl TestRunner<'_> {
    /// Provisions simulators, executes every lane (including retries) to a
    /// terminal state, and tears the simulators down again.
    ///
    /// The callback receives progress events; the returned stats carry the
    /// final verdict.
    pub fn execute<F>(mut self, callback: F) -> Result<RunStats, ExecuteError>
    where
        F: FnMut(LaneEvent) + Send,
    {
        let _guard = self.runtime.enter();

        let groups = self
            .runtime
            .block_on(async {
                self.simctl.delete_stale_devices().await?;
                self.simctl
                    .create_devices(&self.config.device_specs, self.config.simulator_count)
                    .await
            })
            .map_err(ExecuteError::Provision)?;
        if groups.iter().all(|group| group.is_empty()) {
            return Err(ExecuteError::NoLanes);
        }

        let all_simulators: Vec<Simulator> = groups.iter().flatten().cloned().collect();
        info!(
            "created {} {}",
            all_simulators.len(),
            plural::simulators_str(all_simulators.len()),
        );
        for simulator in &all_simulators {
            info!(name = %simulator.name, udid = %simulator.udid, "created simulator");
        }

        // Pair each family's i-th simulator with the i-th lane slice.
        // Round-based slicing can leave edge slices empty; those lanes are
        // skipped rather than dispatched.
        let mut lanes: Vec<(Simulator, Vec<TestId>)> = Vec::new();
        for group in &groups {
            for (lane_index, simulator) in group.iter().enumerate() {
                let tests = self.lanes.get(lane_index).cloned().unwrap_or_default();
                if tests.is_empty() {
                    info!(simulator = %simulator.name, "lane slice empty, skipping");
                    continue;
                }
                lanes.push((simulator.clone(), tests));
            }
        }

        let attempted: BTreeSet<TestId> = lanes
            .iter()
            .flat_map(|(_, tests)| tests.iter().cloned())
            .collect();
        let extractor = test_output::extractor_for(self.config.tool);

        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        drop(cancel_rx);

        let mut dispatcher_cx = DispatcherContext::new(
            callback,
            self.config.retry_limits,
            attempted,
            lanes.len(),
            cancel_tx.clone(),
        );
        dispatcher_cx.run_started();

        let executor_cx = ExecutorContext::new(
            self.config,
            &self.simctl,
            extractor,
            LaunchGate::new(),
            cancel_tx,
        );

        let dispatcher_cx_mut = &mut dispatcher_cx;
        let executor_cx_ref = &executor_cx;
        let signal_handler = &mut self.signal_handler;

        let ((), results) = TokioScope::scope_and_block(move |scope| {
            let (events_tx, events_rx) = unbounded_channel();

            // Run the dispatcher to completion in a task; it exits once
            // every lane task has dropped its sender.
            scope.spawn_cancellable(dispatcher_cx_mut.run(events_rx, signal_handler), || ());

            for (lane_index, (simulator, tests)) in lanes.into_iter().enumerate() {
                let events_tx = events_tx.clone();
                scope.spawn_cancellable(
                    executor_cx_ref.run_lane(lane_index, simulator, tests, events_tx),
                    || (),
                );
            }
            drop(events_tx);
        });

        let stats = dispatcher_cx.run_finished();

        // Shut down and delete every simulator, on success and cancellation
        // alike.
        self.runtime.block_on(async {
            for simulator in &all_simulators {
                if let Err(error) = self.simctl.destroy(simulator).await {
                    warn!(simulator = %simulator.name, %error, "failed to tear down simulator");
                }
            }
        });

        let join_errors: Vec<_> = results.into_iter().filter_map(Result::err).collect();
        if !join_errors.is_empty() {
            return Err(ExecuteError::LaneJoin(join_errors));
        }
        Ok(stats)
    }
}
