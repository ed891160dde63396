// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{DispatcherContext, ProcessSpawner, WorkerPool, WorkerSpawner};
use crate::{
    config::RunConfig,
    errors::RunnerBuildError,
    list::TestPlan,
    reporter::events::{FinalStatus, RunEvent, RunStats},
    signal::{SignalHandler, SignalHandlerKind},
};
use tokio::{runtime::Runtime, sync::mpsc::unbounded_channel};

/// Test runner options.
#[derive(Debug)]
pub struct RunnerBuilder {
    signal_handler_kind: SignalHandlerKind,
}

impl Default for RunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerBuilder {
    /// Creates a builder with the standard signal handler.
    pub fn new() -> Self {
        Self {
            signal_handler_kind: SignalHandlerKind::Standard,
        }
    }

    /// Sets the kind of signal handling for this runner.
    pub fn set_signal_handler_kind(&mut self, kind: SignalHandlerKind) -> &mut Self {
        self.signal_handler_kind = kind;
        self
    }

    /// Creates a runner for the given plan.
    pub fn build<'a>(
        &self,
        plan: &'a TestPlan<'a>,
        config: &'a RunConfig,
    ) -> Result<Runner<'a>, RunnerBuildError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("gantry-runner")
            .build()
            .map_err(RunnerBuildError::TokioRuntimeCreate)?;

        // Signal registration must happen inside the runtime.
        let signal_handler = {
            let _guard = runtime.enter();
            self.signal_handler_kind.build()?
        };

        let spawner = ProcessSpawner::current_exe().map_err(RunnerBuildError::WorkerProgram)?;

        Ok(Runner {
            plan,
            config,
            signal_handler,
            spawner: Box::new(spawner),
            runtime,
        })
    }
}

/// Executes a test plan across a pool of worker processes.
///
/// Created using [`RunnerBuilder::build`].
pub struct Runner<'a> {
    plan: &'a TestPlan<'a>,
    config: &'a RunConfig,
    signal_handler: SignalHandler,
    spawner: Box<dyn WorkerSpawner>,
    runtime: Runtime,
}

impl<'a> Runner<'a> {
    /// Runs the plan to completion. The callback receives every run event
    /// in dispatch order.
    pub fn execute<F>(self, callback: F) -> (RunStats, FinalStatus)
    where
        F: FnMut(RunEvent<'a>) + Send,
    {
        let Runner {
            plan,
            config,
            mut signal_handler,
            spawner,
            runtime,
        } = self;

        let result = runtime.block_on(async {
            let (events_tx, mut events_rx) = unbounded_channel();
            let mut pool = WorkerPool::new(spawner, config.workers, events_tx);
            let mut cx = DispatcherContext::new(callback, config, plan);
            cx.run_started();
            cx.run(&mut pool, &mut events_rx, &mut signal_handler).await;
            cx.run_finished()
        });

        // Worker plumbing tasks may still be parked on pipe reads; shut the
        // runtime down without waiting for them.
        runtime.shutdown_background();
        result
    }
}
