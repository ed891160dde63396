// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{PoolEvent, WorkerLink, WorkerSpawner};
use crate::{
    config::RunConfig,
    errors::SpawnError,
    fixture::FixtureHash,
    ipc::{ParentMessage, WorkerInit},
};
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// What a pooled worker is currently doing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WorkerState {
    /// Bound to a hash, no test in flight.
    Idle,

    /// Executing a test.
    Busy,

    /// Told to stop; waiting for its exit. Not counted against capacity.
    Retiring,

    /// Force-killed during cancellation; its in-flight test is finalized as
    /// interrupted rather than crashed.
    Killed,
}

pub(crate) struct PoolWorker {
    pub(crate) hash: FixtureHash,
    pub(crate) state: WorkerState,
    link: Box<dyn WorkerLink>,
    last_used: u64,
}

/// Bookkeeping for the worker pool: spawn-on-demand up to the capacity,
/// free workers keyed by their bound hash, least-recently-used eviction on
/// hash change.
pub(crate) struct WorkerPool {
    spawner: Box<dyn WorkerSpawner>,
    capacity: usize,
    events_tx: UnboundedSender<PoolEvent>,
    workers: BTreeMap<usize, PoolWorker>,
    next_index: usize,
    clock: u64,
}

impl WorkerPool {
    pub(crate) fn new(
        spawner: Box<dyn WorkerSpawner>,
        capacity: usize,
        events_tx: UnboundedSender<PoolEvent>,
    ) -> Self {
        Self {
            spawner,
            capacity: capacity.max(1),
            events_tx,
            workers: BTreeMap::new(),
            next_index: 0,
            clock: 0,
        }
    }

    /// The number of workers counted against capacity (idle + busy).
    fn active_len(&self) -> usize {
        self.workers
            .values()
            .filter(|w| matches!(w.state, WorkerState::Idle | WorkerState::Busy))
            .count()
    }

    /// True when every worker has exited and been removed.
    pub(crate) fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.active_len() < self.capacity
    }

    /// An idle worker already bound to `hash`, preferring the most recently
    /// used one.
    pub(crate) fn find_idle(&self, hash: FixtureHash) -> Option<usize> {
        self.workers
            .iter()
            .filter(|(_, w)| w.state == WorkerState::Idle && w.hash == hash)
            .max_by_key(|(_, w)| w.last_used)
            .map(|(&index, _)| index)
    }

    /// Retires the least-recently-used idle worker, freeing capacity for a
    /// different hash. Returns false when no idle worker exists.
    pub(crate) fn evict_lru_idle(&mut self) -> bool {
        let Some(index) = self
            .workers
            .iter()
            .filter(|(_, w)| w.state == WorkerState::Idle)
            .min_by_key(|(_, w)| w.last_used)
            .map(|(&index, _)| index)
        else {
            return false;
        };
        debug!(worker = index, "evicting least-recently-used idle worker");
        self.retire(index);
        true
    }

    /// Spawns a fresh worker bound to `hash` and sends its init message.
    pub(crate) fn spawn(
        &mut self,
        hash: FixtureHash,
        project_index: usize,
        config: &RunConfig,
    ) -> Result<usize, SpawnError> {
        let index = self.next_index;
        let init = WorkerInit {
            worker_index: index,
            project_index,
            config: config.clone(),
            fixture_hash: hash,
        };
        let link = self.spawner.spawn(init, self.events_tx.clone())?;
        self.next_index += 1;
        self.clock += 1;
        debug!(worker = index, %hash, "spawned worker");
        self.workers.insert(
            index,
            PoolWorker {
                hash,
                state: WorkerState::Idle,
                link,
                last_used: self.clock,
            },
        );
        Ok(index)
    }

    /// Sends a message to a worker.
    pub(crate) fn send(&self, index: usize, message: ParentMessage) -> bool {
        match self.workers.get(&index) {
            Some(worker) => worker.link.send(message),
            None => false,
        }
    }

    pub(crate) fn mark_busy(&mut self, index: usize) {
        self.clock += 1;
        if let Some(worker) = self.workers.get_mut(&index) {
            worker.state = WorkerState::Busy;
            worker.last_used = self.clock;
        }
    }

    pub(crate) fn mark_idle(&mut self, index: usize) {
        self.clock += 1;
        if let Some(worker) = self.workers.get_mut(&index) {
            worker.state = WorkerState::Idle;
            worker.last_used = self.clock;
        }
    }

    /// Gracefully stops a worker: it tears down its fixtures and exits.
    pub(crate) fn retire(&mut self, index: usize) {
        if let Some(worker) = self.workers.get_mut(&index) {
            if worker.state != WorkerState::Retiring && worker.state != WorkerState::Killed {
                worker.state = WorkerState::Retiring;
                worker.link.send(ParentMessage::Stop {});
            }
        }
    }

    /// Retires every idle worker.
    pub(crate) fn retire_idle(&mut self) {
        let idle: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, w)| w.state == WorkerState::Idle)
            .map(|(&index, _)| index)
            .collect();
        for index in idle {
            self.retire(index);
        }
    }

    /// Force-terminates a worker.
    pub(crate) fn kill(&mut self, index: usize) {
        if let Some(worker) = self.workers.get_mut(&index) {
            worker.state = WorkerState::Killed;
            worker.link.kill();
        }
    }

    /// Force-terminates every remaining worker.
    pub(crate) fn kill_all(&mut self) {
        let all: Vec<usize> = self.workers.keys().copied().collect();
        for index in all {
            self.kill(index);
        }
    }

    /// Removes a worker after its exit event. Returns its last state.
    pub(crate) fn remove(&mut self, index: usize) -> Option<WorkerState> {
        self.workers.remove(&index).map(|w| w.state)
    }
}
