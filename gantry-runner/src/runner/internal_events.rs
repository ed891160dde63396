// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Internal events used between the runner components.
//!
//! These mirror parts of [`crate::reporter::events`] but stay inside the
//! runner: they carry worker bookkeeping the reporters never see.

use crate::{
    errors::SpawnError,
    ipc::{ParentMessage, WorkerInit, WorkerMessage},
};
use tokio::sync::mpsc::UnboundedSender;

/// An event surfaced to the dispatcher by worker plumbing tasks.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    /// A frame arrived from a worker.
    Message {
        /// The worker.
        worker_index: usize,
        /// The frame.
        message: WorkerMessage,
    },

    /// A worker wrote to its raw stderr (outside the frame protocol).
    /// Attributed to the worker's in-flight test.
    Stderr {
        /// The worker.
        worker_index: usize,
        /// One line of output.
        chunk: String,
    },

    /// A worker process exited.
    Exited {
        /// The worker.
        worker_index: usize,
        /// The exit code, if the process exited normally.
        code: Option<i32>,
    },
}

/// The dispatcher's handle to one live worker.
pub(crate) trait WorkerLink: Send {
    /// Enqueues a message to the worker. Returns false when the worker is
    /// already disconnected.
    fn send(&self, message: ParentMessage) -> bool;

    /// Force-terminates the worker. An [`PoolEvent::Exited`] event follows.
    fn kill(&mut self);
}

/// Spawns workers. The process implementation re-executes the current
/// binary; tests substitute an in-process scripted implementation.
pub(crate) trait WorkerSpawner: Send + Sync {
    /// Starts a worker, delivering its `Init` message and wiring its event
    /// streams into `events`.
    fn spawn(
        &self,
        init: WorkerInit,
        events: UnboundedSender<PoolEvent>,
    ) -> Result<Box<dyn WorkerLink>, SpawnError>;
}
