// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process scripted workers for dispatcher tests.

use super::{PoolEvent, WorkerLink, WorkerSpawner};
use crate::{
    errors::SpawnError,
    ipc::{ParentMessage, WorkerInit, WorkerMessage},
    list::TestId,
    reporter::events::{ErrorSummary, TestStatus},
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// What a scripted worker does with one attempt of a test. Attempts pop
/// outcomes in order; an exhausted script means "meets expectation".
#[derive(Clone, Copy, Debug)]
pub(super) enum ScriptedOutcome {
    /// Report the expected status.
    Expected,

    /// Report `failed` (missing the expectation).
    Unexpected,

    /// Report `timed-out`.
    TimedOut,

    /// Exit without a `TestEnd`, simulating a crash.
    Crash,
}

/// Spawns in-process workers that answer the protocol according to
/// per-test scripts, without any subprocesses.
#[derive(Clone, Default)]
pub(super) struct ScriptedSpawner {
    behaviors: Arc<Mutex<HashMap<TestId, VecDeque<ScriptedOutcome>>>>,
    spawned: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedSpawner {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Scripts the outcomes of successive attempts of one test.
    pub(super) fn script(
        &self,
        id: &TestId,
        outcomes: impl IntoIterator<Item = ScriptedOutcome>,
    ) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(id.clone(), outcomes.into_iter().collect());
    }

    /// Indexes of every worker spawned so far, in spawn order.
    pub(super) fn spawned(&self) -> Vec<usize> {
        self.spawned.lock().unwrap().clone()
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(
        &self,
        init: WorkerInit,
        events: UnboundedSender<PoolEvent>,
    ) -> Result<Box<dyn WorkerLink>, SpawnError> {
        let worker_index = init.worker_index;
        self.spawned.lock().unwrap().push(worker_index);

        let (tx, mut rx) = unbounded_channel::<ParentMessage>();
        let behaviors = self.behaviors.clone();
        let task_events = events.clone();
        let handle = tokio::spawn(async move {
            let _ = task_events.send(PoolEvent::Message {
                worker_index,
                message: WorkerMessage::Ready {},
            });
            while let Some(message) = rx.recv().await {
                match message {
                    ParentMessage::Run(req) => {
                        let _ = task_events.send(PoolEvent::Message {
                            worker_index,
                            message: WorkerMessage::TestBegin {
                                test_id: req.test_id.clone(),
                            },
                        });
                        let outcome = behaviors
                            .lock()
                            .unwrap()
                            .get_mut(&req.test_id)
                            .and_then(|queue| queue.pop_front())
                            .unwrap_or(ScriptedOutcome::Expected);
                        let (status, error) = match outcome {
                            ScriptedOutcome::Expected => (req.expected_status, None),
                            ScriptedOutcome::Unexpected => (
                                TestStatus::Failed,
                                Some(ErrorSummary {
                                    message: "scripted failure".to_owned(),
                                    location: None,
                                }),
                            ),
                            ScriptedOutcome::TimedOut => (
                                TestStatus::TimedOut,
                                Some(ErrorSummary {
                                    message: "scripted timeout".to_owned(),
                                    location: None,
                                }),
                            ),
                            ScriptedOutcome::Crash => {
                                let _ = task_events.send(PoolEvent::Exited {
                                    worker_index,
                                    code: Some(134),
                                });
                                return;
                            }
                        };
                        let _ = task_events.send(PoolEvent::Message {
                            worker_index,
                            message: WorkerMessage::TestEnd {
                                test_id: req.test_id,
                                status,
                                error,
                                duration_ms: 1,
                            },
                        });
                        if status != req.expected_status {
                            let _ = task_events.send(PoolEvent::Message {
                                worker_index,
                                message: WorkerMessage::Done {
                                    pending_worker: true,
                                },
                            });
                        }
                    }
                    ParentMessage::Stop {} => {
                        let _ = task_events.send(PoolEvent::Message {
                            worker_index,
                            message: WorkerMessage::Done {
                                pending_worker: false,
                            },
                        });
                        let _ = task_events.send(PoolEvent::Exited {
                            worker_index,
                            code: Some(0),
                        });
                        return;
                    }
                    ParentMessage::Init(_) => {}
                }
            }
            // Link dropped without a stop.
            let _ = task_events.send(PoolEvent::Exited {
                worker_index,
                code: Some(0),
            });
        });

        Ok(Box::new(ScriptedLink {
            tx,
            handle,
            events,
            worker_index,
            killed: false,
        }))
    }
}

struct ScriptedLink {
    tx: UnboundedSender<ParentMessage>,
    handle: tokio::task::JoinHandle<()>,
    events: UnboundedSender<PoolEvent>,
    worker_index: usize,
    killed: bool,
}

impl WorkerLink for ScriptedLink {
    fn send(&self, message: ParentMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    fn kill(&mut self) {
        if !self.killed {
            self.killed = true;
            self.handle.abort();
            let _ = self.events.send(PoolEvent::Exited {
                worker_index: self.worker_index,
                code: None,
            });
        }
    }
}
