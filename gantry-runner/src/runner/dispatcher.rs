// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for the test runner.
//!
//! This module interfaces with the external world and the worker pool. It
//! receives frames from workers, signals, and the global-timeout timer,
//! mutates the queue and pool bookkeeping between suspension points, and
//! sends events to the reporter.

use super::{PoolEvent, WorkerPool, WorkerState};
use crate::{
    config::RunConfig,
    errors::DisplayErrorChain,
    fixture::FixtureHash,
    ipc::{ParentMessage, RunRequest, StdioStream, WorkerMessage},
    list::{PlanEntry, TestPlan},
    reporter::events::{
        CancelReason, ErrorSummary, ExecutionStatuses, FinalStatus, RunEvent, RunEventKind,
        RunStats, SkipReason, TestResult, TestStatus,
    },
    signal::SignalHandler,
    time::{deadline, stopwatch, StopwatchStart},
};
use chrono::Local;
use debug_ignore::DebugIgnore;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

/// How long in-flight tests may drain to their `TestEnd` after cancellation
/// begins, before their workers are force-terminated.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// How long retired workers may take to tear down and exit at the end of a
/// run.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One test attempt waiting in the queue.
#[derive(Copy, Clone, Debug)]
struct QueuedAttempt<'a> {
    entry: PlanEntry<'a>,
    retry: usize,
}

/// A maximal contiguous group of queued tests sharing one fixture hash
/// within one file. Assigned to a worker as a unit and streamed one test at
/// a time.
#[derive(Debug)]
struct HashRun<'a> {
    hash: FixtureHash,
    project_index: usize,
    tests: VecDeque<QueuedAttempt<'a>>,
}

#[derive(Debug)]
enum QueueUnit<'a> {
    /// A planned test that never dispatches.
    Skip(PlanEntry<'a>),

    /// A dispatchable hash-run.
    Run(HashRun<'a>),
}

/// A test currently executing on a worker, along with the rest of its
/// hash-run.
#[derive(Debug)]
struct InFlightTest<'a> {
    entry: PlanEntry<'a>,
    retry: usize,
    hash: FixtureHash,
    project_index: usize,
    remaining: VecDeque<QueuedAttempt<'a>>,
    start: StopwatchStart,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

/// Context for the dispatcher.
///
/// Single-threaded cooperative: the `run` loop is the only writer to the
/// queue and pool, so bookkeeping needs no locks.
pub(crate) struct DispatcherContext<'a, F> {
    callback: DebugIgnore<F>,
    config: &'a RunConfig,
    stopwatch: StopwatchStart,
    run_stats: RunStats,
    queue: VecDeque<QueueUnit<'a>>,
    running: BTreeMap<usize, InFlightTest<'a>>,
    attempt_history: HashMap<crate::list::TestId, Vec<TestResult>>,
    cancel_state: Option<CancelReason>,
}

impl<'a, F> DispatcherContext<'a, F>
where
    F: FnMut(RunEvent<'a>),
{
    pub(crate) fn new(callback: F, config: &'a RunConfig, plan: &'a TestPlan<'a>) -> Self {
        let mut queue: VecDeque<QueueUnit<'a>> = VecDeque::new();
        for &entry in plan.entries() {
            if entry.skip.is_some() {
                queue.push_back(QueueUnit::Skip(entry));
                continue;
            }
            let case = entry.instance.case;
            let attempt = QueuedAttempt { entry, retry: 0 };
            match queue.back_mut() {
                Some(QueueUnit::Run(run))
                    if run.hash == case.fixture_hash
                        && run.tests.back().map(|t| t.entry.instance.case.file_index)
                            == Some(case.file_index) =>
                {
                    run.tests.push_back(attempt);
                }
                _ => queue.push_back(QueueUnit::Run(HashRun {
                    hash: case.fixture_hash,
                    project_index: case.project_index,
                    tests: VecDeque::from([attempt]),
                })),
            }
        }

        Self {
            callback: DebugIgnore(callback),
            config,
            stopwatch: stopwatch(),
            run_stats: RunStats {
                initial_run_count: plan.initial_run_count(),
                ..RunStats::default()
            },
            queue,
            running: BTreeMap::new(),
            attempt_history: HashMap::new(),
            cancel_state: None,
        }
    }

    pub(crate) fn run_started(&mut self) {
        self.basic_callback(RunEventKind::RunStarted {
            test_count: self.run_stats.initial_run_count,
            workers: self.config.workers,
        });
    }

    /// Runs the dispatcher to completion: every planned test finished,
    /// skipped, or abandoned by cancellation, and every worker exited.
    pub(crate) async fn run(
        &mut self,
        pool: &mut WorkerPool,
        events_rx: &mut UnboundedReceiver<PoolEvent>,
        signal_handler: &mut SignalHandler,
    ) {
        let mut global_deadline = std::pin::pin!(deadline(
            self.config.global_timeout.unwrap_or(Duration::ZERO)
        ));
        let mut global_fired = false;
        let mut drain_grace = std::pin::pin!(deadline(Duration::ZERO));
        let mut grace_armed = false;
        let mut signals_done = false;

        loop {
            self.dispatch_tests(pool);
            if self.queue.is_empty() && self.running.is_empty() {
                break;
            }
            if self.cancel_state.is_some() && !grace_armed {
                drain_grace.as_mut().reset(DRAIN_GRACE);
                grace_armed = true;
            }

            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_pool_event(event, pool),
                        None => break,
                    }
                }
                event = signal_handler.recv(), if !signals_done => {
                    match event {
                        Some(event) => {
                            debug!(?event, "received shutdown signal");
                            self.begin_cancel(CancelReason::Signal, pool);
                        }
                        None => signals_done = true,
                    }
                }
                () = &mut global_deadline, if !global_fired => {
                    global_fired = true;
                    self.begin_cancel(CancelReason::GlobalTimeout, pool);
                }
                () = &mut drain_grace, if grace_armed => {
                    debug!("drain grace elapsed, force-terminating running workers");
                    let stuck: Vec<usize> = self.running.keys().copied().collect();
                    for index in stuck {
                        pool.kill(index);
                    }
                    // An elapsed sleep polls Ready forever; push it out so
                    // the loop can drain the kill notifications.
                    drain_grace.as_mut().reset(DRAIN_GRACE);
                }
            }
        }

        self.shutdown(pool, events_rx).await;
    }

    /// Assigns queued hash-runs to workers until the queue head cannot be
    /// placed.
    fn dispatch_tests(&mut self, pool: &mut WorkerPool) {
        if self.cancel_state.is_some() {
            return;
        }
        loop {
            if matches!(self.queue.front(), Some(QueueUnit::Skip(_))) {
                let Some(QueueUnit::Skip(entry)) = self.queue.pop_front() else {
                    unreachable!("front was a skip unit");
                };
                self.run_stats.on_test_skipped();
                self.basic_callback(RunEventKind::TestSkipped {
                    instance: entry.instance,
                    reason: SkipReason::Annotation,
                });
                continue;
            }
            let Some(QueueUnit::Run(front)) = self.queue.front() else {
                break;
            };
            let (hash, project_index) = (front.hash, front.project_index);

            // Prefer a free worker already bound to this hash; else spawn if
            // the pool has capacity; else retire the least-recently-used
            // free worker and spawn fresh.
            let assigned = if let Some(index) = pool.find_idle(hash) {
                Some(index)
            } else if pool.has_capacity() || pool.evict_lru_idle() {
                match pool.spawn(hash, project_index, self.config) {
                    Ok(index) => Some(index),
                    Err(err) => {
                        warn!(%err, "failed to spawn worker");
                        self.basic_callback(RunEventKind::RunError {
                            error: ErrorSummary {
                                message: DisplayErrorChain::new(&err).to_string(),
                                location: None,
                            },
                        });
                        // Fail the head test rather than spinning.
                        let Some(QueueUnit::Run(mut run)) = self.queue.pop_front() else {
                            unreachable!("front was a run unit");
                        };
                        let attempt = run.tests.pop_front().expect("runs are non-empty");
                        if !run.tests.is_empty() {
                            self.queue.push_front(QueueUnit::Run(run));
                        }
                        let snapshot = self.stopwatch.snapshot();
                        let result = TestResult {
                            attempt: attempt.retry,
                            retry: attempt.retry,
                            worker_index: None,
                            start_time: snapshot.start_time.fixed_offset(),
                            duration: Duration::ZERO,
                            status: TestStatus::Failed,
                            error: Some(ErrorSummary {
                                message: "failed to spawn worker".to_owned(),
                                location: None,
                            }),
                            stdout: Vec::new(),
                            stderr: Vec::new(),
                        };
                        self.complete_attempt(attempt.entry, attempt.retry, result, None, pool);
                        continue;
                    }
                }
            } else {
                None
            };
            let Some(worker_index) = assigned else {
                // Every worker is busy.
                break;
            };

            let Some(QueueUnit::Run(mut run)) = self.queue.pop_front() else {
                unreachable!("front was a run unit");
            };
            let attempt = run.tests.pop_front().expect("runs are non-empty");
            pool.mark_busy(worker_index);
            self.send_test(pool, worker_index, &attempt);
            self.running.insert(
                worker_index,
                InFlightTest {
                    entry: attempt.entry,
                    retry: attempt.retry,
                    hash,
                    project_index,
                    remaining: run.tests,
                    start: stopwatch(),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                },
            );
        }
    }

    fn send_test(&mut self, pool: &WorkerPool, worker_index: usize, attempt: &QueuedAttempt<'a>) {
        let case = attempt.entry.instance.case;
        debug!(
            worker = worker_index,
            test = %attempt.entry.instance.name(),
            retry = attempt.retry,
            "dispatching test"
        );
        pool.send(
            worker_index,
            ParentMessage::Run(RunRequest {
                test_id: case.id.clone(),
                timeout_ms: case.timeout.as_millis() as u64,
                retry: attempt.retry,
                expected_status: case.expected_status,
            }),
        );
    }

    fn handle_pool_event(&mut self, event: PoolEvent, pool: &mut WorkerPool) {
        match event {
            PoolEvent::Message {
                worker_index,
                message,
            } => self.handle_worker_message(worker_index, message, pool),
            PoolEvent::Stderr {
                worker_index,
                chunk,
            } => {
                let Some(inflight) = self.running.get_mut(&worker_index) else {
                    debug!(worker = worker_index, chunk, "stderr from idle worker");
                    return;
                };
                let instance = inflight.entry.instance;
                inflight.stderr.push(chunk.clone());
                self.basic_callback(RunEventKind::TestStdio {
                    instance,
                    stream: StdioStream::Stderr,
                    data: chunk,
                });
            }
            PoolEvent::Exited { worker_index, code } => {
                let state = pool.remove(worker_index);
                let Some(mut inflight) = self.running.remove(&worker_index) else {
                    // An idle worker dying outside a test is a run-level
                    // error; retired workers exiting is the normal path.
                    if state == Some(WorkerState::Idle) && code != Some(0) {
                        self.basic_callback(RunEventKind::RunError {
                            error: ErrorSummary {
                                message: format!(
                                    "worker {worker_index} exited unexpectedly \
                                     (exit code {code:?})"
                                ),
                                location: None,
                            },
                        });
                    }
                    return;
                };

                // The worker died before this test's TestEnd.
                let killed = state == Some(WorkerState::Killed);
                let snapshot = inflight.start.snapshot();
                let (status, message) = if killed {
                    (
                        TestStatus::Interrupted,
                        "test was interrupted".to_owned(),
                    )
                } else {
                    (
                        TestStatus::Failed,
                        match code {
                            Some(code) => format!("worker crashed (exit code {code})"),
                            None => "worker crashed".to_owned(),
                        },
                    )
                };
                let result = TestResult {
                    attempt: inflight.retry,
                    retry: inflight.retry,
                    worker_index: Some(worker_index),
                    start_time: snapshot.start_time.fixed_offset(),
                    duration: snapshot.duration,
                    status,
                    error: Some(ErrorSummary {
                        message,
                        location: None,
                    }),
                    stdout: std::mem::take(&mut inflight.stdout),
                    stderr: std::mem::take(&mut inflight.stderr),
                };
                let carryover = (!inflight.remaining.is_empty()
                    && self.cancel_state.is_none())
                .then(|| HashRun {
                    hash: inflight.hash,
                    project_index: inflight.project_index,
                    tests: inflight.remaining,
                });
                self.complete_attempt(inflight.entry, inflight.retry, result, carryover, pool);
            }
        }
    }

    fn handle_worker_message(
        &mut self,
        worker_index: usize,
        message: WorkerMessage,
        pool: &mut WorkerPool,
    ) {
        match message {
            WorkerMessage::Ready {} => {
                debug!(worker = worker_index, "worker ready");
            }
            WorkerMessage::TestBegin { test_id } => {
                let Some(inflight) = self.running.get(&worker_index) else {
                    debug!(worker = worker_index, %test_id, "test begin for unknown test");
                    return;
                };
                let instance = inflight.entry.instance;
                let retry = inflight.retry;
                self.basic_callback(RunEventKind::TestStarted {
                    instance,
                    retry,
                    worker_index,
                });
            }
            WorkerMessage::Stdio {
                stream, data, ..
            } => {
                let Some(inflight) = self.running.get_mut(&worker_index) else {
                    return;
                };
                let instance = inflight.entry.instance;
                match stream {
                    StdioStream::Stdout => inflight.stdout.push(data.clone()),
                    StdioStream::Stderr => inflight.stderr.push(data.clone()),
                }
                self.basic_callback(RunEventKind::TestStdio {
                    instance,
                    stream,
                    data,
                });
            }
            WorkerMessage::TestEnd {
                test_id,
                status,
                error,
                duration_ms,
            } => {
                let Some(mut inflight) = self.running.remove(&worker_index) else {
                    debug!(worker = worker_index, %test_id, "test end for unknown test");
                    return;
                };
                let case = inflight.entry.instance.case;
                let matches_expectation = status == case.expected_status;
                let snapshot = inflight.start.snapshot();
                let result = TestResult {
                    attempt: inflight.retry,
                    retry: inflight.retry,
                    worker_index: Some(worker_index),
                    start_time: snapshot.start_time.fixed_offset(),
                    duration: Duration::from_millis(duration_ms),
                    status,
                    error,
                    stdout: std::mem::take(&mut inflight.stdout),
                    stderr: std::mem::take(&mut inflight.stderr),
                };

                let mut carryover = None;
                if matches_expectation && self.cancel_state.is_none() {
                    // Stream the next test of the hash-run to this worker,
                    // or return it to the free pool.
                    if let Some(next) = inflight.remaining.pop_front() {
                        self.send_test(pool, worker_index, &next);
                        self.running.insert(
                            worker_index,
                            InFlightTest {
                                entry: next.entry,
                                retry: next.retry,
                                hash: inflight.hash,
                                project_index: inflight.project_index,
                                remaining: inflight.remaining,
                                start: stopwatch(),
                                stdout: Vec::new(),
                                stderr: Vec::new(),
                            },
                        );
                    } else {
                        pool.mark_idle(worker_index);
                    }
                } else {
                    // Failure always discards the worker; the rest of its
                    // hash-run goes back to the queue head.
                    pool.retire(worker_index);
                    if !inflight.remaining.is_empty() && self.cancel_state.is_none() {
                        carryover = Some(HashRun {
                            hash: inflight.hash,
                            project_index: inflight.project_index,
                            tests: inflight.remaining,
                        });
                    }
                }
                self.complete_attempt(inflight.entry, inflight.retry, result, carryover, pool);
            }
            WorkerMessage::TeardownError { error } => {
                // Open-question decision: teardown failures after the
                // worker's last test was finalized surface as run-level
                // errors.
                self.basic_callback(RunEventKind::RunError { error });
            }
            WorkerMessage::Done { pending_worker } => {
                if pending_worker {
                    pool.retire(worker_index);
                }
            }
        }
    }

    /// Records one finished attempt: re-enqueues a retry, or finalizes the
    /// test and checks the failure budget.
    fn complete_attempt(
        &mut self,
        entry: PlanEntry<'a>,
        retry: usize,
        mut result: TestResult,
        carryover: Option<HashRun<'a>>,
        pool: &mut WorkerPool,
    ) {
        let case = entry.instance.case;
        let matches_expectation = result.status == case.expected_status;

        if self.cancel_state.is_some() {
            // Draining: record the attempt, but a missed expectation after
            // cancellation began counts as interrupted, keeping the failure
            // tally at the point the run was cancelled.
            if !matches_expectation {
                result.status = TestStatus::Interrupted;
            }
            self.finalize_test(entry, result);
            return;
        }

        if let Some(run) = carryover {
            self.queue.push_front(QueueUnit::Run(run));
        }

        if !matches_expectation && retry < case.retries {
            self.attempt_history
                .entry(case.id.clone())
                .or_default()
                .push(result.clone());
            self.basic_callback(RunEventKind::TestAttemptFailedWillRetry {
                instance: entry.instance,
                result,
            });
            // Retries execute immediately, in a fresh worker: the failing
            // worker was discarded, and the retry lands at the queue head
            // as its own hash-run.
            self.queue.push_front(QueueUnit::Run(HashRun {
                hash: case.fixture_hash,
                project_index: case.project_index,
                tests: VecDeque::from([QueuedAttempt {
                    entry,
                    retry: retry + 1,
                }]),
            }));
            return;
        }

        self.finalize_test(entry, result);
        if let Some(max_failures) = self.config.max_failures {
            if max_failures > 0 && self.run_stats.failed_count() >= max_failures {
                self.begin_cancel(CancelReason::TestFailure, pool);
            }
        }
    }

    fn finalize_test(&mut self, entry: PlanEntry<'a>, result: TestResult) {
        let case = entry.instance.case;
        let mut attempts = self.attempt_history.remove(&case.id).unwrap_or_default();
        attempts.push(result);
        let statuses = ExecutionStatuses::new(attempts);
        self.run_stats
            .on_test_finished(&statuses, case.expected_status);
        let current_stats = self.run_stats;
        let running = self.running.len();
        self.basic_callback(RunEventKind::TestFinished {
            instance: entry.instance,
            statuses,
            current_stats,
            running,
        });
    }

    /// Begins cancellation of the run if `reason` outranks the current
    /// cancel state: stop feeding, report the queue as skipped, retire idle
    /// workers, and let in-flight tests drain.
    fn begin_cancel(&mut self, reason: CancelReason, pool: &mut WorkerPool) {
        if self.cancel_state < Some(reason) {
            self.cancel_state = Some(reason);
            self.basic_callback(RunEventKind::RunBeginCancel {
                running: self.running.len(),
                reason,
            });
            self.drain_queue();
            pool.retire_idle();
        }
    }

    /// Reports everything still queued: never-started tests as skipped,
    /// pending retries finalized with the attempts they already made.
    fn drain_queue(&mut self) {
        while let Some(unit) = self.queue.pop_front() {
            match unit {
                QueueUnit::Skip(entry) => {
                    self.run_stats.on_test_skipped();
                    self.basic_callback(RunEventKind::TestSkipped {
                        instance: entry.instance,
                        reason: SkipReason::Annotation,
                    });
                }
                QueueUnit::Run(run) => {
                    for attempt in run.tests {
                        let case = attempt.entry.instance.case;
                        let attempts = self.attempt_history.remove(&case.id).unwrap_or_default();
                        if attempts.is_empty() {
                            self.run_stats.on_test_skipped();
                            self.basic_callback(RunEventKind::TestSkipped {
                                instance: attempt.entry.instance,
                                reason: SkipReason::RunCancelled,
                            });
                        } else {
                            // A pending retry: the attempts already made are
                            // the final record.
                            let statuses = ExecutionStatuses::new(attempts);
                            self.run_stats
                                .on_test_finished(&statuses, case.expected_status);
                            let current_stats = self.run_stats;
                            let running = self.running.len();
                            self.basic_callback(RunEventKind::TestFinished {
                                instance: attempt.entry.instance,
                                statuses,
                                current_stats,
                                running,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Retires every remaining worker and waits for the pool to empty.
    async fn shutdown(&mut self, pool: &mut WorkerPool, events_rx: &mut UnboundedReceiver<PoolEvent>) {
        pool.retire_idle();
        let mut grace = std::pin::pin!(deadline(SHUTDOWN_GRACE));
        while !pool.is_empty() {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(PoolEvent::Exited { worker_index, .. }) => {
                            pool.remove(worker_index);
                        }
                        Some(PoolEvent::Message {
                            message: WorkerMessage::TeardownError { error },
                            ..
                        }) => {
                            self.basic_callback(RunEventKind::RunError { error });
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                () = &mut grace => {
                    debug!("shutdown grace elapsed, force-terminating remaining workers");
                    pool.kill_all();
                    grace.as_mut().reset(SHUTDOWN_GRACE);
                }
            }
        }
    }

    pub(crate) fn run_finished(&mut self) -> (RunStats, FinalStatus) {
        let snapshot = self.stopwatch.snapshot();
        let status = self.run_stats.summarize_final(self.cancel_state);
        self.basic_callback(RunEventKind::RunFinished {
            start_time: snapshot.start_time.fixed_offset(),
            elapsed: snapshot.duration,
            run_stats: self.run_stats,
            status,
        });
        (self.run_stats, status)
    }

    #[inline]
    fn basic_callback(&mut self, kind: RunEventKind<'a>) {
        let snapshot = self.stopwatch.snapshot();
        let event = RunEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: snapshot.duration,
            kind,
        };
        (self.callback)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Project, RunConfig},
        errors::TestFailure,
        fixture::SetUpFixture,
        list::{Annotation, RootRegistry, SourceLocation, TestId, TestList},
        runner::test_helpers::{ScriptedOutcome, ScriptedSpawner},
        signal::SignalHandlerKind,
        worker::TestContext,
    };
    use std::future::Future;
    use tokio::sync::mpsc::unbounded_channel;

    fn passing_body(
        _ctx: TestContext,
    ) -> impl Future<Output = Result<(), TestFailure>> + Send {
        async { Ok(()) }
    }

    fn simple_list(files: &[(&str, &[&str])], config: &RunConfig) -> TestList {
        let mut reg = RootRegistry::new();
        for (file, titles) in files {
            let suite = reg.file(*file);
            for (idx, title) in titles.iter().enumerate() {
                suite.spec(
                    *title,
                    SourceLocation::new(*file, idx as u32 + 1, 1),
                    passing_body,
                );
            }
        }
        TestList::build(reg, config).unwrap()
    }

    fn id_of(list: &TestList, title: &str) -> TestId {
        list.iter_instances()
            .find(|i| i.spec.title == title)
            .unwrap()
            .id()
            .clone()
    }

    #[derive(Debug)]
    enum Record {
        Started {
            title: String,
            worker: usize,
            retry: usize,
        },
        WillRetry {
            title: String,
        },
        Finished {
            title: String,
            final_status: TestStatus,
            attempts: Vec<TestStatus>,
            workers: Vec<Option<usize>>,
            first_error: Option<String>,
        },
        Skipped {
            title: String,
            reason: SkipReason,
        },
        Cancel {
            reason: CancelReason,
        },
    }

    fn record(event: RunEvent<'_>) -> Option<Record> {
        match event.kind {
            RunEventKind::TestStarted {
                instance,
                retry,
                worker_index,
            } => Some(Record::Started {
                title: instance.spec.title.clone(),
                worker: worker_index,
                retry,
            }),
            RunEventKind::TestAttemptFailedWillRetry { instance, .. } => {
                Some(Record::WillRetry {
                    title: instance.spec.title.clone(),
                })
            }
            RunEventKind::TestFinished {
                instance, statuses, ..
            } => Some(Record::Finished {
                title: instance.spec.title.clone(),
                final_status: statuses.final_status(instance.case.expected_status),
                attempts: statuses.iter().map(|r| r.status).collect(),
                workers: statuses.iter().map(|r| r.worker_index).collect(),
                first_error: statuses
                    .iter()
                    .find_map(|r| r.error.as_ref().map(|e| e.message.clone())),
            }),
            RunEventKind::TestSkipped { instance, reason } => Some(Record::Skipped {
                title: instance.spec.title.clone(),
                reason,
            }),
            RunEventKind::RunBeginCancel { reason, .. } => Some(Record::Cancel { reason }),
            _ => None,
        }
    }

    async fn run_scripted(
        list: &TestList,
        config: &RunConfig,
        spawner: &ScriptedSpawner,
    ) -> (Vec<Record>, RunStats, FinalStatus) {
        let plan = TestPlan::build(list, config).unwrap();
        let (events_tx, mut events_rx) = unbounded_channel();
        let mut pool = WorkerPool::new(Box::new(spawner.clone()), config.workers, events_tx);
        let mut records = Vec::new();
        let (stats, status) = {
            let mut cx = DispatcherContext::new(
                |event| {
                    if let Some(record) = record(event) {
                        records.push(record);
                    }
                },
                config,
                &plan,
            );
            let mut signal_handler = SignalHandlerKind::Noop.build().unwrap();
            cx.run_started();
            cx.run(&mut pool, &mut events_rx, &mut signal_handler).await;
            cx.run_finished()
        };
        (records, stats, status)
    }

    fn started_workers(records: &[Record]) -> Vec<usize> {
        records
            .iter()
            .filter_map(|r| match r {
                Record::Started { worker, .. } => Some(*worker),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn tests_in_one_file_share_a_worker() {
        let config = RunConfig {
            workers: 2,
            ..RunConfig::default()
        };
        let list = simple_list(&[("tests/a.rs", &["t1", "t2", "t3"])], &config);
        let spawner = ScriptedSpawner::new();
        let (records, stats, status) = run_scripted(&list, &config, &spawner).await;

        assert_eq!(started_workers(&records), [0, 0, 0]);
        assert_eq!(spawner.spawned(), [0]);
        assert_eq!(stats.passed, 3);
        assert_eq!(stats.initial_run_count, 3);
        assert_eq!(status, FinalStatus::Passed);
    }

    #[tokio::test]
    async fn separate_files_use_separate_workers() {
        let config = RunConfig {
            workers: 2,
            ..RunConfig::default()
        };
        let list = simple_list(
            &[("tests/a.rs", &["left"]), ("tests/b.rs", &["right"])],
            &config,
        );
        let spawner = ScriptedSpawner::new();
        let (records, stats, status) = run_scripted(&list, &config, &spawner).await;

        let mut workers = started_workers(&records);
        workers.sort_unstable();
        assert_eq!(workers, [0, 1]);
        assert_eq!(spawner.spawned(), [0, 1]);
        assert_eq!(stats.passed, 2);
        assert_eq!(status, FinalStatus::Passed);
    }

    #[tokio::test]
    async fn idle_worker_with_matching_hash_is_reused() {
        let config = RunConfig {
            workers: 1,
            ..RunConfig::default()
        };
        let list = simple_list(
            &[("tests/a.rs", &["first"]), ("tests/b.rs", &["second"])],
            &config,
        );
        let spawner = ScriptedSpawner::new();
        let (records, stats, _) = run_scripted(&list, &config, &spawner).await;

        assert_eq!(started_workers(&records), [0, 0]);
        assert_eq!(spawner.spawned(), [0], "one worker serves both files");
        assert_eq!(stats.passed, 2);
    }

    #[tokio::test]
    async fn distinct_projects_force_distinct_workers() {
        let config = RunConfig {
            workers: 4,
            projects: vec![
                Project::new("alpha"),
                Project::new("beta"),
                Project::new("gamma"),
            ],
            ..RunConfig::default()
        };
        let list = simple_list(&[("tests/p.rs", &["shared"])], &config);
        let spawner = ScriptedSpawner::new();
        let (records, stats, status) = run_scripted(&list, &config, &spawner).await;

        let mut workers = started_workers(&records);
        workers.sort_unstable();
        assert_eq!(workers, [0, 1, 2]);
        assert_eq!(stats.passed, 3);
        assert_eq!(status, FinalStatus::Passed);
    }

    #[tokio::test]
    async fn failed_attempt_retries_in_a_fresh_worker_and_becomes_flaky() {
        let config = RunConfig {
            retries: Some(2),
            ..RunConfig::default()
        };
        let list = simple_list(&[("tests/r.rs", &["wobbly"])], &config);
        let spawner = ScriptedSpawner::new();
        spawner.script(
            &id_of(&list, "wobbly"),
            [ScriptedOutcome::Unexpected, ScriptedOutcome::Expected],
        );
        let (records, stats, status) = run_scripted(&list, &config, &spawner).await;

        assert!(matches!(
            records.iter().find(|r| matches!(r, Record::WillRetry { .. })),
            Some(Record::WillRetry { title }) if title == "wobbly"
        ));
        let finished = records
            .iter()
            .find_map(|r| match r {
                Record::Finished {
                    final_status,
                    attempts,
                    workers,
                    ..
                } => Some((final_status, attempts, workers)),
                _ => None,
            })
            .unwrap();
        assert_eq!(*finished.0, TestStatus::Flaky);
        assert_eq!(finished.1.as_slice(), [TestStatus::Failed, TestStatus::Passed]);
        assert_eq!(
            finished.2.as_slice(),
            [Some(0), Some(1)],
            "the retry ran in a fresh worker"
        );
        assert_eq!(stats.flaky, 1);
        assert_eq!(status, FinalStatus::Passed);
    }

    #[tokio::test]
    async fn exhausted_retries_finalize_as_failed() {
        let config = RunConfig {
            retries: Some(1),
            ..RunConfig::default()
        };
        let list = simple_list(&[("tests/r.rs", &["broken"])], &config);
        let spawner = ScriptedSpawner::new();
        spawner.script(
            &id_of(&list, "broken"),
            [ScriptedOutcome::Unexpected, ScriptedOutcome::Unexpected],
        );
        let (records, stats, status) = run_scripted(&list, &config, &spawner).await;

        let finished = records
            .iter()
            .find_map(|r| match r {
                Record::Finished {
                    final_status,
                    attempts,
                    ..
                } => Some((final_status, attempts.len())),
                _ => None,
            })
            .unwrap();
        assert_eq!(*finished.0, TestStatus::Failed);
        assert_eq!(finished.1, 2, "one retry means two attempts");
        assert_eq!(stats.failed, 1);
        assert_eq!(status, FinalStatus::Failed);
    }

    #[tokio::test]
    async fn worker_crash_fails_the_test_and_is_retryable() {
        let config = RunConfig {
            retries: Some(1),
            ..RunConfig::default()
        };
        let list = simple_list(&[("tests/c.rs", &["crashy"])], &config);
        let spawner = ScriptedSpawner::new();
        spawner.script(&id_of(&list, "crashy"), [ScriptedOutcome::Crash]);
        let (records, stats, status) = run_scripted(&list, &config, &spawner).await;

        let finished = records
            .iter()
            .find_map(|r| match r {
                Record::Finished {
                    final_status,
                    first_error,
                    ..
                } => Some((final_status, first_error.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(*finished.0, TestStatus::Flaky);
        assert!(finished.1.unwrap().contains("worker crashed"));
        assert_eq!(stats.flaky, 1);
        assert_eq!(status, FinalStatus::Passed);
    }

    #[tokio::test]
    async fn timed_out_attempt_counts_as_timed_out() {
        let config = RunConfig::default();
        let list = simple_list(&[("tests/t.rs", &["slowpoke"])], &config);
        let spawner = ScriptedSpawner::new();
        spawner.script(&id_of(&list, "slowpoke"), [ScriptedOutcome::TimedOut]);
        let (records, stats, status) = run_scripted(&list, &config, &spawner).await;

        let finished = records
            .iter()
            .find_map(|r| match r {
                Record::Finished { final_status, .. } => Some(*final_status),
                _ => None,
            })
            .unwrap();
        assert_eq!(finished, TestStatus::TimedOut);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(status, FinalStatus::Failed);
    }

    #[tokio::test]
    async fn max_failures_drains_and_skips_the_rest() {
        let titles: Vec<String> = (0..10).map(|i| format!("f{i}")).collect();
        let title_refs: Vec<&str> = titles.iter().map(String::as_str).collect();
        let config = RunConfig {
            workers: 2,
            max_failures: Some(3),
            ..RunConfig::default()
        };
        let list = simple_list(&[("tests/m.rs", &title_refs)], &config);
        let spawner = ScriptedSpawner::new();
        for title in &titles {
            spawner.script(&id_of(&list, title), [ScriptedOutcome::Unexpected]);
        }
        let (records, stats, status) = run_scripted(&list, &config, &spawner).await;

        assert!(records
            .iter()
            .any(|r| matches!(r, Record::Cancel { reason: CancelReason::TestFailure })));
        assert_eq!(stats.failed, 3, "exactly max-failures failures");
        assert_eq!(stats.skipped, 7, "the rest is reported as skipped");
        assert_eq!(stats.finished_count, 10);
        assert_eq!(status, FinalStatus::Failed);
        assert!(records.iter().any(|r| matches!(
            r,
            Record::Skipped { reason: SkipReason::RunCancelled, .. }
        )));
    }

    #[tokio::test]
    async fn rest_of_hash_run_moves_to_a_fresh_worker_after_failure() {
        let config = RunConfig {
            workers: 2,
            ..RunConfig::default()
        };
        let list = simple_list(&[("tests/h.rs", &["bad", "good1", "good2"])], &config);
        let spawner = ScriptedSpawner::new();
        spawner.script(&id_of(&list, "bad"), [ScriptedOutcome::Unexpected]);
        let (records, stats, status) = run_scripted(&list, &config, &spawner).await;

        let started: Vec<(String, usize)> = records
            .iter()
            .filter_map(|r| match r {
                Record::Started { title, worker, .. } => Some((title.clone(), *worker)),
                _ => None,
            })
            .collect();
        assert_eq!(started[0], ("bad".to_owned(), 0));
        assert_eq!(started[1].1, 1, "carryover lands on a fresh worker");
        assert_eq!(started[2].1, 1, "and keeps streaming there");
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.passed, 2);
        assert_eq!(status, FinalStatus::Failed);
    }

    #[tokio::test]
    async fn one_worker_pool_cycles_through_hashes() {
        let config = RunConfig {
            workers: 1,
            ..RunConfig::default()
        };
        let mut reg = RootRegistry::new();
        for name in ["alpha", "beta"] {
            reg.fixture(
                name,
                crate::fixture::FixtureScope::Worker,
                Vec::<String>::new(),
                |_args| async { Ok(SetUpFixture::value(())) },
            )
            .unwrap();
        }
        let file = reg.file("tests/l.rs");
        file.spec("a1", SourceLocation::new("tests/l.rs", 1, 1), passing_body)
            .with_fixtures(["alpha"]);
        file.spec("b1", SourceLocation::new("tests/l.rs", 2, 1), passing_body)
            .with_fixtures(["beta"]);
        file.spec("a2", SourceLocation::new("tests/l.rs", 3, 1), passing_body)
            .with_fixtures(["alpha"]);
        let list = TestList::build(reg, &config).unwrap();

        let spawner = ScriptedSpawner::new();
        let (records, stats, _) = run_scripted(&list, &config, &spawner).await;

        assert_eq!(started_workers(&records), [0, 1, 2]);
        assert_eq!(
            spawner.spawned(),
            [0, 1, 2],
            "each hash change evicts the idle worker and spawns fresh"
        );
        assert_eq!(stats.passed, 3);
    }

    #[tokio::test]
    async fn skip_annotations_are_reported_without_dispatch() {
        let config = RunConfig::default();
        let mut reg = RootRegistry::new();
        let file = reg.file("tests/s.rs");
        file.spec("runs", SourceLocation::new("tests/s.rs", 1, 1), passing_body);
        file.spec("not yet", SourceLocation::new("tests/s.rs", 2, 1), passing_body)
            .annotate(Annotation::new(Annotation::SKIP));
        let list = TestList::build(reg, &config).unwrap();

        let spawner = ScriptedSpawner::new();
        let (records, stats, status) = run_scripted(&list, &config, &spawner).await;

        assert!(records.iter().any(|r| matches!(
            r,
            Record::Skipped { title, reason: SkipReason::Annotation } if title == "not yet"
        )));
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(status, FinalStatus::Passed);
    }
}
