// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events emitted during a test run.
//!
//! The dispatcher serializes these events and hands them to the
//! [`EventAggregator`](crate::reporter::EventAggregator), which fans them
//! out to reporters.

use crate::{
    ipc::StdioStream,
    list::TestInstance,
};
use chrono::{DateTime, FixedOffset};
use gantry_metadata::GantryExitCode;
use std::time::Duration;

pub use gantry_metadata::ErrorSummary;
/// The status of a test attempt or of a finished test.
pub use gantry_metadata::StatusSummary as TestStatus;

/// A run event along with when it happened.
#[derive(Clone, Debug)]
pub struct RunEvent<'a> {
    /// Wall-clock timestamp of the event.
    pub timestamp: DateTime<FixedOffset>,

    /// Time elapsed since the start of dispatch.
    pub elapsed: Duration,

    /// What happened.
    pub kind: RunEventKind<'a>,
}

/// The different kinds of events.
#[derive(Clone, Debug)]
pub enum RunEventKind<'a> {
    /// The run started.
    RunStarted {
        /// The number of planned tests, skipped entries included.
        test_count: usize,

        /// The worker pool size.
        workers: usize,
    },

    /// An attempt of a test began executing on a worker.
    TestStarted {
        /// The test.
        instance: TestInstance<'a>,

        /// The retry number of this attempt (0 for the first attempt).
        retry: usize,

        /// The worker the attempt runs on.
        worker_index: usize,
    },

    /// A test produced output.
    TestStdio {
        /// The test.
        instance: TestInstance<'a>,

        /// Which stream the output was written to.
        stream: StdioStream,

        /// The output chunk.
        data: String,
    },

    /// An attempt failed and the test will be retried.
    TestAttemptFailedWillRetry {
        /// The test.
        instance: TestInstance<'a>,

        /// The failed attempt.
        result: TestResult,
    },

    /// A test finished; no further attempts will run.
    TestFinished {
        /// The test.
        instance: TestInstance<'a>,

        /// Every attempt, in order.
        statuses: ExecutionStatuses,

        /// Run statistics after this test.
        current_stats: RunStats,

        /// The number of tests still executing.
        running: usize,
    },

    /// A planned test will not run.
    TestSkipped {
        /// The test.
        instance: TestInstance<'a>,

        /// Why it was skipped.
        reason: SkipReason,
    },

    /// A run-level error not attributable to a single test, e.g. a
    /// worker-fixture teardown failure after the worker's last test was
    /// finalized.
    RunError {
        /// The error.
        error: ErrorSummary,
    },

    /// Cancellation of the run has begun.
    RunBeginCancel {
        /// The number of tests still executing.
        running: usize,

        /// Why the run is being cancelled.
        reason: CancelReason,
    },

    /// The run finished.
    RunFinished {
        /// When dispatch started.
        start_time: DateTime<FixedOffset>,

        /// Total wall-clock time.
        elapsed: Duration,

        /// Final statistics.
        run_stats: RunStats,

        /// The overall outcome.
        status: FinalStatus,
    },
}

/// The result of a single test attempt.
#[derive(Clone, Debug)]
pub struct TestResult {
    /// 0-based attempt counter.
    pub attempt: usize,

    /// The retry number; equal to `attempt`.
    pub retry: usize,

    /// The worker the attempt ran on. `None` when the test never reached a
    /// worker (skipped tests).
    pub worker_index: Option<usize>,

    /// When the attempt started.
    pub start_time: DateTime<FixedOffset>,

    /// Wall-clock duration of the attempt.
    pub duration: Duration,

    /// The attempt status.
    pub status: TestStatus,

    /// The error that ended the attempt, if any.
    pub error: Option<ErrorSummary>,

    /// Captured stdout chunks.
    pub stdout: Vec<String>,

    /// Captured stderr chunks.
    pub stderr: Vec<String>,
}

impl TestResult {
    /// Whether this attempt matched the expected status.
    pub fn is_expected(&self, expected: TestStatus) -> bool {
        self.status == expected
    }
}

/// Every attempt of one test, in attempt order. Non-empty.
#[derive(Clone, Debug)]
pub struct ExecutionStatuses {
    statuses: Vec<TestResult>,
}

impl ExecutionStatuses {
    pub(crate) fn new(statuses: Vec<TestResult>) -> Self {
        debug_assert!(!statuses.is_empty(), "at least one attempt is required");
        Self { statuses }
    }

    /// The number of attempts.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Whether there are no attempts. Always false in practice.
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// The last attempt.
    pub fn last_status(&self) -> &TestResult {
        self.statuses.last().expect("non-empty by construction")
    }

    /// All attempts in order.
    pub fn iter(&self) -> impl Iterator<Item = &TestResult> + '_ {
        self.statuses.iter()
    }

    /// The status a reporter should show for the whole test: the last
    /// attempt's status, promoted to [`TestStatus::Flaky`] when an earlier
    /// attempt missed the expectation and a retry met it.
    pub fn final_status(&self, expected: TestStatus) -> TestStatus {
        let last = self.last_status();
        if last.is_expected(expected) && self.statuses.len() > 1 {
            TestStatus::Flaky
        } else {
            last.status
        }
    }
}

/// Why a test was not dispatched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// The spec carries a `skip` annotation.
    Annotation,

    /// The run was cancelled before the test started.
    RunCancelled,
}

/// Why a run is being cancelled. Variants are ordered by precedence: a
/// cancellation may upgrade to a later reason but never downgrade.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CancelReason {
    /// The `max_failures` limit was reached.
    TestFailure,

    /// The global timeout elapsed.
    GlobalTimeout,

    /// A shutdown signal arrived.
    Signal,
}

/// The overall outcome of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinalStatus {
    /// Every test met its expectation (possibly after retries).
    Passed,

    /// At least one test missed its expectation.
    Failed,

    /// The run hit its global timeout.
    TimedOut,

    /// The run was interrupted by a signal.
    Interrupted,
}

impl FinalStatus {
    /// The process exit code for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            FinalStatus::Passed => GantryExitCode::OK,
            FinalStatus::Failed | FinalStatus::TimedOut => GantryExitCode::TEST_RUN_FAILED,
            FinalStatus::Interrupted => GantryExitCode::INTERRUPTED,
        }
    }
}

/// Statistics for a test run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The number of tests expected to run at the beginning. More than
    /// `finished_count` if the run was cancelled.
    pub initial_run_count: usize,

    /// The number of tests that finished (or were skipped).
    pub finished_count: usize,

    /// Tests that met their expectation on the first attempt.
    pub passed: usize,

    /// Tests that met their expectation on a retry.
    pub flaky: usize,

    /// Tests that missed their expectation on every attempt.
    pub failed: usize,

    /// Tests whose last attempt timed out.
    pub timed_out: usize,

    /// Tests that never ran.
    pub skipped: usize,

    /// Tests that were executing when the run was cancelled.
    pub interrupted: usize,
}

impl RunStats {
    /// Whether any test missed its expectation.
    pub fn has_failures(&self) -> bool {
        self.failed_count() > 0
    }

    /// The number of tests counted against `max_failures`.
    pub fn failed_count(&self) -> usize {
        self.failed + self.timed_out
    }

    pub(crate) fn on_test_finished(&mut self, statuses: &ExecutionStatuses, expected: TestStatus) {
        self.finished_count += 1;
        let last = statuses.last_status();
        if last.is_expected(expected) {
            if statuses.len() > 1 {
                self.flaky += 1;
            } else {
                self.passed += 1;
            }
        } else {
            match last.status {
                TestStatus::TimedOut => self.timed_out += 1,
                TestStatus::Interrupted => self.interrupted += 1,
                _ => self.failed += 1,
            }
        }
    }

    pub(crate) fn on_test_skipped(&mut self) {
        self.finished_count += 1;
        self.skipped += 1;
    }

    /// Summarizes the run as a [`FinalStatus`].
    pub fn summarize_final(&self, cancel_reason: Option<CancelReason>) -> FinalStatus {
        match cancel_reason {
            Some(CancelReason::Signal) => FinalStatus::Interrupted,
            Some(CancelReason::GlobalTimeout) => FinalStatus::TimedOut,
            Some(CancelReason::TestFailure) => FinalStatus::Failed,
            None => {
                if self.has_failures() {
                    FinalStatus::Failed
                } else {
                    FinalStatus::Passed
                }
            }
        }
    }
}
