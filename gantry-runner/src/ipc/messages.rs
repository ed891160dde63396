// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::RunConfig,
    fixture::FixtureHash,
    list::TestId,
    reporter::events::{ErrorSummary, TestStatus},
};
use serde::{Deserialize, Serialize};

/// Messages sent from the dispatcher to a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ParentMessage {
    /// Sent once, immediately after spawn.
    Init(WorkerInit),

    /// Run one test. Sent only after the previous test's `TestEnd`.
    Run(RunRequest),

    /// Tear down worker fixtures and exit.
    Stop {},
}

/// The payload of [`ParentMessage::Init`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInit {
    /// This worker's index, unique within the run.
    pub worker_index: usize,

    /// Index of the project this worker is bound to.
    pub project_index: usize,

    /// The run configuration; the worker rebuilds the test tree from it.
    pub config: RunConfig,

    /// The fixture hash this worker is bound to. Every test dispatched here
    /// must carry the same hash.
    pub fixture_hash: FixtureHash,
}

/// The payload of [`ParentMessage::Run`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// The test to run.
    pub test_id: TestId,

    /// Per-attempt timeout in milliseconds. Zero disables the timeout.
    pub timeout_ms: u64,

    /// The retry number of this attempt (0 for the first attempt).
    pub retry: usize,

    /// The status the test is expected to end with.
    pub expected_status: TestStatus,
}

/// Messages sent from a worker to the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// The worker processed `Init` and is ready for requests.
    Ready {},

    /// A test attempt began.
    TestBegin {
        /// The test.
        test_id: TestId,
    },

    /// A test produced output.
    Stdio {
        /// The test.
        test_id: TestId,
        /// Which stream was written to.
        stream: StdioStream,
        /// The output chunk.
        data: String,
    },

    /// A test attempt finished.
    TestEnd {
        /// The test.
        test_id: TestId,
        /// The attempt status.
        status: TestStatus,
        /// The error that ended the attempt, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorSummary>,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },

    /// A fixture teardown failed outside a test's lifetime.
    TeardownError {
        /// The error.
        error: ErrorSummary,
    },

    /// The worker has no more work in flight. With `pending_worker` set the
    /// worker is retiring after a failure and waits for `Stop`.
    Done {
        /// Whether the worker is waiting to be stopped.
        pending_worker: bool,
    },
}

/// An output stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StdioStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}
