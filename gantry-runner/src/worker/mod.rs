// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker runtime: executes assigned tests inside a child process.

mod runtime;
mod store;

pub use runtime::*;
pub(crate) use store::*;

use crate::{
    config::Project,
    errors::TestFailure,
    fixture::FixtureValue,
    ipc::StdioStream,
    store::SnapshotStore,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{any::Any, collections::HashMap, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

/// The context handed to every test body.
///
/// Carries the resolved fixture values, the project, the per-attempt output
/// directory, the snapshot store, and the sanctioned output handles. Output
/// written through [`TestContext::write_stdout`] and
/// [`TestContext::write_stderr`] is attributed to the test; raw `println!`
/// would corrupt the worker's frame stream instead.
#[derive(Clone)]
pub struct TestContext {
    pub(crate) fixtures: HashMap<String, FixtureValue>,
    pub(crate) project: Project,
    pub(crate) worker_index: usize,
    pub(crate) retry: usize,
    pub(crate) output_dir: Utf8PathBuf,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) cache_dir: Option<Utf8PathBuf>,
    pub(crate) stdio_tx: UnboundedSender<(StdioStream, String)>,
}

impl TestContext {
    /// Returns a fixture value, downcast to its concrete type.
    ///
    /// The fixture must be declared in the spec's fixture list.
    pub fn fixture<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, TestFailure> {
        let value = self.fixtures.get(name).ok_or_else(|| {
            TestFailure::msg(format!(
                "fixture `{name}` is not declared for this test"
            ))
        })?;
        Arc::clone(value)
            .downcast::<T>()
            .map_err(|_| TestFailure::msg(format!("fixture `{name}` has a different type")))
    }

    /// The project this test runs under.
    pub fn project(&self) -> &Project {
        &self.project
    }

    /// The index of the worker executing this test.
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// The retry number of this attempt (0 for the first attempt).
    pub fn retry(&self) -> usize {
        self.retry
    }

    /// The per-attempt output directory. Created before the body runs and
    /// never shared with another test.
    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    /// The cache directory communicated by the parent, if any.
    pub fn cache_dir(&self) -> Option<&Utf8Path> {
        self.cache_dir.as_deref()
    }

    /// Compares `actual` against the named snapshot, or updates it when the
    /// run was started with `--update-snapshots`.
    pub fn snapshot(&self, name: &str, actual: &[u8]) -> Result<(), TestFailure> {
        self.snapshots.check(name, actual).map_err(TestFailure::from)
    }

    /// Writes a chunk to the test's captured stdout.
    pub fn write_stdout(&self, data: impl Into<String>) {
        // Failure means the attempt is being abandoned; drop the chunk.
        let _ = self.stdio_tx.send((StdioStream::Stdout, data.into()));
    }

    /// Writes a chunk to the test's captured stderr.
    pub fn write_stderr(&self, data: impl Into<String>) {
        let _ = self.stdio_tx.send((StdioStream::Stderr, data.into()));
    }
}
