// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by gantry.

use crate::list::SourceLocation;
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{error, fmt, io};

/// The gantry config file could not be loaded.
///
/// The underlying reason is folded into the message: config mistakes are
/// user-facing and should read as one line, not as an error chain.
#[derive(Debug)]
pub struct ConfigParseError {
    path: Utf8PathBuf,
    reason: ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, reason: ConfigError) -> Self {
        Self {
            path: path.into(),
            reason,
        }
    }

    /// The config file that failed to load.
    pub fn path(&self) -> &camino::Utf8Path {
        &self.path
    }
}

impl fmt::Display for ConfigParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "config file `{}` is invalid: {}", self.path, self.reason)
    }
}

impl error::Error for ConfigParseError {}

/// Error returned while parsing a `--shard=c/t` value.
#[derive(Clone, Debug)]
pub struct ShardParseError {
    message: String,
}

impl ShardParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ShardParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "invalid shard specification (expected the format C/T): {}",
            self.message
        )
    }
}

impl error::Error for ShardParseError {}

/// An error that occurred while setting up signal handling.
#[derive(Debug, thiserror::Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] io::Error);

/// A fixture with this name has already been registered.
#[derive(Clone, Debug)]
pub struct DuplicateFixtureError {
    name: String,
}

impl DuplicateFixtureError {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The duplicated fixture name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DuplicateFixtureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "fixture `{}` is already registered", self.name)
    }
}

impl error::Error for DuplicateFixtureError {}

/// An error in the fixture dependency graph, detected while sealing the
/// registry.
#[derive(Clone, Debug)]
pub enum FixtureGraphError {
    /// A fixture depends on a name that is not registered.
    UnknownFixture {
        /// The missing dependency.
        name: String,
        /// The fixture that declared it.
        required_by: String,
    },

    /// A worker-scope fixture depends on a test-scope fixture.
    InvalidScope {
        /// The worker-scope fixture.
        fixture: String,
        /// The test-scope dependency.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    Cycle {
        /// The fixtures on the cycle, in dependency order.
        path: Vec<String>,
    },
}

impl fmt::Display for FixtureGraphError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownFixture { name, required_by } => {
                write!(
                    f,
                    "fixture `{required_by}` depends on `{name}`, which is not registered"
                )
            }
            Self::InvalidScope {
                fixture,
                dependency,
            } => {
                write!(
                    f,
                    "worker fixture `{fixture}` depends on test fixture `{dependency}`"
                )
            }
            Self::Cycle { path } => {
                write!(f, "fixture dependency cycle: {}", path.join(" -> "))
            }
        }
    }
}

impl error::Error for FixtureGraphError {}

/// An error that occurred while building the test tree.
#[derive(Debug)]
pub enum TreeBuildError {
    /// A spec is marked `only` while `forbid_only` is set.
    ForbiddenOnly {
        /// The offending spec title.
        spec: String,
        /// Where the spec was declared.
        location: SourceLocation,
    },

    /// The fixture graph is invalid.
    Fixtures(FixtureGraphError),

    /// A spec references a fixture that is not registered.
    UnknownFixtureRef {
        /// The spec title.
        spec: String,
        /// Where the spec was declared.
        location: SourceLocation,
        /// The missing fixture name.
        fixture: String,
    },
}

impl fmt::Display for TreeBuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ForbiddenOnly { spec, location } => {
                write!(
                    f,
                    "spec `{spec}` at {location} is marked `only`, which is forbidden"
                )
            }
            Self::Fixtures(_) => {
                write!(f, "invalid fixture graph")
            }
            Self::UnknownFixtureRef {
                spec,
                location,
                fixture,
            } => {
                write!(
                    f,
                    "spec `{spec}` at {location} references unknown fixture `{fixture}`"
                )
            }
        }
    }
}

impl error::Error for TreeBuildError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Fixtures(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FixtureGraphError> for TreeBuildError {
    fn from(err: FixtureGraphError) -> Self {
        Self::Fixtures(err)
    }
}

/// An error that occurred while planning a run.
#[derive(Debug)]
pub enum PlanError {
    /// The grep filter is not a valid regex.
    InvalidGrep {
        /// The pattern as given.
        pattern: String,
        /// The underlying regex error.
        error: regex::Error,
    },

    /// A project's `test_match` or `test_ignore` pattern is not a valid
    /// regex.
    InvalidTestPattern {
        /// The project the pattern came from.
        project: String,
        /// The pattern as given.
        pattern: String,
        /// The underlying regex error.
        error: regex::Error,
    },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidGrep { pattern, .. } => {
                write!(f, "invalid grep pattern `{pattern}`")
            }
            Self::InvalidTestPattern {
                project, pattern, ..
            } => {
                write!(
                    f,
                    "invalid test file pattern `{pattern}` in project `{project}`"
                )
            }
        }
    }
}

impl error::Error for PlanError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::InvalidGrep { error, .. } | Self::InvalidTestPattern { error, .. } => {
                Some(error)
            }
        }
    }
}

/// An error produced by a [`Loader`](crate::list::Loader) while registering
/// tests.
#[derive(Debug)]
pub struct LoaderError {
    message: String,
    file: Option<Utf8PathBuf>,
}

impl LoaderError {
    /// Creates a new loader error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
        }
    }

    /// Attributes the error to a file.
    pub fn with_file(mut self, file: impl Into<Utf8PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// The file this error is attributed to, if known.
    pub fn file(&self) -> Option<&Utf8PathBuf> {
        self.file.as_ref()
    }
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "failed to load `{file}`: {}", self.message),
            None => write!(f, "failed to load tests: {}", self.message),
        }
    }
}

impl error::Error for LoaderError {}

impl From<DuplicateFixtureError> for LoaderError {
    fn from(err: DuplicateFixtureError) -> Self {
        LoaderError::new(err.to_string())
    }
}

/// A failure raised by a test body or fixture body.
///
/// This is a payload, not a `std::error::Error`: user code produces it from
/// messages or from other errors and the runner records it verbatim.
#[derive(Clone, Debug)]
pub struct TestFailure {
    message: String,
}

impl TestFailure {
    /// Creates a failure from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Creates a failure from any displayable error.
    pub fn from_error(error: impl fmt::Display) -> Self {
        Self {
            message: error.to_string(),
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for TestFailure {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

impl From<String> for TestFailure {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// An error on the worker IPC channel.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Reading or writing the underlying pipe failed.
    #[error("worker pipe error")]
    Io(#[from] io::Error),

    /// A frame could not be encoded or decoded.
    #[error("failed to encode or decode an IPC frame")]
    Codec(#[from] serde_json::Error),

    /// A frame exceeded the maximum permitted length.
    #[error("IPC frame of {len} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge {
        /// The length in the frame header.
        len: u32,
        /// The maximum permitted length.
        max: u32,
    },
}

/// An error that occurred while spawning a worker process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The current executable path could not be determined.
    #[error("failed to determine the current executable")]
    CurrentExe(#[source] io::Error),

    /// The worker process could not be started.
    #[error("failed to spawn worker process")]
    Spawn(#[source] io::Error),
}

/// An error while building a [`Runner`](crate::runner::Runner).
#[derive(Debug, thiserror::Error)]
pub enum RunnerBuildError {
    /// The tokio runtime could not be created.
    #[error("failed to create tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),

    /// Signal handling could not be set up.
    #[error("failed to set up signal handling")]
    SignalHandler(#[from] SignalHandlerSetupError),

    /// The worker program (the current executable) could not be resolved.
    #[error("failed to resolve the worker program")]
    WorkerProgram(#[source] SpawnError),
}

/// A snapshot comparison failure.
#[derive(Debug)]
pub enum SnapshotError {
    /// The snapshot file does not exist and updates are disabled.
    Missing {
        /// The expected snapshot path.
        path: Utf8PathBuf,
    },

    /// The actual contents differ from the snapshot.
    Mismatch {
        /// The snapshot path.
        path: Utf8PathBuf,
    },

    /// Reading or writing the snapshot failed.
    Io {
        /// The snapshot path.
        path: Utf8PathBuf,
        /// The underlying error.
        error: io::Error,
    },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Missing { path } => {
                write!(
                    f,
                    "snapshot `{path}` does not exist; rerun with --update-snapshots to create it"
                )
            }
            Self::Mismatch { path } => {
                write!(f, "actual output differs from snapshot `{path}`")
            }
            Self::Io { path, .. } => {
                write!(f, "error accessing snapshot `{path}`")
            }
        }
    }
}

impl error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<SnapshotError> for TestFailure {
    fn from(err: SnapshotError) -> Self {
        TestFailure::msg(DisplayErrorChain::new(&err).to_string())
    }
}

/// An error that occurred while a reporter wrote an event.
#[derive(Debug, thiserror::Error)]
pub enum WriteEventError {
    /// Writing to the output stream failed.
    #[error("error writing to output")]
    Io(#[from] io::Error),

    /// Serializing the JSON report failed.
    #[error("error serializing JSON report")]
    Json(#[from] serde_json::Error),

    /// Writing the JUnit report failed.
    #[error("error writing JUnit report to `{file}`")]
    Junit {
        /// The report path.
        file: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: quick_junit::SerializeError,
    },
}

/// Renders an error and its source chain on one line, separated by colons.
pub(crate) struct DisplayErrorChain<E>(E);

impl<E: error::Error> DisplayErrorChain<E> {
    pub(crate) fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}
