// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! gantry is a parallel test runner: test binaries register suites, specs
//! and fixtures through [`RootRegistry`], and gantry plans an execution
//! schedule, spawns isolated worker subprocesses, and aggregates results.
//!
//! A minimal harness binary:
//!
//! ```no_run
//! use gantry::{here, FixtureScope, RootRegistry, SetUpFixture};
//!
//! fn main() {
//!     gantry::main_with(|registry: &mut RootRegistry| {
//!         registry.fixture("server", FixtureScope::Worker, Vec::<String>::new(), |_args| async {
//!             Ok(SetUpFixture::value("http://localhost:8080".to_owned()))
//!         })?;
//!
//!         let file = registry.file("tests/smoke.rs");
//!         file.spec("server responds", here!(), |ctx| async move {
//!             let server: std::sync::Arc<String> = ctx.fixture("server")?;
//!             ctx.write_stdout(format!("pinging {server}\n"));
//!             Ok(())
//!         })
//!         .with_fixtures(["server"]);
//!         Ok(())
//!     });
//! }
//! ```

mod cli;

pub use gantry_metadata::GantryExitCode;
pub use gantry_runner::{
    config::{Project, RunConfig, ShardSpec},
    errors::{LoaderError, TestFailure},
    fixture::{FixtureArgs, FixtureScope, SetUpFixture},
    list::{Annotation, Loader, RootRegistry, SourceLocation},
    reporter::{Reporter, ReporterKind},
    worker::TestContext,
};

/// The [`SourceLocation`] of the call site.
#[macro_export]
macro_rules! here {
    () => {
        $crate::SourceLocation::new(file!(), line!(), column!())
    };
}

/// The entry point for a gantry harness binary: dispatches to the worker
/// runtime when spawned as a worker, otherwise parses the CLI and runs.
/// Never returns.
pub fn main_with(loader: impl Loader + 'static) -> ! {
    std::process::exit(run_with(&loader));
}

/// Like [`main_with`], but returns the exit code instead of exiting.
pub fn run_with(loader: &dyn Loader) -> i32 {
    if gantry_runner::worker::is_worker_process() {
        return gantry_runner::worker::worker_main(loader);
    }
    cli::parse_and_exec(loader)
}
