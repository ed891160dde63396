// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints out and aggregates test run events.
//!
//! The dispatcher produces a serialized event stream; the
//! [`EventAggregator`] normalizes it into the five reporter hooks and the
//! serializable report.

mod aggregator;
mod displayer;
pub mod events;
mod structured;

pub use aggregator::*;
pub use displayer::*;
pub use structured::*;

use crate::{
    config::RunConfig,
    errors::WriteEventError,
    ipc::StdioStream,
    list::{TestInstance, TestList},
    reporter::events::{FinalStatus, RunStats, TestResult},
};
use camino::Utf8Path;
use clap::ValueEnum;
use gantry_metadata::ReportSummary;
use std::time::Duration;

/// The final outcome handed to [`Reporter::on_end`].
#[derive(Clone, Copy, Debug)]
pub struct RunOutcome {
    /// The overall status.
    pub status: FinalStatus,

    /// Final statistics.
    pub stats: RunStats,

    /// Total wall-clock time of the run.
    pub elapsed: Duration,
}

/// A consumer of the normalized run event stream.
///
/// `on_test_end` fires once per attempt: a retried test produces several
/// calls, the last one carrying the decisive result.
pub trait Reporter: Send {
    /// The run is about to start.
    fn on_begin(&mut self, _config: &RunConfig, _list: &TestList) {}

    /// An attempt began executing.
    fn on_test_begin(&mut self, _test: &TestInstance<'_>) {}

    /// A test produced output.
    fn on_stdio(&mut self, _test: &TestInstance<'_>, _stream: StdioStream, _chunk: &str) {}

    /// An attempt finished (or the test was skipped).
    fn on_test_end(&mut self, _test: &TestInstance<'_>, _result: &TestResult) {}

    /// The run finished.
    fn on_end(&mut self, _outcome: &RunOutcome) {}

    /// The serializable report, produced once after `on_end`.
    fn on_report(&mut self, _report: &ReportSummary) -> Result<(), WriteEventError> {
        Ok(())
    }
}

/// The reporters gantry ships with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReporterKind {
    /// One line per finished test.
    List,

    /// A compact single-line-per-test view without decorations.
    Line,

    /// One character per finished test.
    Dot,

    /// The JSON report, written to stdout at the end of the run.
    Json,

    /// A JUnit XML report, written into the output directory.
    Junit,
}

impl ReporterKind {
    /// Constructs the reporter, writing console output to stdout and file
    /// output under `output_dir`.
    pub fn build(self, output_dir: &Utf8Path, colorize: bool) -> Box<dyn Reporter> {
        match self {
            ReporterKind::List => {
                Box::new(ListReporter::new(Box::new(std::io::stdout()), colorize))
            }
            ReporterKind::Line => {
                Box::new(LineReporter::new(Box::new(std::io::stdout()), colorize))
            }
            ReporterKind::Dot => {
                Box::new(DotReporter::new(Box::new(std::io::stdout()), colorize))
            }
            ReporterKind::Json => Box::new(JsonReporter::new(Box::new(std::io::stdout()))),
            ReporterKind::Junit => Box::new(JunitReporter::new(output_dir.join("junit.xml"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_kind_value_names() {
        let names: Vec<_> = ReporterKind::value_variants()
            .iter()
            .map(|kind| {
                kind.to_possible_value()
                    .expect("no skipped variants")
                    .get_name()
                    .to_owned()
            })
            .collect();
        assert_eq!(names, ["list", "line", "dot", "json", "junit"]);
    }
}
