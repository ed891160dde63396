// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine-readable reporters: JSON and JUnit.

use super::Reporter;
use crate::errors::WriteEventError;
use camino::Utf8PathBuf;
use gantry_metadata::{ReportSummary, SpecSummary, StatusSummary, SuiteSummary, TestSummary};
use quick_junit::{
    NonSuccessKind, Report, ReportUuid, TestCase, TestCaseStatus, TestRerun, TestSuite,
};
use std::{io::Write, time::Duration};

/// Serializes the report as pretty-printed JSON.
pub struct JsonReporter {
    writer: Box<dyn Write + Send>,
}

impl JsonReporter {
    /// Creates a JSON reporter writing to `writer`.
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self { writer }
    }
}

impl Reporter for JsonReporter {
    fn on_report(&mut self, report: &ReportSummary) -> Result<(), WriteEventError> {
        serde_json::to_writer_pretty(&mut self.writer, report)?;
        writeln!(self.writer)?;
        Ok(())
    }
}

/// Writes a JUnit XML report via `quick-junit`.
pub struct JunitReporter {
    path: Utf8PathBuf,
}

impl JunitReporter {
    /// Creates a JUnit reporter writing to `path`.
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }
}

impl Reporter for JunitReporter {
    fn on_report(&mut self, report: &ReportSummary) -> Result<(), WriteEventError> {
        let mut junit = Report::new("gantry-run");
        junit.set_report_uuid(ReportUuid::new_v4());

        for suite in &report.suites {
            let mut test_suite = TestSuite::new(suite.title.clone());
            add_suite_cases(&mut test_suite, suite);
            junit.add_test_suite(test_suite);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(&self.path)?;
        junit
            .serialize(file)
            .map_err(|error| WriteEventError::Junit {
                file: self.path.clone(),
                error,
            })?;
        Ok(())
    }
}

fn add_suite_cases(test_suite: &mut TestSuite, suite: &SuiteSummary) {
    for spec in &suite.specs {
        for test in &spec.tests {
            test_suite.add_test_case(test_case(spec, test));
        }
    }
    for child in &suite.suites {
        add_suite_cases(test_suite, child);
    }
}

fn test_case(spec: &SpecSummary, test: &TestSummary) -> TestCase {
    let name = format!("{} ({})", spec.title, test.project_name);
    let Some(last) = test.results.last() else {
        // Never dispatched.
        let mut status = TestCaseStatus::skipped();
        status.set_message("test did not run");
        return TestCase::new(name, status);
    };

    let ok = last.status == test.expected_status;
    let mut status = if last.status == StatusSummary::Skipped {
        TestCaseStatus::skipped()
    } else if ok {
        TestCaseStatus::success()
    } else {
        let kind = match last.status {
            StatusSummary::TimedOut => NonSuccessKind::Failure,
            StatusSummary::Interrupted => NonSuccessKind::Error,
            _ => NonSuccessKind::Failure,
        };
        let mut status = TestCaseStatus::non_success(kind);
        if let Some(error) = &last.error {
            status.set_message(error.message.clone());
        }
        status
    };

    // Earlier attempts are reruns; they are failures by construction.
    for result in &test.results[..test.results.len() - 1] {
        let kind = match result.status {
            StatusSummary::Interrupted => NonSuccessKind::Error,
            _ => NonSuccessKind::Failure,
        };
        let mut rerun = TestRerun::new(kind);
        rerun.set_time(Duration::from_millis(result.duration_ms));
        if let Some(error) = &result.error {
            rerun.set_message(error.message.clone());
        }
        status.add_rerun(rerun);
    }

    let mut case = TestCase::new(name, status);
    case.set_time(Duration::from_millis(last.duration_ms));
    if !last.stdout.is_empty() {
        case.set_system_out(last.stdout.concat());
    }
    if !last.stderr.is_empty() {
        case.set_system_err(last.stderr.concat());
    }
    case
}
