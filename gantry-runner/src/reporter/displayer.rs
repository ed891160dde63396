// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Console reporters: `list`, `line`, and `dot`.

use super::{Reporter, RunOutcome};
use crate::{
    helpers::plural_tests,
    list::TestInstance,
    reporter::events::{TestResult, TestStatus},
};
use owo_colors::{OwoColorize, Style};
use std::{io::Write, time::Duration};

/// Styles for console output, applied only when colorization is on.
#[derive(Clone, Debug, Default)]
struct Styles {
    pass: Style,
    fail: Style,
    skip: Style,
    flaky: Style,
    count: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.pass = Style::new().green();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow();
        self.flaky = Style::new().magenta();
        self.count = Style::new().bold();
    }
}

fn status_word(test: &TestInstance<'_>, result: &TestResult) -> (&'static str, StatusClass) {
    if result.status == TestStatus::Skipped {
        return ("SKIP", StatusClass::Skip);
    }
    let ok = result.status == test.case.expected_status;
    if ok && result.attempt > 0 {
        ("FLAKY", StatusClass::Flaky)
    } else if ok {
        ("PASS", StatusClass::Pass)
    } else {
        match result.status {
            TestStatus::TimedOut => ("TIMEOUT", StatusClass::Fail),
            TestStatus::Interrupted => ("INTERRUPTED", StatusClass::Skip),
            _ => ("FAIL", StatusClass::Fail),
        }
    }
}

#[derive(Clone, Copy)]
enum StatusClass {
    Pass,
    Fail,
    Skip,
    Flaky,
}

impl StatusClass {
    fn style(self, styles: &Styles) -> Style {
        match self {
            StatusClass::Pass => styles.pass,
            StatusClass::Fail => styles.fail,
            StatusClass::Skip => styles.skip,
            StatusClass::Flaky => styles.flaky,
        }
    }
}

fn display_secs(duration: Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}

fn write_summary(
    writer: &mut (dyn Write + Send),
    styles: &Styles,
    outcome: &RunOutcome,
) -> std::io::Result<()> {
    let stats = outcome.stats;
    let mut parts = vec![format!("{} passed", stats.passed.style(styles.pass))];
    if stats.flaky > 0 {
        parts.push(format!("{} flaky", stats.flaky.style(styles.flaky)));
    }
    if stats.failed > 0 {
        parts.push(format!("{} failed", stats.failed.style(styles.fail)));
    }
    if stats.timed_out > 0 {
        parts.push(format!("{} timed out", stats.timed_out.style(styles.fail)));
    }
    if stats.interrupted > 0 {
        parts.push(format!(
            "{} interrupted",
            stats.interrupted.style(styles.skip)
        ));
    }
    if stats.skipped > 0 {
        parts.push(format!("{} skipped", stats.skipped.style(styles.skip)));
    }
    writeln!(
        writer,
        "Summary [{:>9}] {} {} run: {}",
        display_secs(outcome.elapsed),
        stats.finished_count.style(styles.count),
        plural_tests(stats.finished_count),
        parts.join(", "),
    )
}

/// One line per finished attempt, with failure details inline.
pub struct ListReporter {
    writer: Box<dyn Write + Send>,
    styles: Styles,
}

impl ListReporter {
    /// Creates a list reporter writing to `writer`.
    pub fn new(writer: Box<dyn Write + Send>, colorize: bool) -> Self {
        let mut styles = Styles::default();
        if colorize {
            styles.colorize();
        }
        Self { writer, styles }
    }
}

impl Reporter for ListReporter {
    fn on_test_end(&mut self, test: &TestInstance<'_>, result: &TestResult) {
        let (word, class) = status_word(test, result);
        let _ = writeln!(
            self.writer,
            "{:>12} [{:>9}] {}",
            word.style(class.style(&self.styles)),
            display_secs(result.duration),
            test.name(),
        );
        if result.status != test.case.expected_status {
            if let Some(error) = &result.error {
                let _ = writeln!(self.writer, "             {}", error.message);
            }
            for chunk in result.stdout.iter().chain(&result.stderr) {
                for line in chunk.lines() {
                    let _ = writeln!(self.writer, "             | {line}");
                }
            }
        }
    }

    fn on_end(&mut self, outcome: &RunOutcome) {
        let _ = write_summary(&mut *self.writer, &self.styles, outcome);
    }
}

/// A compact line per finished attempt, without failure details.
pub struct LineReporter {
    writer: Box<dyn Write + Send>,
    styles: Styles,
}

impl LineReporter {
    /// Creates a line reporter writing to `writer`.
    pub fn new(writer: Box<dyn Write + Send>, colorize: bool) -> Self {
        let mut styles = Styles::default();
        if colorize {
            styles.colorize();
        }
        Self { writer, styles }
    }
}

impl Reporter for LineReporter {
    fn on_test_end(&mut self, test: &TestInstance<'_>, result: &TestResult) {
        let (word, class) = status_word(test, result);
        let _ = writeln!(
            self.writer,
            "{}: {}",
            test.name(),
            word.style(class.style(&self.styles)),
        );
    }

    fn on_end(&mut self, outcome: &RunOutcome) {
        let _ = write_summary(&mut *self.writer, &self.styles, outcome);
    }
}

/// One character per finished attempt.
pub struct DotReporter {
    writer: Box<dyn Write + Send>,
    styles: Styles,
    column: usize,
}

const DOT_WRAP: usize = 80;

impl DotReporter {
    /// Creates a dot reporter writing to `writer`.
    pub fn new(writer: Box<dyn Write + Send>, colorize: bool) -> Self {
        let mut styles = Styles::default();
        if colorize {
            styles.colorize();
        }
        Self {
            writer,
            styles,
            column: 0,
        }
    }
}

impl Reporter for DotReporter {
    fn on_test_end(&mut self, test: &TestInstance<'_>, result: &TestResult) {
        let (_, class) = status_word(test, result);
        let dot = match class {
            StatusClass::Pass => ".",
            StatusClass::Flaky => "!",
            StatusClass::Skip => "-",
            StatusClass::Fail => "F",
        };
        let _ = write!(self.writer, "{}", dot.style(class.style(&self.styles)));
        self.column += 1;
        if self.column >= DOT_WRAP {
            self.column = 0;
            let _ = writeln!(self.writer);
        }
        let _ = self.writer.flush();
    }

    fn on_end(&mut self, outcome: &RunOutcome) {
        if self.column > 0 {
            let _ = writeln!(self.writer);
        }
        let _ = write_summary(&mut *self.writer, &self.styles, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RunConfig,
        errors::TestFailure,
        list::{RootRegistry, SourceLocation, TestList},
        reporter::events::{FinalStatus, RunStats},
        worker::TestContext,
    };
    use chrono::Local;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn fixture() -> (TestList, RunConfig) {
        let config = RunConfig::default();
        let mut reg = RootRegistry::new();
        reg.file("tests/d.rs").spec(
            "renders",
            SourceLocation::new("tests/d.rs", 1, 1),
            |_ctx: TestContext| async { Ok::<(), TestFailure>(()) },
        );
        (TestList::build(reg, &config).unwrap(), config)
    }

    fn passed_result() -> TestResult {
        TestResult {
            attempt: 0,
            retry: 0,
            worker_index: Some(0),
            start_time: Local::now().fixed_offset(),
            duration: Duration::from_millis(1500),
            status: TestStatus::Passed,
            error: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    #[test]
    fn list_reporter_prints_status_lines_and_summary() {
        let (list, _config) = fixture();
        let instance = list.iter_instances().next().unwrap();
        let buf = SharedBuf::default();
        let mut reporter = ListReporter::new(Box::new(buf.clone()), false);

        reporter.on_test_end(&instance, &passed_result());
        reporter.on_end(&RunOutcome {
            status: FinalStatus::Passed,
            stats: RunStats {
                finished_count: 1,
                passed: 1,
                initial_run_count: 1,
                ..RunStats::default()
            },
            elapsed: Duration::from_secs(2),
        });

        let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("PASS"), "status word present: {output}");
        assert!(output.contains("[default] tests/d.rs renders"));
        assert!(output.contains("1 test run: 1 passed"));
    }

    #[test]
    fn dot_reporter_prints_one_char_per_test() {
        let (list, _config) = fixture();
        let instance = list.iter_instances().next().unwrap();
        let buf = SharedBuf::default();
        let mut reporter = DotReporter::new(Box::new(buf.clone()), false);

        for _ in 0..3 {
            reporter.on_test_end(&instance, &passed_result());
        }
        reporter.on_end(&RunOutcome {
            status: FinalStatus::Passed,
            stats: RunStats {
                finished_count: 3,
                passed: 3,
                initial_run_count: 3,
                ..RunStats::default()
            },
            elapsed: Duration::from_secs(1),
        });

        let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(output.starts_with("..."), "three dots: {output}");
    }
}
