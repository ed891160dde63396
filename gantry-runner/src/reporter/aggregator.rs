// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalizes the dispatcher event stream into reporter hooks and the
//! serializable report.

use super::{Reporter, RunOutcome};
use crate::{
    config::RunConfig,
    list::{Suite, TestId, TestList},
    reporter::events::{RunEvent, RunEventKind, TestResult, TestStatus},
};
use gantry_metadata::{
    AnnotationSummary, ConfigSummary, ReportSummary, ResultSummary, ShardSummary, SpecSummary,
    SuiteSummary, TestSummary,
};
use std::{collections::HashMap, time::Duration};
use tracing::warn;

#[derive(Clone, Debug)]
struct Slot {
    file_index: usize,
    suite_path: Vec<usize>,
    spec_index: usize,
    test_offset: usize,
}

/// Consumes run events, drives the attached reporters, and accumulates the
/// report tree.
pub struct EventAggregator<'list> {
    config: &'list RunConfig,
    list: &'list TestList,
    reporters: Vec<Box<dyn Reporter>>,
    report: ReportSummary,
    slots: HashMap<TestId, Slot>,
}

impl<'list> EventAggregator<'list> {
    /// Builds the aggregator and the report skeleton: the full registered
    /// tree, with one (empty) test summary per planned case.
    pub fn new(
        config: &'list RunConfig,
        list: &'list TestList,
        reporters: Vec<Box<dyn Reporter>>,
    ) -> Self {
        let mut report = ReportSummary {
            config: ConfigSummary {
                workers: config.workers,
                grep: config.grep.clone(),
                shard: config.shard.map(|shard| ShardSummary {
                    current: shard.current,
                    total: shard.total,
                }),
                projects: config.projects.iter().map(|p| p.name.clone()).collect(),
            },
            suites: list.files().iter().map(suite_summary).collect(),
            errors: Vec::new(),
        };

        let mut slots = HashMap::new();
        for instance in list.iter_instances() {
            let case = instance.case;
            let spec = spec_summary_mut(
                &mut report,
                case.file_index,
                &case.suite_path,
                case.spec_index,
            );
            spec.tests.push(TestSummary {
                project_name: instance.project.name.clone(),
                expected_status: case.expected_status,
                timeout_ms: case.timeout.as_millis() as u64,
                annotations: instance
                    .spec
                    .annotations
                    .iter()
                    .map(|a| AnnotationSummary {
                        kind: a.kind.clone(),
                        description: a.description.clone(),
                    })
                    .collect(),
                results: Vec::new(),
            });
            slots.insert(
                case.id.clone(),
                Slot {
                    file_index: case.file_index,
                    suite_path: case.suite_path.clone(),
                    spec_index: case.spec_index,
                    test_offset: spec_summary_len(
                        &report,
                        case.file_index,
                        &case.suite_path,
                        case.spec_index,
                    ) - 1,
                },
            );
        }

        Self {
            config,
            list,
            reporters,
            report,
            slots,
        }
    }

    /// The accumulated report.
    pub fn report(&self) -> &ReportSummary {
        &self.report
    }

    /// Feeds one event through the reporters and into the report.
    pub fn write_event(&mut self, event: RunEvent<'_>) {
        match event.kind {
            RunEventKind::RunStarted { .. } => {
                for reporter in &mut self.reporters {
                    reporter.on_begin(self.config, self.list);
                }
            }
            RunEventKind::TestStarted { instance, .. } => {
                for reporter in &mut self.reporters {
                    reporter.on_test_begin(&instance);
                }
            }
            RunEventKind::TestStdio {
                instance,
                stream,
                data,
            } => {
                for reporter in &mut self.reporters {
                    reporter.on_stdio(&instance, stream, &data);
                }
            }
            RunEventKind::TestAttemptFailedWillRetry { instance, result } => {
                self.record_result(instance.id(), &result);
                for reporter in &mut self.reporters {
                    reporter.on_test_end(&instance, &result);
                }
            }
            RunEventKind::TestFinished {
                instance, statuses, ..
            } => {
                // Attempts that already went out as will-retry events are in
                // the report; append only what is new.
                let recorded = self.recorded_count(instance.id());
                for result in statuses.iter().skip(recorded) {
                    self.record_result(instance.id(), result);
                }
                let last = statuses.last_status();
                for reporter in &mut self.reporters {
                    reporter.on_test_end(&instance, last);
                }
            }
            RunEventKind::TestSkipped { instance, .. } => {
                let result = TestResult {
                    attempt: 0,
                    retry: 0,
                    worker_index: None,
                    start_time: event.timestamp,
                    duration: Duration::ZERO,
                    status: TestStatus::Skipped,
                    error: None,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                };
                self.record_result(instance.id(), &result);
                for reporter in &mut self.reporters {
                    reporter.on_test_end(&instance, &result);
                }
            }
            RunEventKind::RunError { error } => {
                self.report.errors.push(error);
            }
            RunEventKind::RunBeginCancel { .. } => {}
            RunEventKind::RunFinished {
                run_stats,
                status,
                elapsed,
                ..
            } => {
                let outcome = RunOutcome {
                    status,
                    stats: run_stats,
                    elapsed,
                };
                for reporter in &mut self.reporters {
                    reporter.on_end(&outcome);
                }
                for reporter in &mut self.reporters {
                    if let Err(err) = reporter.on_report(&self.report) {
                        warn!(%err, "reporter failed to write report");
                    }
                }
            }
        }
    }

    fn recorded_count(&self, id: &TestId) -> usize {
        let Some(slot) = self.slots.get(id) else {
            return 0;
        };
        let mut suite = &self.report.suites[slot.file_index];
        for &i in &slot.suite_path {
            suite = &suite.suites[i];
        }
        suite.specs[slot.spec_index].tests[slot.test_offset]
            .results
            .len()
    }

    fn record_result(&mut self, id: &TestId, result: &TestResult) {
        let Some(slot) = self.slots.get(id).cloned() else {
            warn!(%id, "result for unknown test");
            return;
        };
        let spec = spec_summary_mut(
            &mut self.report,
            slot.file_index,
            &slot.suite_path,
            slot.spec_index,
        );
        spec.tests[slot.test_offset].results.push(ResultSummary {
            worker_index: result.worker_index,
            status: result.status,
            duration_ms: result.duration.as_millis() as u64,
            error: result.error.clone(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            attempt: result.attempt,
            retry: result.retry,
        });
    }
}

fn suite_summary(suite: &Suite) -> SuiteSummary {
    SuiteSummary {
        title: suite.title.clone(),
        file: suite.file.clone(),
        specs: suite
            .specs
            .iter()
            .map(|spec| SpecSummary {
                title: spec.title.clone(),
                file: spec.location.file.clone(),
                line: spec.location.line,
                column: spec.location.column,
                tests: Vec::new(),
            })
            .collect(),
        suites: suite.suites.iter().map(suite_summary).collect(),
    }
}

fn spec_summary_mut<'r>(
    report: &'r mut ReportSummary,
    file_index: usize,
    suite_path: &[usize],
    spec_index: usize,
) -> &'r mut SpecSummary {
    let mut suite = &mut report.suites[file_index];
    for &i in suite_path {
        suite = &mut suite.suites[i];
    }
    &mut suite.specs[spec_index]
}

fn spec_summary_len(
    report: &ReportSummary,
    file_index: usize,
    suite_path: &[usize],
    spec_index: usize,
) -> usize {
    let mut suite = &report.suites[file_index];
    for &i in suite_path {
        suite = &suite.suites[i];
    }
    suite.specs[spec_index].tests.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Project,
        errors::TestFailure,
        list::{RootRegistry, SourceLocation},
        reporter::events::{ExecutionStatuses, FinalStatus, RunStats},
        worker::TestContext,
    };
    use chrono::Local;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CallLog(Arc<Mutex<Vec<String>>>);

    struct LoggingReporter(CallLog);

    impl Reporter for LoggingReporter {
        fn on_begin(&mut self, _config: &RunConfig, _list: &TestList) {
            self.0 .0.lock().unwrap().push("begin".into());
        }
        fn on_test_begin(&mut self, test: &crate::list::TestInstance<'_>) {
            self.0
                 .0
                .lock()
                .unwrap()
                .push(format!("test-begin {}", test.spec.title));
        }
        fn on_test_end(&mut self, test: &crate::list::TestInstance<'_>, result: &TestResult) {
            self.0 .0.lock().unwrap().push(format!(
                "test-end {} {}",
                test.spec.title,
                result.status.as_str()
            ));
        }
        fn on_end(&mut self, outcome: &RunOutcome) {
            self.0
                 .0
                .lock()
                .unwrap()
                .push(format!("end {:?}", outcome.status));
        }
    }

    fn sample_list(config: &RunConfig) -> TestList {
        let mut reg = RootRegistry::new();
        let file = reg.file("tests/a.rs");
        file.spec(
            "wobbly",
            SourceLocation::new("tests/a.rs", 1, 1),
            |_ctx: TestContext| async { Ok::<(), TestFailure>(()) },
        );
        TestList::build(reg, config).unwrap()
    }

    fn result(attempt: usize, status: TestStatus, worker: usize) -> TestResult {
        TestResult {
            attempt,
            retry: attempt,
            worker_index: Some(worker),
            start_time: Local::now().fixed_offset(),
            duration: Duration::from_millis(5),
            status,
            error: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    fn event(kind: RunEventKind<'_>) -> RunEvent<'_> {
        RunEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: Duration::from_millis(1),
            kind,
        }
    }

    #[test]
    fn retried_test_records_every_attempt_once() {
        let config = RunConfig {
            projects: vec![Project::new("default")],
            ..RunConfig::default()
        };
        let list = sample_list(&config);
        let instance = list.iter_instances().next().unwrap();
        let log = CallLog::default();
        let mut aggregator = EventAggregator::new(
            &config,
            &list,
            vec![Box::new(LoggingReporter(log.clone()))],
        );

        aggregator.write_event(event(RunEventKind::RunStarted {
            test_count: 1,
            workers: 1,
        }));
        aggregator.write_event(event(RunEventKind::TestStarted {
            instance,
            retry: 0,
            worker_index: 0,
        }));
        aggregator.write_event(event(RunEventKind::TestAttemptFailedWillRetry {
            instance,
            result: result(0, TestStatus::Failed, 0),
        }));
        aggregator.write_event(event(RunEventKind::TestStarted {
            instance,
            retry: 1,
            worker_index: 1,
        }));
        aggregator.write_event(event(RunEventKind::TestFinished {
            instance,
            statuses: ExecutionStatuses::new(vec![
                result(0, TestStatus::Failed, 0),
                result(1, TestStatus::Passed, 1),
            ]),
            current_stats: RunStats::default(),
            running: 0,
        }));
        aggregator.write_event(event(RunEventKind::RunFinished {
            start_time: Local::now().fixed_offset(),
            elapsed: Duration::from_millis(10),
            run_stats: RunStats {
                flaky: 1,
                finished_count: 1,
                initial_run_count: 1,
                ..RunStats::default()
            },
            status: FinalStatus::Passed,
        }));

        let report = aggregator.report();
        let results = &report.suites[0].specs[0].tests[0].results;
        assert_eq!(results.len(), 2, "each attempt recorded exactly once");
        assert_eq!(results[0].status, TestStatus::Failed);
        assert_eq!(results[0].worker_index, Some(0));
        assert_eq!(results[1].status, TestStatus::Passed);
        assert_eq!(results[1].worker_index, Some(1));

        let calls = log.0.lock().unwrap().clone();
        assert_eq!(
            calls,
            [
                "begin",
                "test-begin wobbly",
                "test-end wobbly failed",
                "test-begin wobbly",
                "test-end wobbly passed",
                "end Passed",
            ]
        );
    }

    #[test]
    fn report_round_trips_through_json() {
        let config = RunConfig::default();
        let list = sample_list(&config);
        let instance = list.iter_instances().next().unwrap();
        let mut aggregator = EventAggregator::new(&config, &list, Vec::new());
        aggregator.write_event(event(RunEventKind::TestFinished {
            instance,
            statuses: ExecutionStatuses::new(vec![result(0, TestStatus::Passed, 0)]),
            current_stats: RunStats::default(),
            running: 0,
        }));

        let json = aggregator.report().to_json().unwrap();
        let parsed = ReportSummary::parse_json(&json).unwrap();
        assert_eq!(*aggregator.report(), parsed);
    }
}
