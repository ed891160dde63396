// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serializable summaries of a test run.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// A complete report of a test run: configuration, the suite tree with
/// per-test results, and run-level errors.
///
/// Deserializing a serialized report yields an isomorphic tree.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReportSummary {
    /// The configuration the run executed under.
    pub config: ConfigSummary,

    /// Top-level suites, one per registered file, in registration order.
    pub suites: Vec<SuiteSummary>,

    /// Errors not attributable to a single test.
    pub errors: Vec<ErrorSummary>,
}

impl ReportSummary {
    /// Parses a report from JSON.
    pub fn parse_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes the report to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// The subset of the run configuration recorded in reports.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigSummary {
    /// Worker pool size.
    pub workers: usize,

    /// The grep filter, if one was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grep: Option<String>,

    /// The shard this run covered, if the run was sharded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardSummary>,

    /// Names of the projects that took part in the run.
    pub projects: Vec<String>,
}

/// A `current/total` shard designation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShardSummary {
    /// The shard that was run, counting up from 1.
    pub current: u32,

    /// The total number of shards.
    pub total: u32,
}

impl fmt::Display for ShardSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current, self.total)
    }
}

/// A suite: a titled container of specs and child suites.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuiteSummary {
    /// The suite title. For file-level suites this is the file path.
    pub title: String,

    /// The file the suite was declared in.
    pub file: Utf8PathBuf,

    /// Specs declared directly in this suite, in declaration order.
    pub specs: Vec<SpecSummary>,

    /// Child suites, in declaration order.
    pub suites: Vec<SuiteSummary>,
}

/// A registered test declaration, prior to per-project expansion.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpecSummary {
    /// The spec title.
    pub title: String,

    /// Declaration location.
    pub file: Utf8PathBuf,
    /// Declaration line.
    pub line: u32,
    /// Declaration column.
    pub column: u32,

    /// One entry per project the spec was expanded into.
    pub tests: Vec<TestSummary>,
}

/// A single test: a spec applied to a project.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestSummary {
    /// The project this test ran under.
    pub project_name: String,

    /// The status the test was expected to end with.
    pub expected_status: StatusSummary,

    /// The per-attempt timeout in milliseconds (0 means none).
    pub timeout_ms: u64,

    /// Annotations attached to the spec.
    pub annotations: Vec<AnnotationSummary>,

    /// One entry per attempt, in attempt order.
    pub results: Vec<ResultSummary>,
}

/// The result of a single test attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResultSummary {
    /// The worker the attempt ran on. `None` when the test never reached a
    /// worker (skipped tests).
    pub worker_index: Option<usize>,

    /// The status of this attempt.
    pub status: StatusSummary,

    /// Wall-clock duration of the attempt in milliseconds.
    pub duration_ms: u64,

    /// The error that ended the attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,

    /// Captured stdout chunks, in arrival order.
    pub stdout: Vec<String>,

    /// Captured stderr chunks, in arrival order.
    pub stderr: Vec<String>,

    /// 0-based attempt counter.
    pub attempt: usize,

    /// Retry number; equal to `attempt`, recorded separately so that
    /// consumers do not have to know the retry policy.
    pub retry: usize,
}

/// An error surfaced by a test attempt or by the run itself.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ErrorSummary {
    /// Human-readable error message.
    pub message: String,

    /// The location the error is attributed to, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// An annotation attached to a spec, e.g. `skip` or `slow`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AnnotationSummary {
    /// The annotation kind.
    pub kind: String,

    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A test or run status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusSummary {
    /// The test passed.
    Passed,
    /// The test failed.
    Failed,
    /// The test hit its per-attempt timeout.
    TimedOut,
    /// The test was never started.
    Skipped,
    /// The run was cancelled while the test was executing.
    Interrupted,
    /// The test failed on at least one attempt and passed on a retry.
    Flaky,
}

impl StatusSummary {
    /// String form used in reports and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusSummary::Passed => "passed",
            StatusSummary::Failed => "failed",
            StatusSummary::TimedOut => "timed-out",
            StatusSummary::Skipped => "skipped",
            StatusSummary::Interrupted => "interrupted",
            StatusSummary::Flaky => "flaky",
        }
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusSummary {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(StatusSummary::Passed),
            "failed" => Ok(StatusSummary::Failed),
            "timed-out" => Ok(StatusSummary::TimedOut),
            "skipped" => Ok(StatusSummary::Skipped),
            "interrupted" => Ok(StatusSummary::Interrupted),
            "flaky" => Ok(StatusSummary::Flaky),
            other => Err(StatusParseError {
                input: other.to_owned(),
            }),
        }
    }
}

/// Error returned while parsing a [`StatusSummary`] from a string.
#[derive(Clone, Debug)]
pub struct StatusParseError {
    input: String,
}

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized test status: {}", self.input)
    }
}

impl std::error::Error for StatusParseError {}

/// Per-status counts for a finished run, keyed by status string.
///
/// A `BTreeMap` keeps key order deterministic for golden-file diffing.
pub type StatusCounts = BTreeMap<String, usize>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_report() -> ReportSummary {
        ReportSummary {
            config: ConfigSummary {
                workers: 2,
                grep: Some("login".to_owned()),
                shard: Some(ShardSummary {
                    current: 1,
                    total: 2,
                }),
                projects: vec!["default".to_owned()],
            },
            suites: vec![SuiteSummary {
                title: "tests/login.rs".to_owned(),
                file: "tests/login.rs".into(),
                specs: vec![SpecSummary {
                    title: "logs in".to_owned(),
                    file: "tests/login.rs".into(),
                    line: 12,
                    column: 5,
                    tests: vec![TestSummary {
                        project_name: "default".to_owned(),
                        expected_status: StatusSummary::Passed,
                        timeout_ms: 30_000,
                        annotations: vec![AnnotationSummary {
                            kind: "slow".to_owned(),
                            description: None,
                        }],
                        results: vec![
                            ResultSummary {
                                worker_index: Some(0),
                                status: StatusSummary::Failed,
                                duration_ms: 250,
                                error: Some(ErrorSummary {
                                    message: "connection refused".to_owned(),
                                    location: None,
                                }),
                                stdout: vec!["connecting\n".to_owned()],
                                stderr: vec![],
                                attempt: 0,
                                retry: 0,
                            },
                            ResultSummary {
                                worker_index: Some(1),
                                status: StatusSummary::Passed,
                                duration_ms: 180,
                                error: None,
                                stdout: vec![],
                                stderr: vec![],
                                attempt: 1,
                                retry: 1,
                            },
                        ],
                    }],
                }],
                suites: vec![],
            }],
            errors: vec![],
        }
    }

    #[test]
    fn report_round_trip() {
        let report = sample_report();
        let json = report.to_json().expect("report serializes");
        let parsed = ReportSummary::parse_json(&json).expect("report parses");
        assert_eq!(report, parsed, "report round-trips through JSON");
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            StatusSummary::Passed,
            StatusSummary::Failed,
            StatusSummary::TimedOut,
            StatusSummary::Skipped,
            StatusSummary::Interrupted,
            StatusSummary::Flaky,
        ] {
            assert_eq!(status.as_str().parse::<StatusSummary>().unwrap(), status);
        }
        assert!("bogus".parse::<StatusSummary>().is_err());
    }

    #[test]
    fn serialized_field_order_is_stable() {
        let json = sample_report().to_json().unwrap();
        let config_idx = json.find("\"config\"").unwrap();
        let suites_idx = json.find("\"suites\"").unwrap();
        let errors_idx = json.rfind("\"errors\"").unwrap();
        assert!(config_idx < suites_idx && suites_idx < errors_idx);
    }
}
