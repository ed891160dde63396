// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration: projects, filters, and the config file.

use crate::errors::{ConfigParseError, ShardParseError};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

/// The default per-attempt test timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The default output directory for test artifacts.
pub const DEFAULT_OUTPUT_DIR: &str = "test-results";

/// Returns the number of CPUs available, used as the default worker count.
pub fn get_num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|v| v.get())
        .unwrap_or(1)
}

/// A named configuration applied to the spec set. Each spec yields one test
/// per project it applies to.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Project {
    /// The project name.
    pub name: String,

    /// Overrides the run-level output directory for this project.
    pub output_dir: Option<Utf8PathBuf>,

    /// The directory test files are registered under. Files outside it are
    /// not expanded for this project.
    pub test_dir: Option<Utf8PathBuf>,

    /// Regex a file path must match to be expanded for this project.
    pub test_match: Option<String>,

    /// Regex a file path must not match to be expanded for this project.
    pub test_ignore: Option<String>,

    /// Per-attempt timeout. Zero disables the timeout.
    #[serde(with = "duration_ms", rename = "timeout-ms")]
    pub timeout: Duration,

    /// Number of retries for failing tests.
    pub retries: usize,

    /// How many times each spec is repeated within this project.
    pub repeat_each: usize,

    /// Where snapshots are stored.
    pub snapshot_dir: Option<Utf8PathBuf>,

    /// Free-form metadata, exposed to tests through the test context.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            output_dir: None,
            test_dir: None,
            test_match: None,
            test_ignore: None,
            timeout: DEFAULT_TIMEOUT,
            retries: 0,
            repeat_each: 1,
            snapshot_dir: None,
            metadata: BTreeMap::new(),
        }
    }
}

impl Project {
    /// Creates a project with the given name and defaults for everything
    /// else.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A `current/total` shard designation, parsed from `--shard=c/t`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShardSpec {
    /// The shard to run, counting up from 1.
    pub current: u32,

    /// The total number of shards.
    pub total: u32,
}

impl fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current, self.total)
    }
}

impl FromStr for ShardSpec {
    type Err = ShardParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut split = s.splitn(2, '/');
        // The first `next` always returns a value.
        let current_str = split.next().expect("split returns at least one element");
        let total_str = split
            .next()
            .ok_or_else(|| ShardParseError::new(format!("`{s}` is missing a `/`")))?;

        let current: u32 = current_str.parse().map_err(|err| {
            ShardParseError::new(format!("failed to parse shard `{current_str}`: {err}"))
        })?;
        let total: u32 = total_str.parse().map_err(|err| {
            ShardParseError::new(format!("failed to parse total shards `{total_str}`: {err}"))
        })?;

        if !(1..=total).contains(&current) {
            return Err(ShardParseError::new(format!(
                "shard {current} must be between 1 and total shards {total}, inclusive"
            )));
        }

        Ok(Self { current, total })
    }
}

/// Configuration for a single run, assembled from the config file and CLI
/// flags. Serializable because it travels to workers in the `Init` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunConfig {
    /// Worker pool size.
    pub workers: usize,

    /// Fail the run if any spec is marked `only`.
    pub forbid_only: bool,

    /// Regex filter over "suite titles + space + spec title".
    pub grep: Option<String>,

    /// If non-empty, only these projects run.
    pub project_filter: Vec<String>,

    /// Stop starting new tests once this many tests have failed.
    pub max_failures: Option<usize>,

    /// Cancel the run after this much wall-clock time.
    #[serde(with = "opt_duration_ms", rename = "global-timeout-ms")]
    pub global_timeout: Option<Duration>,

    /// Write snapshots instead of comparing against them.
    pub update_snapshots: bool,

    /// Run only the given shard of the plan.
    pub shard: Option<ShardSpec>,

    /// Overrides every project's retry count.
    pub retries: Option<usize>,

    /// Overrides every project's per-attempt timeout.
    #[serde(with = "opt_duration_ms", rename = "timeout-ms")]
    pub timeout: Option<Duration>,

    /// Root directory for per-test artifacts.
    pub output_dir: Utf8PathBuf,

    /// The projects taking part in the run.
    pub projects: Vec<Project>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: get_num_cpus(),
            forbid_only: false,
            grep: None,
            project_filter: Vec::new(),
            max_failures: None,
            global_timeout: None,
            update_snapshots: false,
            shard: None,
            retries: None,
            timeout: None,
            output_dir: DEFAULT_OUTPUT_DIR.into(),
            projects: vec![Project::default()],
        }
    }
}

impl RunConfig {
    /// The effective retry count for a project, honoring the run-level
    /// override.
    pub fn retries_for(&self, project: &Project) -> usize {
        self.retries.unwrap_or(project.retries)
    }

    /// The effective per-attempt timeout for a project, honoring the
    /// run-level override.
    pub fn timeout_for(&self, project: &Project) -> Duration {
        self.timeout.unwrap_or(project.timeout)
    }
}

/// The shape of the gantry config file (TOML). All fields are optional;
/// anything absent falls back to [`RunConfig::default`], and CLI flags
/// override both.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    /// Worker pool size.
    pub workers: Option<usize>,

    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: Option<u64>,

    /// Retries for failing tests.
    pub retries: Option<usize>,

    /// Fail the run if any spec is marked `only`.
    pub forbid_only: Option<bool>,

    /// Stop starting new tests once this many tests have failed.
    pub max_failures: Option<usize>,

    /// Cancel the run after this much wall-clock time, in milliseconds.
    pub global_timeout_ms: Option<u64>,

    /// Root directory for per-test artifacts.
    pub output_dir: Option<Utf8PathBuf>,

    /// Project definitions. An empty list means one default project.
    pub projects: Vec<Project>,
}

impl FileConfig {
    /// Loads the config file at `path`.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigParseError> {
        let loaded = config::Config::builder()
            .add_source(config::File::new(path.as_str(), config::FileFormat::Toml))
            .build()
            .map_err(|err| ConfigParseError::new(path, err))?;
        loaded
            .try_deserialize()
            .map_err(|err| ConfigParseError::new(path, err))
    }

    /// Folds the file configuration into a [`RunConfig`], leaving fields the
    /// file does not set at their defaults.
    pub fn into_run_config(self) -> RunConfig {
        let mut config = RunConfig::default();
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout = Some(Duration::from_millis(timeout_ms));
        }
        if let Some(retries) = self.retries {
            config.retries = Some(retries);
        }
        if let Some(forbid_only) = self.forbid_only {
            config.forbid_only = forbid_only;
        }
        if let Some(max_failures) = self.max_failures {
            config.max_failures = Some(max_failures);
        }
        if let Some(global_timeout_ms) = self.global_timeout_ms {
            config.global_timeout = Some(Duration::from_millis(global_timeout_ms));
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if !self.projects.is_empty() {
            config.projects = self.projects;
        }
        config
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_spec_from_str() {
        let successes = [
            ("1/2", ShardSpec { current: 1, total: 2 }),
            ("1/1", ShardSpec { current: 1, total: 1 }),
            ("99/200", ShardSpec { current: 99, total: 200 }),
        ];
        let failures = ["", "1", "1/", "/2", "0/2", "3/2", "m/2", "1/n"];

        for (input, expected) in successes {
            assert_eq!(
                input.parse::<ShardSpec>().unwrap_or_else(|err| panic!(
                    "expected `{input}` to parse, failed with: {err}"
                )),
                expected,
                "success case `{input}`",
            );
        }
        for input in failures {
            input
                .parse::<ShardSpec>()
                .expect_err(&format!("expected `{input}` to fail"));
        }
    }

    #[test]
    fn run_config_round_trips_through_json() {
        let config = RunConfig {
            workers: 4,
            grep: Some("login".to_owned()),
            global_timeout: Some(Duration::from_secs(60)),
            shard: Some(ShardSpec { current: 2, total: 3 }),
            timeout: Some(Duration::from_millis(500)),
            projects: vec![Project::new("a"), Project::new("b")],
            ..RunConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.workers, 4);
        assert_eq!(parsed.grep.as_deref(), Some("login"));
        assert_eq!(parsed.global_timeout, Some(Duration::from_secs(60)));
        assert_eq!(parsed.timeout, Some(Duration::from_millis(500)));
        assert_eq!(parsed.projects.len(), 2);
    }

    #[test]
    fn file_config_overrides_defaults() {
        let file = FileConfig {
            workers: Some(0),
            timeout_ms: Some(250),
            projects: vec![Project::new("smoke")],
            ..FileConfig::default()
        };
        let config = file.into_run_config();
        assert_eq!(config.workers, 1, "worker count is clamped to at least 1");
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.projects.len(), 1);
        assert_eq!(config.projects[0].name, "smoke");
    }

    #[test]
    fn effective_settings_honor_overrides() {
        let project = Project {
            retries: 2,
            timeout: Duration::from_secs(10),
            ..Project::default()
        };
        let mut config = RunConfig::default();
        assert_eq!(config.retries_for(&project), 2);
        assert_eq!(config.timeout_for(&project), Duration::from_secs(10));

        config.retries = Some(5);
        config.timeout = Some(Duration::from_secs(1));
        assert_eq!(config.retries_for(&project), 5);
        assert_eq!(config.timeout_for(&project), Duration::from_secs(1));
    }
}
