// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Annotation, TestInstance, TestList};
use crate::{
    config::{Project, RunConfig},
    errors::PlanError,
    reporter::events::TestStatus,
};
use regex::Regex;
use tracing::debug;

/// Why a planned test will not be dispatched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlannedSkip {
    /// The spec carries a `skip` annotation (or expects `skipped`).
    Annotation,
}

/// One entry of the execution plan.
#[derive(Copy, Clone, Debug)]
pub struct PlanEntry<'list> {
    /// The test to run.
    pub instance: TestInstance<'list>,
    /// Set when the test is planned but never dispatched.
    pub skip: Option<PlannedSkip>,
}

/// The ordered, filtered subset of the test list that a run executes.
#[derive(Debug)]
pub struct TestPlan<'list> {
    entries: Vec<PlanEntry<'list>>,
}

impl<'list> TestPlan<'list> {
    /// Applies the run filters to `list`, in order: `only` marking, project
    /// filter, per-project file patterns, grep, then sharding.
    pub fn build(list: &'list TestList, config: &RunConfig) -> Result<Self, PlanError> {
        let grep = config
            .grep
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|error| PlanError::InvalidGrep {
                pattern: config.grep.clone().unwrap_or_default(),
                error,
            })?;

        let file_filters = config
            .projects
            .iter()
            .map(FileFilter::new)
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::new();
        for instance in list.iter_instances() {
            let project = instance.project;
            if !config.project_filter.is_empty()
                && !config.project_filter.iter().any(|p| *p == project.name)
            {
                continue;
            }
            if !file_filters[instance.case.project_index].matches(&instance.spec.location.file)
            {
                continue;
            }
            if list.has_only() && !instance.spec.only {
                continue;
            }
            if let Some(grep) = &grep {
                if !grep.is_match(&instance.case.full_title) {
                    continue;
                }
            }
            let skip = (instance.case.expected_status == TestStatus::Skipped
                || instance.spec.has_annotation(Annotation::SKIP))
            .then_some(PlannedSkip::Annotation);
            entries.push(PlanEntry { instance, skip });
        }

        if let Some(shard) = config.shard {
            let total = shard.total as usize;
            let current = shard.current as usize - 1;
            let before = entries.len();
            let mut index = 0usize;
            entries.retain(|_| {
                let keep = index % total == current;
                index += 1;
                keep
            });
            debug!(
                shard = %shard,
                before,
                after = entries.len(),
                "applied shard filter"
            );
        }

        Ok(Self { entries })
    }

    /// The planned entries, in dispatch order.
    pub fn entries(&self) -> &[PlanEntry<'list>] {
        &self.entries
    }

    /// The number of planned tests, skipped entries included.
    pub fn initial_run_count(&self) -> usize {
        self.entries.len()
    }

    /// The number of entries that will actually be dispatched.
    pub fn runnable_count(&self) -> usize {
        self.entries.iter().filter(|e| e.skip.is_none()).count()
    }

    /// Iterates the maximal contiguous hash-runs of the plan, skipped
    /// entries excluded. A hash-run never spans files: declaration
    /// neighbors share a worker only within one file.
    pub fn hash_runs(&self) -> impl Iterator<Item = &[PlanEntry<'list>]> + '_ {
        HashRuns {
            entries: &self.entries,
        }
    }
}

struct HashRuns<'a, 'list> {
    entries: &'a [PlanEntry<'list>],
}

impl<'a, 'list> Iterator for HashRuns<'a, 'list> {
    type Item = &'a [PlanEntry<'list>];

    fn next(&mut self) -> Option<Self::Item> {
        // Skip past entries that never dispatch.
        while let Some((first, rest)) = self.entries.split_first() {
            if first.skip.is_none() {
                break;
            }
            self.entries = rest;
        }
        let first = self.entries.first()?;
        let hash = first.instance.case.fixture_hash;
        let file = first.instance.case.file_index;
        let mut len = 1;
        while let Some(entry) = self.entries.get(len) {
            if entry.skip.is_some()
                || entry.instance.case.fixture_hash != hash
                || entry.instance.case.file_index != file
            {
                break;
            }
            len += 1;
        }
        let (run, rest) = self.entries.split_at(len);
        self.entries = rest;
        Some(run)
    }
}

struct FileFilter {
    test_dir: Option<camino::Utf8PathBuf>,
    test_match: Option<Regex>,
    test_ignore: Option<Regex>,
}

impl FileFilter {
    fn new(project: &Project) -> Result<Self, PlanError> {
        let compile = |pattern: &Option<String>| -> Result<Option<Regex>, PlanError> {
            pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|error| PlanError::InvalidTestPattern {
                    project: project.name.clone(),
                    pattern: pattern.clone().unwrap_or_default(),
                    error,
                })
        };
        Ok(Self {
            test_dir: project.test_dir.clone(),
            test_match: compile(&project.test_match)?,
            test_ignore: compile(&project.test_ignore)?,
        })
    }

    fn matches(&self, file: &camino::Utf8Path) -> bool {
        if let Some(dir) = &self.test_dir {
            if !file.starts_with(dir) {
                return false;
            }
        }
        if let Some(test_match) = &self.test_match {
            if !test_match.is_match(file.as_str()) {
                return false;
            }
        }
        if let Some(test_ignore) = &self.test_ignore {
            if test_ignore.is_match(file.as_str()) {
                return false;
            }
        }
        true
    }
}
