// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-disk artifact layout: per-test output directories and snapshots.

use crate::{
    errors::SnapshotError,
    helpers::slugify,
    list::TestInstance,
};
use camino::{Utf8Path, Utf8PathBuf};

/// Environment variable carrying the cache directory into workers.
pub const CACHE_DIR_ENV: &str = "GANTRY_CACHE_DIR";

/// Resolves per-attempt output directories under the run's output root.
///
/// Layout: `<output_dir>/<project>/<file-slug>-<spec-slug>[-retry<N>]/`.
/// Directories are disjoint per test attempt, so tests never need to lock.
#[derive(Clone, Debug)]
pub struct OutputLayout {
    output_dir: Utf8PathBuf,
}

impl OutputLayout {
    /// Creates a layout rooted at `output_dir`.
    pub fn new(output_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// The output root.
    pub fn root(&self) -> &Utf8Path {
        &self.output_dir
    }

    /// The directory for one attempt of `instance`.
    pub fn attempt_dir(&self, instance: &TestInstance<'_>, retry: usize) -> Utf8PathBuf {
        let project_dir = instance
            .project
            .output_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(&instance.project.name));
        let mut leaf = format!(
            "{}-{}",
            slugify(instance.spec.location.file.as_str()),
            slugify(&instance.spec.title),
        );
        if instance.case.repeat_index > 0 {
            leaf.push_str(&format!("-repeat{}", instance.case.repeat_index));
        }
        if retry > 0 {
            leaf.push_str(&format!("-retry{retry}"));
        }
        project_dir.join(leaf)
    }
}

/// Compares test output against stored snapshots, or rewrites them when
/// updates are requested.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    snapshot_dir: Utf8PathBuf,
    update: bool,
}

impl SnapshotStore {
    /// Creates a store rooted at `snapshot_dir`.
    pub fn new(snapshot_dir: impl Into<Utf8PathBuf>, update: bool) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            update,
        }
    }

    /// The path a snapshot name resolves to.
    pub fn resolve(&self, name: &str) -> Utf8PathBuf {
        self.snapshot_dir.join(name)
    }

    /// Compares `actual` against the named snapshot. In update mode the
    /// snapshot is (re)written instead and the comparison always succeeds.
    pub fn check(&self, name: &str, actual: &[u8]) -> Result<(), SnapshotError> {
        let path = self.resolve(name);
        if self.update {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|error| SnapshotError::Io {
                    path: path.clone(),
                    error,
                })?;
            }
            return std::fs::write(&path, actual).map_err(|error| SnapshotError::Io {
                path: path.clone(),
                error,
            });
        }

        match std::fs::read(&path) {
            Ok(expected) if expected == actual => Ok(()),
            Ok(_) => Err(SnapshotError::Mismatch { path }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(SnapshotError::Missing { path })
            }
            Err(error) => Err(SnapshotError::Io { path, error }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Project, RunConfig},
        errors::TestFailure,
        list::{RootRegistry, SourceLocation, TestList},
        worker::TestContext,
    };
    use camino_tempfile::Utf8TempDir;

    fn instance_fixture() -> (TestList, RunConfig) {
        let mut reg = RootRegistry::new();
        reg.file("tests/login.rs").spec(
            "logs in (fast)",
            SourceLocation::new("tests/login.rs", 4, 1),
            |_ctx: TestContext| async { Ok::<(), TestFailure>(()) },
        );
        let config = RunConfig {
            projects: vec![Project::new("chromium")],
            ..RunConfig::default()
        };
        let list = TestList::build(reg, &config).unwrap();
        (list, config)
    }

    #[test]
    fn attempt_dirs_follow_the_layout() {
        let (list, _config) = instance_fixture();
        let instance = list.iter_instances().next().unwrap();
        let layout = OutputLayout::new("test-results");

        assert_eq!(
            layout.attempt_dir(&instance, 0),
            Utf8PathBuf::from("test-results/chromium/tests-login-rs-logs-in-fast"),
        );
        assert_eq!(
            layout.attempt_dir(&instance, 2),
            Utf8PathBuf::from("test-results/chromium/tests-login-rs-logs-in-fast-retry2"),
        );
    }

    #[test]
    fn snapshot_update_then_match() {
        let dir = Utf8TempDir::new().unwrap();
        let updating = SnapshotStore::new(dir.path(), true);
        updating.check("out/hello.txt", b"hello").unwrap();

        let checking = SnapshotStore::new(dir.path(), false);
        checking.check("out/hello.txt", b"hello").unwrap();
        let err = checking.check("out/hello.txt", b"bye").unwrap_err();
        assert!(matches!(err, SnapshotError::Mismatch { .. }));
        let err = checking.check("out/missing.txt", b"x").unwrap_err();
        assert!(matches!(err, SnapshotError::Missing { .. }));
    }
}
