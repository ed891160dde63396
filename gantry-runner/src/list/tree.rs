// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::{Project, RunConfig},
    errors::{DuplicateFixtureError, TestFailure, TreeBuildError},
    fixture::{FixtureHash, FixtureRegistry, FixtureScope, SetUpFixture},
    reporter::events::TestStatus,
    worker::TestContext,
};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};
use xxhash_rust::xxh64::Xxh64;

/// Where a spec was declared.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceLocation {
    /// The declaring file.
    pub file: Utf8PathBuf,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl SourceLocation {
    /// Creates a location.
    pub fn new(file: impl Into<Utf8PathBuf>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// An annotation attached to a spec.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Annotation {
    /// The annotation kind, e.g. [`Annotation::SKIP`].
    pub kind: String,
    /// Free-form description.
    pub description: Option<String>,
}

impl Annotation {
    /// The spec is never dispatched and reports as skipped.
    pub const SKIP: &'static str = "skip";
    /// The spec is expected to fail; a passing run is a failure.
    pub const FAIL: &'static str = "fail";
    /// The spec gets triple the configured timeout.
    pub const SLOW: &'static str = "slow";

    /// Creates an annotation without a description.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: None,
        }
    }

    /// Creates an annotation with a description.
    pub fn with_description(
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            description: Some(description.into()),
        }
    }
}

/// The body of a registered test.
pub type TestBody =
    Arc<dyn Fn(TestContext) -> BoxFuture<'static, Result<(), TestFailure>> + Send + Sync>;

/// A registered test declaration, prior to per-project expansion.
#[derive(Clone, Debug)]
pub struct Spec {
    /// The spec title.
    pub title: String,
    /// Where the spec was declared.
    pub location: SourceLocation,
    /// Whether the spec is marked `only`.
    pub only: bool,
    /// Annotations attached to the spec.
    pub annotations: Vec<Annotation>,
    /// Names of the fixtures the body consumes.
    pub fixture_refs: Vec<String>,
    pub(crate) body: DebugIgnore<TestBody>,
}

impl Spec {
    /// Marks the spec as `only`: when any spec is marked, only marked specs
    /// run (unless `forbid_only` fails the build).
    pub fn only(&mut self) -> &mut Self {
        self.only = true;
        self
    }

    /// Declares the fixtures the body consumes.
    pub fn with_fixtures(
        &mut self,
        fixtures: impl IntoIterator<Item = impl Into<String>>,
    ) -> &mut Self {
        self.fixture_refs = fixtures.into_iter().map(Into::into).collect();
        self
    }

    /// Attaches an annotation.
    pub fn annotate(&mut self, annotation: Annotation) -> &mut Self {
        self.annotations.push(annotation);
        self
    }

    /// Whether any annotation of the given kind is attached.
    pub fn has_annotation(&self, kind: &str) -> bool {
        self.annotations.iter().any(|a| a.kind == kind)
    }

    pub(crate) fn body(&self) -> &TestBody {
        &self.body
    }

    fn expected_status(&self) -> TestStatus {
        if self.has_annotation(Annotation::SKIP) {
            TestStatus::Skipped
        } else if self.has_annotation(Annotation::FAIL) {
            TestStatus::Failed
        } else {
            TestStatus::Passed
        }
    }
}

/// A titled container of specs and child suites. Top-level suites represent
/// registered files.
#[derive(Clone, Debug)]
pub struct Suite {
    /// The suite title. For file-level suites this is the file path.
    pub title: String,
    /// The file the suite belongs to.
    pub file: Utf8PathBuf,
    /// Child suites, in declaration order.
    pub suites: Vec<Suite>,
    /// Specs declared directly in this suite, in declaration order.
    pub specs: Vec<Spec>,
}

impl Suite {
    fn new(title: impl Into<String>, file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            title: title.into(),
            file: file.into(),
            suites: Vec::new(),
            specs: Vec::new(),
        }
    }

    /// Appends a child suite and returns it for further registration.
    pub fn suite(&mut self, title: impl Into<String>) -> &mut Suite {
        let file = self.file.clone();
        self.suites.push(Suite::new(title, file));
        self.suites.last_mut().expect("just pushed")
    }

    /// Registers a spec with the given body and returns it so callers can
    /// attach fixtures and annotations.
    pub fn spec<F, Fut>(
        &mut self,
        title: impl Into<String>,
        location: SourceLocation,
        body: F,
    ) -> &mut Spec
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        let body: TestBody = Arc::new(move |ctx| Box::pin(body(ctx)));
        self.specs.push(Spec {
            title: title.into(),
            location,
            only: false,
            annotations: Vec::new(),
            fixture_refs: Vec::new(),
            body: DebugIgnore(body),
        });
        self.specs.last_mut().expect("just pushed")
    }
}

/// The registration target handed to a [`Loader`](super::Loader).
#[derive(Debug, Default)]
pub struct RootRegistry {
    fixtures: FixtureRegistry,
    files: Vec<Suite>,
}

impl RootRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fixture. See [`FixtureRegistry::register`].
    pub fn fixture<F, Fut>(
        &mut self,
        name: impl Into<String>,
        scope: FixtureScope,
        deps: impl IntoIterator<Item = impl Into<String>>,
        setup: F,
    ) -> Result<(), DuplicateFixtureError>
    where
        F: Fn(crate::fixture::FixtureArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SetUpFixture, TestFailure>> + Send + 'static,
    {
        self.fixtures.register(
            name,
            scope,
            deps,
            Arc::new(move |args| Box::pin(setup(args))),
        )
    }

    /// Returns the suite for `file`, creating it if this is the first
    /// registration against that file. File order is preserved.
    pub fn file(&mut self, file: impl AsRef<Utf8Path>) -> &mut Suite {
        let file = file.as_ref();
        if let Some(pos) = self.files.iter().position(|s| s.file == file) {
            return &mut self.files[pos];
        }
        self.files.push(Suite::new(file.as_str(), file));
        self.files.last_mut().expect("just pushed")
    }

    /// The fixture registry.
    pub fn fixtures(&self) -> &FixtureRegistry {
        &self.fixtures
    }
}

/// A stable identifier for a single test, agreed upon by the parent and
/// worker processes.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    fn compute(file: &Utf8Path, full_title: &str, project: &str, repeat_index: usize) -> Self {
        let mut hasher = Xxh64::new(0);
        hasher.update(file.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(full_title.as_bytes());
        hasher.update(b"\0");
        hasher.update(project.as_bytes());
        hasher.update(b"\0");
        hasher.update(&(repeat_index as u64).to_le_bytes());
        Self(format!("{:016x}", hasher.digest()))
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A spec applied to one project (and one repeat index): the unit of
/// scheduling.
#[derive(Clone, Debug)]
pub struct TestCase {
    /// Stable test identifier.
    pub id: TestId,
    /// Index into the run's project list.
    pub project_index: usize,
    /// The worker-compatibility hash.
    pub fixture_hash: FixtureHash,
    /// Per-attempt timeout. Zero disables the timeout.
    pub timeout: Duration,
    /// The status this test is expected to end with.
    pub expected_status: TestStatus,
    /// Number of retries on failure.
    pub retries: usize,
    /// 0-based repeat counter under `repeat_each`.
    pub repeat_index: usize,
    /// Suite titles joined with spaces, ending with the spec title.
    pub full_title: String,
    pub(crate) file_index: usize,
    pub(crate) suite_path: Vec<usize>,
    pub(crate) spec_index: usize,
}

/// A borrowed view of one test: its case, spec, and project.
#[derive(Copy, Clone, Debug)]
pub struct TestInstance<'a> {
    /// The scheduled case.
    pub case: &'a TestCase,
    /// The spec the case was expanded from.
    pub spec: &'a Spec,
    /// The project the case runs under.
    pub project: &'a Project,
}

impl<'a> TestInstance<'a> {
    /// The test id.
    pub fn id(&self) -> &'a TestId {
        &self.case.id
    }

    /// A display name: full title plus the project when there is more than
    /// one way to tell tests apart.
    pub fn name(&self) -> String {
        if self.case.repeat_index > 0 {
            format!(
                "[{}] {} #{}",
                self.project.name, self.case.full_title, self.case.repeat_index
            )
        } else {
            format!("[{}] {}", self.project.name, self.case.full_title)
        }
    }
}

/// The test tree after per-project expansion: the planning unit.
///
/// Built once before execution; cases are immutable afterwards. Results
/// accumulate in the dispatcher, not here.
#[derive(Debug)]
pub struct TestList {
    files: Vec<Suite>,
    fixtures: FixtureRegistry,
    projects: Vec<Project>,
    cases: Vec<TestCase>,
    by_id: HashMap<TestId, usize>,
    has_only: bool,
}

impl TestList {
    /// Expands a registry into a test list under the given configuration.
    ///
    /// Iteration order is stable: projects in configuration order, files in
    /// registration order, specs in declaration order, repeats in sequence.
    pub fn build(registry: RootRegistry, config: &RunConfig) -> Result<Self, TreeBuildError> {
        let RootRegistry { fixtures, files } = registry;
        fixtures.validate()?;

        let mut has_only = false;
        for file in &files {
            visit_specs(file, &mut |spec, _path| {
                if spec.only {
                    has_only = true;
                }
                for fixture in &spec.fixture_refs {
                    if fixtures.get(fixture).is_none() {
                        return Err(TreeBuildError::UnknownFixtureRef {
                            spec: spec.title.clone(),
                            location: spec.location.clone(),
                            fixture: fixture.clone(),
                        });
                    }
                }
                if config.forbid_only && spec.only {
                    return Err(TreeBuildError::ForbiddenOnly {
                        spec: spec.title.clone(),
                        location: spec.location.clone(),
                    });
                }
                Ok(())
            })?;
        }

        let mut cases = Vec::new();
        for (project_index, project) in config.projects.iter().enumerate() {
            for (file_index, file) in files.iter().enumerate() {
                visit_specs(file, &mut |spec, path| {
                    let (suite_path, spec_index, titles) = path;
                    let full_title = titles.join(" ");
                    let expected_status = spec.expected_status();
                    let mut timeout = config.timeout_for(project);
                    if spec.has_annotation(Annotation::SLOW) {
                        timeout *= 3;
                    }
                    for repeat_index in 0..project.repeat_each.max(1) {
                        cases.push(TestCase {
                            id: TestId::compute(
                                &file.file,
                                &full_title,
                                &project.name,
                                repeat_index,
                            ),
                            project_index,
                            fixture_hash: fixtures
                                .worker_hash(&project.name, &spec.fixture_refs),
                            timeout,
                            expected_status,
                            retries: config.retries_for(project),
                            repeat_index,
                            full_title: full_title.clone(),
                            file_index,
                            suite_path: suite_path.clone(),
                            spec_index,
                        });
                    }
                    Ok::<(), TreeBuildError>(())
                })?;
            }
        }

        let by_id = cases
            .iter()
            .enumerate()
            .map(|(idx, case)| (case.id.clone(), idx))
            .collect();

        Ok(Self {
            files,
            fixtures,
            projects: config.projects.clone(),
            cases,
            by_id,
            has_only,
        })
    }

    /// Top-level (file) suites, in registration order.
    pub fn files(&self) -> &[Suite] {
        &self.files
    }

    /// The fixture registry.
    pub fn fixtures(&self) -> &FixtureRegistry {
        &self.fixtures
    }

    /// The projects the list was expanded under.
    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    /// Total number of cases across all projects.
    pub fn test_count(&self) -> usize {
        self.cases.len()
    }

    pub(crate) fn has_only(&self) -> bool {
        self.has_only
    }

    /// Iterates all cases in stable order.
    pub fn iter_instances(&self) -> impl Iterator<Item = TestInstance<'_>> + '_ {
        self.cases.iter().map(move |case| self.instance_of(case))
    }

    /// Resolves a case into a full instance.
    pub fn instance_of<'a>(&'a self, case: &'a TestCase) -> TestInstance<'a> {
        let mut suite = &self.files[case.file_index];
        for &idx in &case.suite_path {
            suite = &suite.suites[idx];
        }
        TestInstance {
            case,
            spec: &suite.specs[case.spec_index],
            project: &self.projects[case.project_index],
        }
    }

    /// Looks up a case by id.
    pub fn instance_for_id(&self, id: &TestId) -> Option<TestInstance<'_>> {
        self.by_id
            .get(id)
            .map(|&idx| self.instance_of(&self.cases[idx]))
    }
}

/// Walks `suite` depth-first, invoking `f` for every spec with its
/// `(suite_path, spec_index, title_path)`.
fn visit_specs<E>(
    file: &Suite,
    f: &mut impl FnMut(&Spec, (&Vec<usize>, usize, &Vec<String>)) -> Result<(), E>,
) -> Result<(), E> {
    fn walk<E>(
        suite: &Suite,
        path: &mut Vec<usize>,
        titles: &mut Vec<String>,
        f: &mut impl FnMut(&Spec, (&Vec<usize>, usize, &Vec<String>)) -> Result<(), E>,
    ) -> Result<(), E> {
        for (spec_index, spec) in suite.specs.iter().enumerate() {
            titles.push(spec.title.clone());
            let res = f(spec, (&*path, spec_index, &*titles));
            titles.pop();
            res?;
        }
        for (idx, child) in suite.suites.iter().enumerate() {
            path.push(idx);
            titles.push(child.title.clone());
            walk(child, path, titles, f)?;
            titles.pop();
            path.pop();
        }
        Ok(())
    }

    let mut titles = vec![file.title.clone()];
    walk(file, &mut Vec::new(), &mut titles, f)
}
