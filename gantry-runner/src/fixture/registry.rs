// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{FixtureScope, FixtureSetupFn};
use crate::errors::{DuplicateFixtureError, FixtureGraphError};
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};
use xxhash_rust::xxh64::Xxh64;

/// A registered fixture definition.
#[derive(Clone)]
pub struct FixtureDef {
    name: String,
    scope: FixtureScope,
    deps: Vec<String>,
    definition_id: u64,
    setup: DebugIgnore<FixtureSetupFn>,
}

impl fmt::Debug for FixtureDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureDef")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("deps", &self.deps)
            .field("definition_id", &self.definition_id)
            .finish_non_exhaustive()
    }
}

impl FixtureDef {
    /// The fixture name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fixture scope.
    pub fn scope(&self) -> FixtureScope {
        self.scope
    }

    /// Names of the declared dependencies.
    pub fn deps(&self) -> &[String] {
        &self.deps
    }

    pub(crate) fn definition_id(&self) -> u64 {
        self.definition_id
    }

    pub(crate) fn setup(&self) -> &FixtureSetupFn {
        &self.setup
    }
}

/// Holds all fixture definitions for a run, keyed by unique name.
///
/// Registration order is preserved; it feeds the definition identity that
/// makes [`FixtureHash`] stable across the parent and worker processes.
#[derive(Clone, Debug, Default)]
pub struct FixtureRegistry {
    fixtures: IndexMap<String, FixtureDef>,
}

impl FixtureRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fixture.
    ///
    /// Fails with [`DuplicateFixtureError`] if the name is taken. Dependency
    /// existence, scope rules and acyclicity are checked by
    /// [`FixtureRegistry::validate`] once all fixtures are registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        scope: FixtureScope,
        deps: impl IntoIterator<Item = impl Into<String>>,
        setup: FixtureSetupFn,
    ) -> Result<(), DuplicateFixtureError> {
        let name = name.into();
        if self.fixtures.contains_key(&name) {
            return Err(DuplicateFixtureError::new(name));
        }
        let ordinal = self.fixtures.len();
        let definition_id = {
            let mut hasher = Xxh64::new(0);
            hasher.update(name.as_bytes());
            hasher.update(&(ordinal as u64).to_le_bytes());
            hasher.digest()
        };
        let def = FixtureDef {
            name: name.clone(),
            scope,
            deps: deps.into_iter().map(Into::into).collect(),
            definition_id,
            setup: DebugIgnore(setup),
        };
        self.fixtures.insert(name, def);
        Ok(())
    }

    /// Looks up a fixture by name.
    pub fn get(&self, name: &str) -> Option<&FixtureDef> {
        self.fixtures.get(name)
    }

    /// The number of registered fixtures.
    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    /// Validates the dependency graph: every dependency exists, no worker
    /// fixture depends on a test fixture, and there are no cycles.
    pub fn validate(&self) -> Result<(), FixtureGraphError> {
        for def in self.fixtures.values() {
            for dep in &def.deps {
                let Some(dep_def) = self.fixtures.get(dep) else {
                    return Err(FixtureGraphError::UnknownFixture {
                        name: dep.clone(),
                        required_by: def.name.clone(),
                    });
                };
                if def.scope == FixtureScope::Worker && dep_def.scope == FixtureScope::Test {
                    return Err(FixtureGraphError::InvalidScope {
                        fixture: def.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        self.check_cycles()
    }

    fn check_cycles(&self) -> Result<(), FixtureGraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit(
            registry: &FixtureRegistry,
            name: &str,
            marks: &mut IndexMap<String, Mark>,
            stack: &mut Vec<String>,
        ) -> Result<(), FixtureGraphError> {
            match marks.get(name).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    let start = stack.iter().position(|n| n == name).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..].to_vec();
                    path.push(name.to_owned());
                    return Err(FixtureGraphError::Cycle { path });
                }
                Mark::Unvisited => {}
            }
            marks.insert(name.to_owned(), Mark::InProgress);
            stack.push(name.to_owned());
            if let Some(def) = registry.fixtures.get(name) {
                for dep in &def.deps {
                    visit(registry, dep, marks, stack)?;
                }
            }
            stack.pop();
            marks.insert(name.to_owned(), Mark::Done);
            Ok(())
        }

        let mut marks = IndexMap::new();
        let mut stack = Vec::new();
        for name in self.fixtures.keys() {
            visit(self, name, &mut marks, &mut stack)?;
        }
        Ok(())
    }

    /// Returns the transitive closure of `refs` in topological order
    /// (dependencies before dependents), restricted to registered fixtures.
    ///
    /// Call only after [`FixtureRegistry::validate`] has passed.
    pub(crate) fn topo_closure(&self, refs: &[String]) -> Vec<&FixtureDef> {
        fn visit<'r>(
            registry: &'r FixtureRegistry,
            name: &str,
            seen: &mut HashSet<String>,
            out: &mut Vec<&'r FixtureDef>,
        ) {
            if !seen.insert(name.to_owned()) {
                return;
            }
            let Some(def) = registry.fixtures.get(name) else {
                return;
            };
            for dep in &def.deps {
                visit(registry, dep, seen, out);
            }
            out.push(def);
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for name in refs {
            visit(self, name, &mut seen, &mut out);
        }
        out
    }

    /// Computes the worker-compatibility hash for a test: a stable digest
    /// over the project name and the worker-scope fixtures transitively
    /// required through `refs`.
    ///
    /// Two tests share a worker if and only if their hashes match.
    pub(crate) fn worker_hash(&self, project_name: &str, refs: &[String]) -> FixtureHash {
        let mut worker_fixtures: Vec<(&str, u64)> = self
            .topo_closure(refs)
            .into_iter()
            .filter(|def| def.scope == FixtureScope::Worker)
            .map(|def| (def.name.as_str(), def.definition_id))
            .collect();
        worker_fixtures.sort_unstable();

        // Fixed to xxhash64 so that hashes agree between the parent and
        // worker processes of one build.
        let mut hasher = Xxh64::new(0);
        hasher.update(project_name.as_bytes());
        hasher.update(b"\0");
        for (name, definition_id) in worker_fixtures {
            hasher.update(name.as_bytes());
            hasher.update(&definition_id.to_le_bytes());
            hasher.update(b"\0");
        }
        FixtureHash(hasher.digest())
    }
}

/// A stable digest identifying which worker-scope fixtures a test requires.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FixtureHash(u64);

impl fmt::Display for FixtureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
