// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::TestFailure,
    fixture::{FixtureArgs, FixtureRegistry, FixtureScope, FixtureValue},
};
use futures::future::BoxFuture;
use std::collections::HashMap;
use tracing::debug;

/// Holds the resolved fixture values of one scope inside a worker.
///
/// One store lives for the whole worker (worker-scope fixtures, idempotent
/// across tests) and one is created per test. Instantiation follows
/// topological dependency order; teardowns run in reverse instantiation
/// order when the scope ends.
pub(crate) struct FixtureStore {
    scope: FixtureScope,
    values: HashMap<String, FixtureValue>,
    teardowns: Vec<(String, BoxFuture<'static, Result<(), TestFailure>>)>,
}

impl FixtureStore {
    pub(crate) fn new(scope: FixtureScope) -> Self {
        Self {
            scope,
            values: HashMap::new(),
            teardowns: Vec::new(),
        }
    }

    pub(crate) fn value(&self, name: &str) -> Option<FixtureValue> {
        self.values.get(name).cloned()
    }

    pub(crate) fn values(&self) -> &HashMap<String, FixtureValue> {
        &self.values
    }

    /// Instantiates every fixture in the transitive closure of `refs` whose
    /// scope matches this store. Values for dependencies of the other scope
    /// are resolved from `outer` (the worker store, when filling a test
    /// store).
    ///
    /// A setup failure aborts instantiation; since dependencies come before
    /// dependents in the walk order, nothing dependent on the failed
    /// fixture has run yet.
    pub(crate) async fn instantiate(
        &mut self,
        registry: &FixtureRegistry,
        refs: &[String],
        outer: Option<&HashMap<String, FixtureValue>>,
    ) -> Result<(), TestFailure> {
        for def in registry.topo_closure(refs) {
            if def.scope() != self.scope {
                continue;
            }
            if self.values.contains_key(def.name()) {
                continue;
            }
            let mut args = HashMap::with_capacity(def.deps().len());
            for dep in def.deps() {
                let value = self
                    .values
                    .get(dep)
                    .cloned()
                    .or_else(|| outer.and_then(|outer| outer.get(dep).cloned()));
                let Some(value) = value else {
                    return Err(TestFailure::msg(format!(
                        "fixture `{}` is unusable: dependency `{dep}` was not set up",
                        def.name()
                    )));
                };
                args.insert(dep.clone(), value);
            }

            debug!(fixture = def.name(), scope = ?self.scope, "setting up fixture");
            let set_up = (def.setup())(FixtureArgs::new(args)).await.map_err(|err| {
                TestFailure::msg(format!("fixture `{}` failed to set up: {err}", def.name()))
            })?;
            self.values.insert(def.name().to_owned(), set_up.value);
            if let Some(teardown) = set_up.teardown {
                self.teardowns.push((def.name().to_owned(), teardown));
            }
        }
        Ok(())
    }

    /// Tears down every instantiated fixture in reverse instantiation
    /// order. Errors are collected, not short-circuited: a teardown failure
    /// never prevents the remaining teardowns from running.
    pub(crate) async fn teardown(&mut self) -> Vec<TestFailure> {
        let mut errors = Vec::new();
        while let Some((name, teardown)) = self.teardowns.pop() {
            debug!(fixture = %name, "tearing down fixture");
            if let Err(err) = teardown.await {
                errors.push(TestFailure::msg(format!(
                    "fixture `{name}` failed to tear down: {err}"
                )));
            }
        }
        self.values.clear();
        errors
    }
}
