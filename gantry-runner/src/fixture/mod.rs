// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixtures: named resources with setup and teardown, scoped to a single
//! test or to a worker's lifetime.
//!
//! A fixture body is an async setup callback that receives its resolved
//! dependencies and returns a value along with an optional teardown future.
//! Setup runs on first access within the owning scope; teardowns run in
//! reverse instantiation order when the scope ends.

mod registry;

pub use registry::*;

use crate::errors::TestFailure;
use futures::future::BoxFuture;
use std::{any::Any, collections::HashMap, sync::Arc};

/// The scope a fixture value lives in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FixtureScope {
    /// One value per test; torn down when the test ends.
    Test,

    /// One value per worker process; torn down when the worker stops.
    Worker,
}

/// A resolved fixture value, shared with every consumer in scope.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// The product of a fixture setup: the published value and an optional
/// teardown future, driven when the owning scope ends.
pub struct SetUpFixture {
    pub(crate) value: FixtureValue,
    pub(crate) teardown: Option<BoxFuture<'static, Result<(), TestFailure>>>,
}

impl SetUpFixture {
    /// Publishes a value with no teardown.
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            teardown: None,
        }
    }

    /// Publishes a value along with a teardown future.
    pub fn with_teardown<T: Any + Send + Sync>(
        value: T,
        teardown: BoxFuture<'static, Result<(), TestFailure>>,
    ) -> Self {
        Self {
            value: Arc::new(value),
            teardown: Some(teardown),
        }
    }
}

/// The dependencies handed to a fixture setup, keyed by declared name.
#[derive(Clone, Default)]
pub struct FixtureArgs {
    values: HashMap<String, FixtureValue>,
}

impl FixtureArgs {
    pub(crate) fn new(values: HashMap<String, FixtureValue>) -> Self {
        Self { values }
    }

    /// Returns a declared dependency, downcast to its concrete type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, TestFailure> {
        let value = self.values.get(name).ok_or_else(|| {
            TestFailure::msg(format!("fixture dependency `{name}` was not declared"))
        })?;
        Arc::clone(value).downcast::<T>().map_err(|_| {
            TestFailure::msg(format!("fixture dependency `{name}` has a different type"))
        })
    }
}

/// A fixture setup callback.
pub type FixtureSetupFn = Arc<
    dyn Fn(FixtureArgs) -> BoxFuture<'static, Result<SetUpFixture, TestFailure>> + Send + Sync,
>;
