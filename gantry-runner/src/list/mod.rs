// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test tree: suites, specs, per-project test expansion, and the
//! execution plan.

mod plan;
mod tree;

pub use plan::*;
pub use tree::*;

use crate::errors::LoaderError;

/// Produces test registrations. Pure discovery; no test is executed.
///
/// The harness crate implements this for the closure users hand to
/// `gantry::main`. Both the parent process and every worker process run the
/// loader against a fresh [`RootRegistry`], so registration must be
/// deterministic.
pub trait Loader: Send + Sync {
    /// Registers fixtures, suites and specs.
    fn load(&self, registry: &mut RootRegistry) -> Result<(), LoaderError>;
}

impl<F> Loader for F
where
    F: Fn(&mut RootRegistry) -> Result<(), LoaderError> + Send + Sync,
{
    fn load(&self, registry: &mut RootRegistry) -> Result<(), LoaderError> {
        self(registry)
    }
}
