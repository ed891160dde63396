// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner: dispatcher, worker pool, and worker processes.
//!
//! The dispatcher (in `dispatcher.rs`) coordinates with the external world
//! and owns all bookkeeping. The pool (in `pool.rs`) tracks worker
//! lifetimes. Worker processes are spawned in `spawn.rs` by re-executing
//! the current binary.

mod dispatcher;
mod imp;
mod internal_events;
mod pool;
mod spawn;
#[cfg(test)]
mod test_helpers;

pub use imp::*;

pub(crate) use dispatcher::*;
pub(crate) use internal_events::*;
pub(crate) use pool::*;
pub(crate) use spawn::*;
