// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time management for test runs: stopwatches and deadlines.

mod deadline;
mod stopwatch;

pub(crate) use deadline::*;
pub(crate) use stopwatch::*;
