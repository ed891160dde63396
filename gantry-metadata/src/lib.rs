// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine-readable report format for the gantry test runner.
//!
//! The types in this crate are produced by `gantry-runner`'s JSON reporter
//! and consumed by external tools. Field order is stable so that serialized
//! reports can be diffed against golden files.

mod exit_codes;
mod summary;

pub use exit_codes::*;
pub use summary::*;
