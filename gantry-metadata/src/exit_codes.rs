// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for gantry test runs.
///
/// A gantry harness binary always exits with one of these codes.
pub enum GantryExitCode {}

impl GantryExitCode {
    /// All tests passed (flaky tests that eventually passed count as passing).
    pub const OK: i32 = 0;

    /// One or more tests failed, or the run hit its global timeout.
    pub const TEST_RUN_FAILED: i32 = 1;

    /// The run was interrupted by a signal.
    pub const INTERRUPTED: i32 = 2;

    /// The configuration or registration phase failed before any test ran.
    pub const SETUP_ERROR: i32 = 3;
}
