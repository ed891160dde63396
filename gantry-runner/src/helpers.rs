// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Converts a title or path into a filesystem-safe slug.
///
/// Runs of non-alphanumeric characters collapse into single dashes; leading
/// and trailing dashes are trimmed.
pub(crate) fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Returns "test" or "tests" depending on the count.
pub(crate) fn plural_tests(count: usize) -> &'static str {
    if count == 1 { "test" } else { "tests" }
}
