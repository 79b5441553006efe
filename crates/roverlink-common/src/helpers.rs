//! Common helper functions for Roverlink.

/// Split a single command-line argument string into separate arguments.
///
/// Blank input yields no arguments at all, so an unset argument string never
/// reaches the child process as an empty argument.
pub fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_owned).collect()
}
