//! Stable exit codes for the `devsy` CLI.

/// Run finished with `success` or `no_changes`, or the command completed.
pub const OK: i32 = 0;
/// Run finished with `failure`, or the command hit an unexpected error.
pub const FAILURE: i32 = 1;
/// Inputs or config were rejected before any external call.
pub const INVALID: i32 = 2;
