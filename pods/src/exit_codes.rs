//! Stable exit codes for `pods` CLI commands.

/// Command succeeded; for `run`, every step was accepted.
pub const OK: i32 = 0;
/// Invalid workflow, config or layout, or any other command error.
pub const INVALID: i32 = 1;
/// `pods run` finished with a rejected or cancelled step.
pub const REJECTED: i32 = 2;
/// `pods run` finished with an infrastructure failure.
pub const INFRASTRUCTURE: i32 = 3;
