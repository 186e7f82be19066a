//! Stable exit codes for planter CLI commands.

/// Command succeeded; for `solve`, the session completed.
pub const OK: i32 = 0;
/// Invalid invocation, configuration, or session id.
pub const INVALID: i32 = 1;
/// The session finished with status `failed`.
pub const FAILED: i32 = 2;
/// The session ran out of budget or was stopped.
pub const INCOMPLETE: i32 = 3;
