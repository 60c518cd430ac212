//! Stable exit codes for autopilot CLI commands.

/// Command succeeded, or the session loop completed its plan.
pub const OK: i32 = 0;
/// Invalid arguments/config, or a fatal error before any session ran.
pub const INVALID: i32 = 1;
/// The loop aborted after two consecutive failed sessions.
pub const ABORTED: i32 = 2;
/// The loop stopped between sessions on a pause request.
pub const PAUSED: i32 = 3;
