//! Unattended session loop around the OpenCode CLI.
//!
//! The autopilot plans a sequence of sessions (research, blueprint, build,
//! run, final), renders a prompt template for each, runs `opencode run`, and
//! records every outcome in a git-ignored HEARTBEAT directory so a run can be
//! inspected, paused and continued. The architecture keeps a strict split:
//!
//! - **[`core`]**: pure, deterministic logic (plans, stop conditions).
//!   No I/O, exhaustively testable.
//! - **[`io`]**: side-effecting pieces (config, templates, state store,
//!   process execution). Behind traits where tests need doubles.
//!
//! Orchestration modules ([`session_loop`], [`start`], [`status`]) combine the
//! two to implement CLI commands.

pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session_loop;
pub mod start;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
