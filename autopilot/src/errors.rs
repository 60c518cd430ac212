//! Fatal error classes.
//!
//! These abort a CLI invocation before (or instead of) running sessions. They
//! travel inside `anyhow::Error` and can be recovered with `downcast_ref`.
//! Per-session failures are never errors; they are
//! [`SessionOutcome`](crate::core::types::SessionOutcome)s.

use std::path::PathBuf;

use thiserror::Error;

/// No template file exists for the requested identifier.
#[derive(Debug, Error)]
#[error("template '{id}' not found at {}", path.display())]
pub struct TemplateNotFound {
    pub id: String,
    pub path: PathBuf,
}

/// The persisted status record exists but does not parse.
#[derive(Debug, Error)]
#[error("corrupt run state {}: {reason}", path.display())]
pub struct CorruptState {
    pub path: PathBuf,
    pub reason: String,
}

/// The external tool could not be located or started.
#[derive(Debug, Error)]
#[error("cannot start '{command}': {reason}")]
pub struct SpawnError {
    pub command: String,
    pub reason: String,
}

/// Invalid flags or configuration values detected before any session runs.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UsageError(pub String);
