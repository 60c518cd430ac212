//! Pause requests via a marker file in the heartbeat directory.
//!
//! `autopilot pause` (or a human with `touch`) creates the marker; a running
//! loop notices it between sessions, removes it and stops.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

/// Source of external pause requests, polled by the session loop.
pub trait PauseSignal {
    /// True once if a pause was requested; the request is consumed.
    fn take_request(&self) -> Result<bool>;
}

/// Marker-file pause signal.
#[derive(Debug, Clone)]
pub struct PauseFile {
    path: PathBuf,
}

impl PauseFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_requested(&self) -> bool {
        self.path.exists()
    }

    /// Create the marker. Requesting twice is harmless.
    pub fn request(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&self.path, format!("requested_at = {}\n", Utc::now().to_rfc3339()))
            .with_context(|| format!("write pause marker {}", self.path.display()))?;
        info!(path = %self.path.display(), "pause requested");
        Ok(())
    }

    /// Remove a stale marker without treating it as a request.
    pub fn clear(&self) -> Result<()> {
        self.take_request().map(|_| ())
    }
}

impl PauseSignal for PauseFile {
    fn take_request(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("remove pause marker {}", self.path.display()))
            }
        }
    }
}
