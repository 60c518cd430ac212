//! `autopilot status`: a read-only summary of the project and its last run.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Result;

use crate::core::plan::SessionPlan;
use crate::core::types::RunStatus;
use crate::io::detect::{Detection, detect};
use crate::io::pause::PauseFile;
use crate::io::state_store::{HeartbeatStore, RunState, SessionRecord, StateStore};

/// Records shown under "recent sessions".
const RECENT_SESSIONS: usize = 5;

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub detection: Detection,
    pub run: Option<RunState>,
    /// Tail of the current run's log, oldest first.
    pub recent: Vec<SessionRecord>,
    pub logged_sessions: usize,
    pub pause_requested: bool,
    pub documents: Vec<PathBuf>,
}

/// Gather the report. Corrupt state is an error, never an empty report.
pub fn collect(store: &HeartbeatStore) -> Result<StatusReport> {
    let paths = store.paths();
    let detection = detect(paths)?;
    let run = store.load_state()?;
    let (recent, logged_sessions) = match &run {
        Some(state) => {
            let log = store.read_log(&state.run_id)?;
            let total = log.len();
            let recent = log.into_iter().skip(total.saturating_sub(RECENT_SESSIONS)).collect();
            (recent, total)
        }
        None => (Vec::new(), 0),
    };
    Ok(StatusReport {
        detection,
        run,
        recent,
        logged_sessions,
        pause_requested: PauseFile::new(&paths.pause_path).is_requested(),
        documents: store.list_documents()?,
    })
}

impl StatusReport {
    /// Next thing the user can do, if anything.
    pub fn hint(&self) -> Option<&'static str> {
        let state = self.run.as_ref()?;
        match state.status {
            RunStatus::Mature => None,
            RunStatus::Blocked => {
                Some("inspect the last sessions, then `autopilot run --continue` to resume")
            }
            RunStatus::Active if self.pause_requested => {
                Some("a pause is pending; the running loop stops after the current session")
            }
            RunStatus::Active => Some("`autopilot run --continue` resumes this run"),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "project: {:?}", self.detection.state);

        match &self.run {
            None => {
                let _ = writeln!(out, "run: none recorded");
            }
            Some(state) => {
                let _ = writeln!(out, "run: {} ({} plan, {})", state.run_id, state.mode, state.status);
                let session_type = SessionPlan::build(state.mode, state.session_count)
                    .ok()
                    .and_then(|plan| plan.session_type(state.current_index));
                let current = match (session_type, state.last_outcome) {
                    (Some(ty), Some(outcome)) => format!("{ty}, {outcome}"),
                    (Some(ty), None) => format!("{ty}, unfinished"),
                    (None, _) => "unknown".to_string(),
                };
                let _ = writeln!(
                    out,
                    "session: {}/{} ({current})",
                    state.current_index, state.session_count
                );
                let _ = writeln!(out, "model: {}", state.model);
                let _ = writeln!(out, "consecutive failures: {}", state.consecutive_failures);
                let _ = writeln!(out, "updated: {}", state.updated_at.to_rfc3339());
            }
        }

        if !self.recent.is_empty() {
            let _ = writeln!(
                out,
                "recent sessions ({} of {}):",
                self.recent.len(),
                self.logged_sessions
            );
            for record in &self.recent {
                let _ = write!(
                    out,
                    "  {:03} {:<9} {:<9} {:>6}s",
                    record.index,
                    record.session_type.to_string(),
                    record.outcome.to_string(),
                    record.duration_ms / 1000
                );
                if record.rate_limited {
                    out.push_str(" [rate limited]");
                }
                if let Some(note) = &record.note {
                    let _ = write!(out, "  {note}");
                }
                out.push('\n');
            }
        }

        if self.pause_requested {
            out.push_str("pause: requested\n");
        }
        if !self.documents.is_empty() {
            let names: Vec<String> = self
                .documents
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            let _ = writeln!(out, "documents: {}", names.join(", "));
        }
        if let Some(hint) = self.hint() {
            let _ = writeln!(out, "hint: {hint}");
        }
        out
    }
}
