//! HEARTBEAT state store: the run status record and per-run session logs.
//!
//! The controller talks to the [`StateStore`] trait so the backing format can
//! change without touching the loop. [`HeartbeatStore`] keeps everything as
//! plain files under `.opencode-autopilot/HEARTBEAT/`:
//!
//! - `status.json`: the single [`RunState`], replaced atomically;
//! - `sessions/<run_id>.jsonl`: one [`SessionRecord`] per line, append-only;
//! - `sessions/<run_id>/<NNN>.log`: raw tool output per session;
//! - any other `*.md`: documents written by the tool itself, opaque to us.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{PlanMode, RunStatus, SessionOutcome, SessionType};
use crate::errors::CorruptState;
use crate::io::paths::ProjectPaths;

/// Persisted bookkeeping for the current run (`HEARTBEAT/status.json`).
///
/// Every field is required; a record missing one is corrupt rather than
/// silently defaulted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunState {
    /// Identifier of the run; names its session log.
    pub run_id: String,
    /// Plan shape, so `--continue` can rebuild the plan.
    pub mode: PlanMode,
    /// Plan length.
    pub session_count: u32,
    /// Index (1-based) of the most recently started session.
    pub current_index: u32,
    /// Model identifier used for the run.
    pub model: String,
    /// Outcome of `current_index`; `None` while that session is in flight.
    pub last_outcome: Option<SessionOutcome>,
    /// Current streak of failed/timed-out sessions.
    pub consecutive_failures: u32,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// State for a run about to start session `start_index`.
    pub fn begin(
        run_id: impl Into<String>,
        mode: PlanMode,
        session_count: u32,
        start_index: u32,
        model: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            session_count,
            current_index: start_index,
            model: model.into(),
            last_outcome: None,
            consecutive_failures: 0,
            status: RunStatus::Active,
            updated_at: Utc::now(),
        }
    }

    /// Index a resumed controller should run next.
    ///
    /// A session with no recorded outcome never finished (crash mid-invoke)
    /// and is attempted again.
    pub fn resume_index(&self) -> u32 {
        match self.last_outcome {
            Some(_) => self.current_index + 1,
            None => self.current_index,
        }
    }

    fn check(&self) -> std::result::Result<(), String> {
        if self.session_count == 0 {
            return Err("session_count must be > 0".to_string());
        }
        if self.current_index == 0 || self.current_index > self.session_count {
            return Err(format!(
                "current_index {} outside 1..={}",
                self.current_index, self.session_count
            ));
        }
        if self.run_id.trim().is_empty() {
            return Err("run_id must not be empty".to_string());
        }
        Ok(())
    }
}

/// A finalized session. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub index: u32,
    pub session_type: SessionType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: SessionOutcome,
    /// Process exit code; `None` when skipped, timed out or killed by a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Stderr matched a rate-limit pattern.
    #[serde(default)]
    pub rate_limited: bool,
    /// Raw output file, relative to the heartbeat directory.
    pub raw_output_ref: Option<String>,
    pub note: Option<String>,
}

/// A session that has started but not finished. Never persisted.
#[derive(Debug, Clone)]
pub struct PendingSession {
    pub index: u32,
    pub session_type: SessionType,
    pub started_at: DateTime<Utc>,
}

/// Details known once a session ends.
#[derive(Debug, Clone)]
pub struct SessionFinish {
    pub outcome: SessionOutcome,
    pub exit_code: Option<i32>,
    pub rate_limited: bool,
    pub raw_output_ref: Option<String>,
    pub note: Option<String>,
}

impl SessionFinish {
    pub fn skipped(note: impl Into<String>) -> Self {
        Self {
            outcome: SessionOutcome::Skipped,
            exit_code: None,
            rate_limited: false,
            raw_output_ref: None,
            note: Some(note.into()),
        }
    }
}

impl PendingSession {
    pub fn begin(index: u32, session_type: SessionType) -> Self {
        Self {
            index,
            session_type,
            started_at: Utc::now(),
        }
    }

    /// Finalize into a record stamped with the current time.
    pub fn finish(self, finish: SessionFinish) -> SessionRecord {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        SessionRecord {
            index: self.index,
            session_type: self.session_type,
            started_at: self.started_at,
            finished_at,
            outcome: finish.outcome,
            exit_code: finish.exit_code,
            duration_ms,
            rate_limited: finish.rate_limited,
            raw_output_ref: finish.raw_output_ref,
            note: finish.note,
        }
    }
}

/// Where the invoker should tee raw output for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutputTarget {
    pub path: PathBuf,
    /// Value stored in [`SessionRecord::raw_output_ref`].
    pub reference: String,
}

/// Document-store interface owned by the session loop.
pub trait StateStore {
    /// Load the status record. `Ok(None)` when no run was ever recorded;
    /// [`CorruptState`] when a record exists but does not parse.
    fn load_state(&self) -> Result<Option<RunState>>;

    /// Replace the status record. Either fully written or the previous record
    /// remains.
    fn save_state(&self, state: &RunState) -> Result<()>;

    /// Append one finalized record to the log of `run_id`.
    fn append_log(&self, run_id: &str, record: &SessionRecord) -> Result<()>;

    /// All records of `run_id` in append order. Callers may re-read at any time.
    fn read_log(&self, run_id: &str) -> Result<Vec<SessionRecord>>;

    /// Raw output location for a session, if this store keeps one.
    fn raw_output(&self, _run_id: &str, _index: u32) -> Option<RawOutputTarget> {
        None
    }
}

/// File-backed store rooted at the project's HEARTBEAT directory.
#[derive(Debug, Clone)]
pub struct HeartbeatStore {
    paths: ProjectPaths,
}

impl HeartbeatStore {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Markdown documents in the heartbeat directory, sorted by name.
    pub fn list_documents(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.paths.heartbeat_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
        };
        let mut docs = Vec::new();
        for entry in entries {
            let path = entry.with_context(|| format!("read {}", dir.display()))?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "md") {
                docs.push(path);
            }
        }
        docs.sort();
        Ok(docs)
    }

    /// Read a document by file name. Contents are returned as-is.
    pub fn read_document(&self, name: &str) -> Result<Option<String>> {
        let path = self.paths.heartbeat_dir.join(name);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }
}

impl StateStore for HeartbeatStore {
    fn load_state(&self) -> Result<Option<RunState>> {
        load_run_state(&self.paths.status_path)
    }

    fn save_state(&self, state: &RunState) -> Result<()> {
        write_run_state(&self.paths.status_path, state)
    }

    fn append_log(&self, run_id: &str, record: &SessionRecord) -> Result<()> {
        append_record(&self.paths.session_log_path(run_id), record)
    }

    fn read_log(&self, run_id: &str) -> Result<Vec<SessionRecord>> {
        read_records(&self.paths.session_log_path(run_id))
    }

    fn raw_output(&self, run_id: &str, index: u32) -> Option<RawOutputTarget> {
        let path = self.paths.raw_output_path(run_id, index);
        let reference = self.paths.heartbeat_relative(&path);
        Some(RawOutputTarget { path, reference })
    }
}

/// Load run state from disk; `None` if the file does not exist.
pub fn load_run_state(path: &Path) -> Result<Option<RunState>> {
    debug!(path = %path.display(), "loading run state");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read run state {}", path.display()));
        }
    };
    let state: RunState = serde_json::from_str(&contents).map_err(|err| CorruptState {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    state.check().map_err(|reason| CorruptState {
        path: path.to_path_buf(),
        reason,
    })?;
    debug!(run_id = %state.run_id, current_index = state.current_index, status = %state.status, "run state loaded");
    Ok(Some(state))
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_id = %state.run_id, current_index = state.current_index, "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp run state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run state {}", path.display()))?;
    Ok(())
}

fn append_record(path: &Path, record: &SessionRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    // One write per record so a crash leaves at most a torn final line.
    let mut line = serde_json::to_string(record).context("serialize session record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open session log {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append session log {}", path.display()))?;
    debug!(path = %path.display(), index = record.index, outcome = %record.outcome, "session record appended");
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<SessionRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read session log {}", path.display()));
        }
    };

    let complete = contents.ends_with('\n');
    let lines: Vec<&str> = contents.lines().collect();
    let mut records = Vec::with_capacity(lines.len());
    for (n, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) if !complete && n + 1 == lines.len() => {
                warn!(path = %path.display(), err = %err, "ignoring torn final session record");
            }
            Err(err) => {
                return Err(CorruptState {
                    path: path.to_path_buf(),
                    reason: format!("line {}: {err}", n + 1),
                }
                .into());
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, HeartbeatStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = HeartbeatStore::new(ProjectPaths::new(temp.path()));
        (temp, store)
    }

    fn record(index: u32, outcome: SessionOutcome) -> SessionRecord {
        PendingSession::begin(index, SessionType::Build).finish(SessionFinish {
            outcome,
            exit_code: Some(0),
            rate_limited: false,
            raw_output_ref: None,
            note: None,
        })
    }

    /// Verifies save → load preserves all fields, timestamps included.
    #[test]
    fn run_state_round_trips() {
        let (_temp, store) = store();
        let mut state = RunState::begin("run-1", PlanMode::Build, 5, 2, "opencode/big-pickle");
        state.last_outcome = Some(SessionOutcome::TimedOut);
        state.consecutive_failures = 1;
        state.status = RunStatus::Blocked;

        store.save_state(&state).expect("save");
        let loaded = store.load_state().expect("load").expect("present");
        assert_eq!(loaded, state);
        assert!(!store.paths().status_path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_state_is_none() {
        let (_temp, store) = store();
        assert_eq!(store.load_state().expect("load"), None);
    }

    #[test]
    fn unparseable_state_is_corrupt_not_default() {
        let (_temp, store) = store();
        let path = &store.paths().status_path;
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, "{\"run_id\": \"run-1\", \"current_index\": 4}\n").expect("write");

        let err = store.load_state().unwrap_err();
        let corrupt = err.downcast_ref::<CorruptState>().expect("corrupt state");
        assert!(corrupt.reason.contains("missing field"));
        // The original record is left for a human to inspect.
        assert!(fs::read_to_string(path).expect("read").contains("\"current_index\": 4"));
    }

    #[test]
    fn out_of_range_index_is_corrupt() {
        let (_temp, store) = store();
        let mut state = RunState::begin("run-1", PlanMode::Run, 3, 1, "m");
        state.current_index = 9;
        write_run_state(&store.paths().status_path, &state).expect("write");
        let err = store.load_state().unwrap_err();
        assert!(err.downcast_ref::<CorruptState>().is_some());
    }

    #[test]
    fn resume_index_retries_unfinished_session() {
        let mut state = RunState::begin("run-1", PlanMode::Run, 5, 3, "m");
        assert_eq!(state.resume_index(), 3);
        state.last_outcome = Some(SessionOutcome::Success);
        assert_eq!(state.resume_index(), 4);
    }

    #[test]
    fn log_is_append_only_and_ordered() {
        let (_temp, store) = store();
        store.append_log("run-1", &record(1, SessionOutcome::Success)).expect("append 1");
        store.append_log("run-1", &record(2, SessionOutcome::Failure)).expect("append 2");
        let first_read = store.read_log("run-1").expect("read");
        assert_eq!(first_read.len(), 2);

        store.append_log("run-1", &record(3, SessionOutcome::Success)).expect("append 3");
        let second_read = store.read_log("run-1").expect("read");
        let indices: Vec<u32> = second_read.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(&second_read[..2], &first_read[..]);
    }

    #[test]
    fn logs_are_separate_per_run() {
        let (_temp, store) = store();
        store.append_log("run-a", &record(1, SessionOutcome::Success)).expect("append");
        assert!(store.read_log("run-b").expect("read").is_empty());
    }

    #[test]
    fn torn_final_line_is_ignored() {
        let (_temp, store) = store();
        store.append_log("run-1", &record(1, SessionOutcome::Success)).expect("append");
        let path = store.paths().session_log_path("run-1");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{\"index\": 2, \"sess").expect("torn write");

        let records = store.read_log("run-1").expect("read");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn garbage_mid_log_is_corrupt() {
        let (_temp, store) = store();
        let path = store.paths().session_log_path("run-1");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "not json\n").expect("write");
        let err = store.read_log("run-1").unwrap_err();
        assert!(err.downcast_ref::<CorruptState>().is_some());
    }

    #[test]
    fn documents_are_listed_and_read_verbatim() {
        let (_temp, store) = store();
        let dir = &store.paths().heartbeat_dir;
        fs::create_dir_all(dir).expect("mkdir");
        fs::write(dir.join("PLAN.md"), "# Plan\n- [ ] thing\n").expect("write");
        fs::write(dir.join("001.md"), "session notes").expect("write");
        fs::write(dir.join("status.json"), "{}").expect("write");

        let docs = store.list_documents().expect("list");
        let names: Vec<String> = docs
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["001.md", "PLAN.md"]);
        assert_eq!(
            store.read_document("PLAN.md").expect("read").as_deref(),
            Some("# Plan\n- [ ] thing\n")
        );
        assert_eq!(store.read_document("NOPE.md").expect("read"), None);
    }

    #[test]
    fn raw_output_reference_is_heartbeat_relative() {
        let (_temp, store) = store();
        let target = store.raw_output("run-1", 4).expect("target");
        assert_eq!(target.reference, "sessions/run-1/004.log");
        assert!(target.path.ends_with("HEARTBEAT/sessions/run-1/004.log"));
    }
}
