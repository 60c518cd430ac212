//! Canonical project paths used by the autopilot.

use std::path::{Path, PathBuf};

/// Directory under the project root owned by the autopilot.
pub const AUTOPILOT_DIR: &str = ".opencode-autopilot";
/// Heartbeat directory name (git-ignored state store).
pub const HEARTBEAT_DIR: &str = "HEARTBEAT";
/// Entry added to the project's `.gitignore`.
pub const GITIGNORE_ENTRY: &str = ".opencode-autopilot/HEARTBEAT/";

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub autopilot_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub heartbeat_dir: PathBuf,
    pub status_path: PathBuf,
    pub pause_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub agents_dir: PathBuf,
    pub blueprint_path: PathBuf,
    pub deploy_guide_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let autopilot_dir = root.join(AUTOPILOT_DIR);
        let heartbeat_dir = autopilot_dir.join(HEARTBEAT_DIR);
        Self {
            templates_dir: autopilot_dir.join("templates"),
            status_path: heartbeat_dir.join("status.json"),
            pause_path: heartbeat_dir.join("PAUSE"),
            sessions_dir: heartbeat_dir.join("sessions"),
            deploy_guide_path: heartbeat_dir.join("DEPLOY_GUIDE.md"),
            config_path: root.join(".autopilot.toml"),
            gitignore_path: root.join(".gitignore"),
            agents_dir: root.join(".opencode").join("agents"),
            blueprint_path: root.join("BLUEPRINT.md"),
            autopilot_dir,
            heartbeat_dir,
            root,
        }
    }

    /// Append-only session log for `run_id`.
    pub fn session_log_path(&self, run_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{run_id}.jsonl"))
    }

    /// Raw output capture for session `index` of `run_id`.
    pub fn raw_output_path(&self, run_id: &str, index: u32) -> PathBuf {
        self.sessions_dir.join(run_id).join(format!("{index:03}.log"))
    }

    /// `path` relative to the heartbeat directory, for records.
    pub fn heartbeat_relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.heartbeat_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}
