//! Project state detection used by `auto` mode and `explore` confirmation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::paths::ProjectPaths;

/// Extensions counted as source code.
const CODE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "go", "rs", "java", "c", "cpp", "h", "hpp", "cs", "rb", "php",
    "swift", "kt", "scala", "vue", "svelte", "html", "css", "scss", "sass", "less", "json", "yaml",
    "yml", "toml", "xml", "sql", "sh", "bash", "zsh", "ps1", "psm1",
];

/// Top-level names never considered project content.
const IGNORED: &[&str] = &[
    "node_modules",
    "__pycache__",
    "venv",
    "dist",
    "build",
    "target",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectState {
    /// Nothing to work from.
    Empty,
    /// Files exist but no blueprint was written yet.
    HasCode,
    /// A blueprint exists but the autopilot never ran here.
    BlueprintOnly,
    /// Blueprint plus heartbeat; mid-cycle.
    Active,
    /// The final session wrote its deploy guide.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub state: ProjectState,
    pub has_blueprint: bool,
    pub has_heartbeat: bool,
    pub has_deploy_guide: bool,
    pub has_source_code: bool,
    /// Visible top-level files (hidden entries and ignored names excluded).
    pub file_count: usize,
}

/// Inspect the top level of the project directory.
pub fn detect(paths: &ProjectPaths) -> Result<Detection> {
    let has_blueprint = paths.blueprint_path.is_file();
    let has_heartbeat = paths.heartbeat_dir.is_dir();
    let has_deploy_guide = paths.deploy_guide_path.is_file();

    let mut file_count = 0;
    let mut has_source_code = false;
    let entries =
        fs::read_dir(&paths.root).with_context(|| format!("read {}", paths.root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", paths.root.display()))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || IGNORED.contains(&name.as_ref()) {
            continue;
        }
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        file_count += 1;
        has_source_code |= is_source_file(&path);
    }

    let state = match (has_blueprint, has_heartbeat) {
        (true, true) if has_deploy_guide => ProjectState::Completed,
        (true, true) => ProjectState::Active,
        (true, false) => ProjectState::BlueprintOnly,
        (false, _) if file_count == 0 => ProjectState::Empty,
        // Text-only projects are treated like code: there is something to build on.
        (false, _) => ProjectState::HasCode,
    };
    debug!(?state, file_count, has_source_code, "project detected");

    Ok(Detection {
        state,
        has_blueprint,
        has_heartbeat,
        has_deploy_guide,
        has_source_code,
        file_count,
    })
}

fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| CODE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}
