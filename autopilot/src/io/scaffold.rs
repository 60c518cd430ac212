//! Project scaffolding: default templates, the agent definition, the
//! heartbeat directory and its `.gitignore` entry.
//!
//! Everything here is idempotent. Existing files are never overwritten so
//! hand-edited templates survive repeated runs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::types::SessionType;
use crate::io::paths::{GITIGNORE_ENTRY, ProjectPaths};

const RESEARCH_TEMPLATE: &str = include_str!("prompts/research.md");
const BLUEPRINT_TEMPLATE: &str = include_str!("prompts/blueprint.md");
const BUILD_TEMPLATE: &str = include_str!("prompts/build.md");
const RUN_TEMPLATE: &str = include_str!("prompts/run.md");
const FINAL_TEMPLATE: &str = include_str!("prompts/final.md");
const AGENT_DEFINITION: &str = include_str!("prompts/autonomous_agent.md");

const GITIGNORE_HEADER: &str = "# opencode-autopilot";

/// Built-in template body for a session type.
pub fn default_template(session_type: SessionType) -> &'static str {
    match session_type {
        SessionType::Research => RESEARCH_TEMPLATE,
        SessionType::Blueprint => BLUEPRINT_TEMPLATE,
        SessionType::Build => BUILD_TEMPLATE,
        SessionType::Run => RUN_TEMPLATE,
        SessionType::Final => FINAL_TEMPLATE,
    }
}

/// Files created by one scaffolding pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScaffoldReport {
    pub created: Vec<PathBuf>,
    pub gitignore_updated: bool,
}

impl ScaffoldReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && !self.gitignore_updated
    }
}

/// Ensure the autopilot layout exists under `paths.root`.
///
/// The agent file is named after `agent` so `opencode run --agent <agent>`
/// resolves it.
pub fn ensure_scaffolded(paths: &ProjectPaths, agent: &str) -> Result<ScaffoldReport> {
    let mut report = ScaffoldReport::default();

    create_dir(&paths.templates_dir)?;
    create_dir(&paths.heartbeat_dir)?;
    for session_type in SessionType::ALL {
        let path = paths
            .templates_dir
            .join(format!("{}.md", session_type.template_id()));
        if write_if_missing(&path, default_template(session_type))? {
            report.created.push(path);
        }
    }

    let agent_path = paths.agents_dir.join(format!("{agent}.md"));
    if write_if_missing(&agent_path, AGENT_DEFINITION)? {
        report.created.push(agent_path);
    }

    report.gitignore_updated = ensure_gitignore_entry(&paths.gitignore_path)?;

    if report.is_noop() {
        debug!(root = %paths.root.display(), "already scaffolded");
    } else {
        info!(
            root = %paths.root.display(),
            created = report.created.len(),
            gitignore_updated = report.gitignore_updated,
            "scaffolded project"
        );
    }
    Ok(report)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_if_missing(path: &Path, contents: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))?;
    Ok(true)
}

fn ensure_gitignore_entry(path: &Path) -> Result<bool> {
    let existing = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    if existing.lines().any(|line| line.trim() == GITIGNORE_ENTRY) {
        return Ok(false);
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    if !updated.is_empty() {
        updated.push('\n');
    }
    updated.push_str(GITIGNORE_HEADER);
    updated.push('\n');
    updated.push_str(GITIGNORE_ENTRY);
    updated.push('\n');
    fs::write(path, updated).with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::templates::{TemplateStore, parse_template};

    #[test]
    fn scaffold_creates_layout_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());

        let first = ensure_scaffolded(&paths, "autonomous").expect("scaffold");
        assert_eq!(first.created.len(), SessionType::ALL.len() + 1);
        assert!(first.gitignore_updated);
        assert!(paths.heartbeat_dir.is_dir());
        assert!(paths.agents_dir.join("autonomous.md").is_file());

        let second = ensure_scaffolded(&paths, "autonomous").expect("rescaffold");
        assert!(second.is_noop());
    }

    #[test]
    fn scaffold_keeps_hand_edited_templates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        fs::create_dir_all(&paths.templates_dir).expect("mkdir");
        fs::write(paths.templates_dir.join("run.md"), "my own prompt\n").expect("write");

        ensure_scaffolded(&paths, "autonomous").expect("scaffold");
        let store = TemplateStore::new(&paths.templates_dir);
        assert_eq!(
            store.resolve(SessionType::Run).expect("resolve").body,
            "my own prompt\n"
        );
    }

    #[test]
    fn gitignore_entry_is_appended_after_existing_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        fs::write(&paths.gitignore_path, "target").expect("write");

        ensure_scaffolded(&paths, "autonomous").expect("scaffold");
        let contents = fs::read_to_string(&paths.gitignore_path).expect("read");
        assert!(contents.starts_with("target\n\n# opencode-autopilot\n"));
        assert_eq!(contents.matches(GITIGNORE_ENTRY).count(), 1);
    }

    #[test]
    fn default_templates_parse() {
        for session_type in SessionType::ALL {
            let template = parse_template(session_type.template_id(), default_template(session_type))
                .expect("default template parses");
            assert!(!template.permissions.is_empty(), "{session_type}");
        }
        let blueprint = parse_template("blueprint", BLUEPRINT_TEMPLATE).expect("parse");
        assert_eq!(blueprint.skip_if, Some(PathBuf::from("BLUEPRINT.md")));
    }
}
