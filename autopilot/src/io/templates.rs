//! On-disk prompt template store.
//!
//! Templates live in `.opencode-autopilot/templates/<id>.md`, one per session
//! type. A template may start with a frontmatter block:
//!
//! ```text
//! ---
//! permissions: [edit, bash, webfetch]
//! skip_if: BLUEPRINT.md
//! ---
//! Session {{ index }} of {{ total }} ...
//! ```
//!
//! Files are re-read on every resolve so edits made between sessions take
//! effect on the next one.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::types::{Capability, SessionType};
use crate::errors::TemplateNotFound;

/// A loaded prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: String,
    /// Markdown body after the frontmatter, before rendering.
    pub body: String,
    pub permissions: BTreeSet<Capability>,
    /// Project-relative path; if it exists the session is skipped.
    pub skip_if: Option<PathBuf>,
}

/// Values available to a template body.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub index: u32,
    pub total: u32,
    pub session_type: SessionType,
    pub date: String,
    pub model: &'a str,
    pub topic: Option<&'a str>,
}

impl Template {
    /// Render the body with a fresh minijinja environment.
    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<String> {
        let env = Environment::new();
        let rendered = env
            .render_str(
                &self.body,
                context! {
                    index => ctx.index,
                    total => ctx.total,
                    remaining => ctx.total.saturating_sub(ctx.index),
                    session_type => ctx.session_type.template_id(),
                    date => ctx.date.as_str(),
                    model => ctx.model,
                    topic => ctx.topic.map(str::trim).filter(|s| !s.is_empty()),
                },
            )
            .with_context(|| format!("render template '{}'", self.id))?;
        Ok(rendered)
    }

    /// Compile the body without rendering, surfacing syntax errors early.
    pub fn compile(&self) -> Result<()> {
        let env = Environment::new();
        env.template_from_str(&self.body)
            .with_context(|| format!("compile template '{}'", self.id))?;
        Ok(())
    }
}

/// Directory-backed template registry.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.md"))
    }

    /// Load the template for `session_type`.
    pub fn resolve(&self, session_type: SessionType) -> Result<Template> {
        self.resolve_id(session_type.template_id())
    }

    /// Load the template named `id`. Missing files yield [`TemplateNotFound`].
    pub fn resolve_id(&self, id: &str) -> Result<Template> {
        let path = self.path_for(id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TemplateNotFound {
                    id: id.to_string(),
                    path,
                }
                .into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read template {}", path.display()));
            }
        };
        debug!(id, path = %path.display(), "template resolved");
        parse_template(id, &contents).with_context(|| format!("parse template {}", path.display()))
    }

    /// Resolve and compile every type once, failing on the first missing or
    /// invalid template.
    pub fn check_all(&self, types: &[SessionType]) -> Result<()> {
        for ty in types {
            self.resolve(*ty)?.compile()?;
        }
        Ok(())
    }
}

/// Parse frontmatter and body.
pub fn parse_template(id: &str, contents: &str) -> Result<Template> {
    let (frontmatter, body) = match split_frontmatter(contents) {
        Some((frontmatter, body)) => (Some(frontmatter), body),
        None => (None, contents),
    };

    let mut permissions = BTreeSet::new();
    let mut skip_if = None;
    for line in frontmatter.unwrap_or_default().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            return Err(anyhow!("frontmatter line is not `key: value`: {trimmed}"));
        };
        match key.trim() {
            "permissions" => permissions = parse_permissions(value)?,
            "skip_if" => {
                let value = unquote(value.trim());
                if !value.is_empty() {
                    skip_if = Some(PathBuf::from(value));
                }
            }
            // Other keys (description, notes) are for humans.
            _ => {}
        }
    }

    Ok(Template {
        id: id.to_string(),
        body: body.to_string(),
        permissions,
        skip_if,
    })
}

fn parse_permissions(value: &str) -> Result<BTreeSet<Capability>> {
    let value = value.trim();
    let inner = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(value);
    inner
        .split(',')
        .map(|item| unquote(item.trim()))
        .filter(|item| !item.is_empty())
        .map(str::parse)
        .collect()
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Split `---` delimited frontmatter from the body.
///
/// Returns `None` when the document has no (closed) frontmatter block.
fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let rest = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let frontmatter = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((frontmatter, body));
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TemplateNotFound;

    fn ctx() -> RenderContext<'static> {
        RenderContext {
            index: 2,
            total: 5,
            session_type: SessionType::Build,
            date: "2026-01-02 03:04".to_string(),
            model: "opencode/big-pickle",
            topic: None,
        }
    }

    #[test]
    fn parses_frontmatter_permissions_and_skip() {
        let template = parse_template(
            "blueprint",
            "---\npermissions: [edit, \"bash\"]\nskip_if: BLUEPRINT.md\ndescription: plan\n---\nWrite the plan.\n",
        )
        .expect("parse");
        assert_eq!(
            template.permissions,
            BTreeSet::from([Capability::Edit, Capability::Bash])
        );
        assert_eq!(template.skip_if, Some(PathBuf::from("BLUEPRINT.md")));
        assert_eq!(template.body, "Write the plan.\n");
    }

    #[test]
    fn template_without_frontmatter_is_all_body() {
        let template = parse_template("run", "Improve things.\n").expect("parse");
        assert!(template.permissions.is_empty());
        assert_eq!(template.skip_if, None);
        assert_eq!(template.body, "Improve things.\n");
    }

    #[test]
    fn unclosed_frontmatter_is_treated_as_body() {
        let template = parse_template("run", "---\npermissions: edit\n").expect("parse");
        assert!(template.permissions.is_empty());
        assert!(template.body.starts_with("---"));
    }

    #[test]
    fn unknown_permission_is_an_error() {
        let err = parse_template("run", "---\npermissions: edit, root\n---\nbody\n").unwrap_err();
        assert!(err.to_string().contains("unknown permission 'root'"));
    }

    #[test]
    fn render_exposes_session_variables() {
        let template = parse_template(
            "build",
            "Session {{ index }}/{{ total }} ({{ remaining }} left) {{ session_type }} on {{ date }} with {{ model }}{% if topic %} about {{ topic }}{% endif %}.",
        )
        .expect("parse");
        let rendered = template.render(&ctx()).expect("render");
        assert_eq!(
            rendered,
            "Session 2/5 (3 left) build on 2026-01-02 03:04 with opencode/big-pickle."
        );

        let mut with_topic = ctx();
        with_topic.topic = Some("  a todo app ");
        let rendered = template.render(&with_topic).expect("render");
        assert!(rendered.ends_with("about a todo app."));
    }

    #[test]
    fn missing_template_is_template_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TemplateStore::new(temp.path());
        let err = store.resolve(SessionType::Research).unwrap_err();
        let missing = err
            .downcast_ref::<TemplateNotFound>()
            .expect("template not found");
        assert_eq!(missing.id, "research");
    }

    #[test]
    fn resolve_rereads_edited_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TemplateStore::new(temp.path());
        fs::write(store.path_for("run"), "first\n").expect("write");
        assert_eq!(store.resolve(SessionType::Run).expect("resolve").body, "first\n");
        fs::write(store.path_for("run"), "second\n").expect("rewrite");
        assert_eq!(store.resolve(SessionType::Run).expect("resolve").body, "second\n");
    }

    #[test]
    fn check_all_reports_first_missing_type() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TemplateStore::new(temp.path());
        fs::write(store.path_for("run"), "body\n").expect("write");
        let err = store
            .check_all(&[SessionType::Run, SessionType::Final])
            .unwrap_err();
        let missing = err
            .downcast_ref::<TemplateNotFound>()
            .expect("template not found");
        assert_eq!(missing.id, "final");
    }

    #[test]
    fn check_all_rejects_body_syntax_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TemplateStore::new(temp.path());
        fs::write(store.path_for("run"), "---\npermissions: edit\n---\nSession {{ index\n")
            .expect("write");
        fs::write(store.path_for("final"), "Wrap up.\n").expect("write");
        let err = store
            .check_all(&[SessionType::Run, SessionType::Final])
            .unwrap_err();
        assert!(err.downcast_ref::<TemplateNotFound>().is_none());
        assert!(format!("{err:#}").contains("compile template 'run'"), "{err:#}");
    }
}
