//! Layered autopilot configuration.
//!
//! Two TOML layers feed the effective settings: a global file shared by every
//! project and `.autopilot.toml` in the project root. Project values override
//! global values key by key; CLI flags override both. Every key is optional in
//! a layer so that `autopilot config` can update one value at a time.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_MODEL: &str = "opencode/big-pickle";
pub const DEFAULT_SESSIONS: u32 = 10;
pub const DEFAULT_INTERVAL_MINUTES: u64 = 30;
pub const DEFAULT_AGENT: &str = "autonomous";
pub const DEFAULT_TOOL: &str = "opencode";
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 100_000;
pub const DEFAULT_RATE_LIMIT_PATTERNS: [&str; 3] =
    ["insufficient balance", "quota exceeded", "rate limit"];

/// Environment variable that overrides the global config location.
pub const GLOBAL_CONFIG_ENV: &str = "AUTOPILOT_GLOBAL_CONFIG";

/// One config file. Missing keys inherit from the layer below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    /// Model identifier passed to the tool (`--model`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Total sessions in a plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<u32>,
    /// Wait between sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u64>,
    /// OpenCode agent name (`--agent`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Tool binary to invoke.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Wall-clock limit for one session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_secs: Option<u64>,
    /// In-memory cap for captured stdout/stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_limit_bytes: Option<usize>,
    /// Case-insensitive regexes that mark stderr as a rate-limit failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_patterns: Option<Vec<String>>,
}

impl ConfigLayer {
    /// Overlay `upper` on top of `self`; keys set in `upper` win.
    pub fn overlay(self, upper: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            model: upper.model.or(self.model),
            sessions: upper.sessions.or(self.sessions),
            interval_minutes: upper.interval_minutes.or(self.interval_minutes),
            agent: upper.agent.or(self.agent),
            tool: upper.tool.or(self.tool),
            session_timeout_secs: upper.session_timeout_secs.or(self.session_timeout_secs),
            output_limit_bytes: upper.output_limit_bytes.or(self.output_limit_bytes),
            rate_limit_patterns: upper.rate_limit_patterns.or(self.rate_limit_patterns),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ConfigLayer::default()
    }

    fn validate(&self) -> Result<()> {
        if self.sessions == Some(0) {
            return Err(anyhow!("sessions must be > 0"));
        }
        if self.session_timeout_secs == Some(0) {
            return Err(anyhow!("session_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == Some(0) {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (key, value) in [
            ("model", &self.model),
            ("agent", &self.agent),
            ("tool", &self.tool),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(anyhow!("{key} must not be empty"));
            }
        }
        Ok(())
    }
}

/// Which layer a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Project,
    Global,
}

/// Locations of both config layers.
#[derive(Debug, Clone)]
pub struct ConfigFiles {
    pub project: PathBuf,
    /// `None` when no config directory can be determined for this user.
    pub global: Option<PathBuf>,
}

impl ConfigFiles {
    /// Resolve layer paths for `project_root`.
    ///
    /// The global file is `global_override` if given, else
    /// `<config_dir>/opencode-autopilot/config.toml`.
    pub fn resolve(project_root: &Path, global_override: Option<PathBuf>) -> Self {
        let global = global_override.or_else(|| {
            dirs::config_dir().map(|dir| dir.join("opencode-autopilot").join("config.toml"))
        });
        Self {
            project: project_root.join(".autopilot.toml"),
            global,
        }
    }

    pub fn path(&self, scope: Scope) -> Result<&Path> {
        match scope {
            Scope::Project => Ok(&self.project),
            Scope::Global => self
                .global
                .as_deref()
                .ok_or_else(|| anyhow!("no global config location (set {GLOBAL_CONFIG_ENV})")),
        }
    }

    /// Load both layers.
    pub fn load(&self) -> Result<LoadedConfig> {
        let global = match &self.global {
            Some(path) => load_layer(path)?,
            None => ConfigLayer::default(),
        };
        let project = load_layer(&self.project)?;
        Ok(LoadedConfig { global, project })
    }
}

/// Both layers as read from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedConfig {
    pub global: ConfigLayer,
    pub project: ConfigLayer,
}

impl LoadedConfig {
    /// Project overrides global.
    pub fn effective(&self) -> ConfigLayer {
        self.global.clone().overlay(self.project.clone())
    }
}

/// Fully resolved settings for one run. Immutable for its duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub model: String,
    pub sessions: u32,
    pub interval: Duration,
    pub agent: String,
    pub tool: String,
    pub session_timeout: Duration,
    pub output_limit_bytes: usize,
    pub rate_limit_patterns: Vec<String>,
}

impl Settings {
    /// Fill unset keys of `layer` with built-in defaults.
    pub fn from_layer(layer: &ConfigLayer) -> Result<Self> {
        layer.validate()?;
        let interval_minutes = layer.interval_minutes.unwrap_or(DEFAULT_INTERVAL_MINUTES);
        Ok(Self {
            model: layer
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            sessions: layer.sessions.unwrap_or(DEFAULT_SESSIONS),
            interval: Duration::from_secs(interval_minutes.saturating_mul(60)),
            agent: layer
                .agent
                .clone()
                .unwrap_or_else(|| DEFAULT_AGENT.to_string()),
            tool: layer.tool.clone().unwrap_or_else(|| DEFAULT_TOOL.to_string()),
            session_timeout: Duration::from_secs(
                layer
                    .session_timeout_secs
                    .unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS),
            ),
            output_limit_bytes: layer
                .output_limit_bytes
                .unwrap_or(DEFAULT_OUTPUT_LIMIT_BYTES),
            rate_limit_patterns: layer.rate_limit_patterns.clone().unwrap_or_else(|| {
                DEFAULT_RATE_LIMIT_PATTERNS
                    .iter()
                    .map(|p| p.to_string())
                    .collect()
            }),
        })
    }
}

/// Layer an effective value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Default,
    Global,
    Project,
}

impl Source {
    fn pick<T>(project: &Option<T>, global: &Option<T>) -> Self {
        if project.is_some() {
            Source::Project
        } else if global.is_some() {
            Source::Global
        } else {
            Source::Default
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Default => "default",
            Source::Global => "global",
            Source::Project => "project",
        }
    }
}

/// One effective key for `config --show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: &'static str,
    pub value: String,
    pub source: Source,
}

impl LoadedConfig {
    /// Effective value and origin of every key, in file order.
    pub fn describe(&self) -> Result<Vec<ConfigEntry>> {
        let settings = Settings::from_layer(&self.effective())?;
        let (g, p) = (&self.global, &self.project);
        let entry = |key, value: String, source| ConfigEntry { key, value, source };
        Ok(vec![
            entry("model", settings.model, Source::pick(&p.model, &g.model)),
            entry(
                "sessions",
                settings.sessions.to_string(),
                Source::pick(&p.sessions, &g.sessions),
            ),
            entry(
                "interval_minutes",
                (settings.interval.as_secs() / 60).to_string(),
                Source::pick(&p.interval_minutes, &g.interval_minutes),
            ),
            entry("agent", settings.agent, Source::pick(&p.agent, &g.agent)),
            entry("tool", settings.tool, Source::pick(&p.tool, &g.tool)),
            entry(
                "session_timeout_secs",
                settings.session_timeout.as_secs().to_string(),
                Source::pick(&p.session_timeout_secs, &g.session_timeout_secs),
            ),
            entry(
                "output_limit_bytes",
                settings.output_limit_bytes.to_string(),
                Source::pick(&p.output_limit_bytes, &g.output_limit_bytes),
            ),
            entry(
                "rate_limit_patterns",
                settings.rate_limit_patterns.join(", "),
                Source::pick(&p.rate_limit_patterns, &g.rate_limit_patterns),
            ),
        ])
    }
}

/// Load one layer from a TOML file.
///
/// If the file is missing, returns an empty layer.
pub fn load_layer(path: &Path) -> Result<ConfigLayer> {
    if !path.exists() {
        debug!(path = %path.display(), "config layer missing");
        return Ok(ConfigLayer::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let layer: ConfigLayer =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    layer
        .validate()
        .with_context(|| format!("invalid {}", path.display()))?;
    Ok(layer)
}

/// Merge `updates` into the layer at `path` and write it back atomically.
pub fn update_layer(path: &Path, updates: ConfigLayer) -> Result<ConfigLayer> {
    let merged = load_layer(path)?.overlay(updates);
    write_layer(path, &merged)?;
    Ok(merged)
}

/// Atomically write a layer to disk (temp file + rename).
pub fn write_layer(path: &Path, layer: &ConfigLayer) -> Result<()> {
    layer.validate()?;
    let mut buf = toml::to_string_pretty(layer).context("serialize config toml")?;
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
