//! External tool invocation.
//!
//! The [`Invoker`] trait decouples the session loop from the actual coding
//! tool. [`OpencodeInvoker`] spawns `opencode run`; tests use scripted
//! invokers that return canned results without spawning anything.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Capability, SessionOutcome};
use crate::errors::SpawnError;
use crate::io::config::Settings;
use crate::io::process::run_with_timeout;

/// Environment variable the tool reads its permission overrides from.
pub const PERMISSION_ENV: &str = "OPENCODE_PERMISSION";

/// Parameters for one tool invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Working directory (the project root).
    pub workdir: PathBuf,
    /// Rendered prompt, passed as the final argument.
    pub prompt: String,
    pub model: String,
    /// Capabilities declared by the template; everything else is denied.
    pub permissions: BTreeSet<Capability>,
    pub timeout: Duration,
    /// Where to tee raw output, if anywhere.
    pub raw_output_path: Option<PathBuf>,
}

/// Process-level signals observed for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    /// `None` when killed (timeout or signal).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
    /// Stderr matched a rate-limit pattern.
    pub rate_limited: bool,
}

impl InvocationResult {
    /// Classify by process signals only; output content is never inspected.
    pub fn outcome(&self) -> SessionOutcome {
        if self.timed_out {
            SessionOutcome::TimedOut
        } else if self.exit_code == Some(0) {
            SessionOutcome::Success
        } else {
            SessionOutcome::Failure
        }
    }
}

/// Abstraction over tool backends.
pub trait Invoker {
    /// Run one session. `Err` is reserved for the tool not starting at all
    /// ([`SpawnError`]) or local I/O failures; a tool that ran and failed is an
    /// `Ok` result whose [`outcome`](InvocationResult::outcome) says so.
    fn invoke(&self, request: &InvocationRequest) -> Result<InvocationResult>;
}

/// Invoker that spawns `<tool> run --agent <agent> --model <model> <prompt>`.
#[derive(Debug, Clone)]
pub struct OpencodeInvoker {
    tool: String,
    agent: String,
    output_limit_bytes: usize,
    rate_limit_patterns: Vec<Regex>,
}

impl OpencodeInvoker {
    pub fn new(
        tool: impl Into<String>,
        agent: impl Into<String>,
        output_limit_bytes: usize,
        rate_limit_patterns: &[String],
    ) -> Result<Self> {
        Ok(Self {
            tool: tool.into(),
            agent: agent.into(),
            output_limit_bytes,
            rate_limit_patterns: compile_patterns(rate_limit_patterns)?,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.tool.clone(),
            settings.agent.clone(),
            settings.output_limit_bytes,
            &settings.rate_limit_patterns,
        )
    }

    /// Locate the tool on `PATH` before any session runs.
    pub fn preflight(&self) -> Result<PathBuf> {
        let path = which::which(&self.tool).map_err(|err| SpawnError {
            command: self.tool.clone(),
            reason: format!("not found on PATH ({err})"),
        })?;
        debug!(tool = %self.tool, path = %path.display(), "tool located");
        Ok(path)
    }

    fn command(&self, request: &InvocationRequest) -> Result<Command> {
        let mut cmd = Command::new(&self.tool);
        cmd.arg("run")
            .arg("--agent")
            .arg(&self.agent)
            .arg("--model")
            .arg(&request.model)
            .arg(&request.prompt)
            .current_dir(&request.workdir)
            .env(PERMISSION_ENV, permission_env(&request.permissions)?);
        Ok(cmd)
    }

    fn is_rate_limited(&self, stderr: &str) -> bool {
        self.rate_limit_patterns.iter().any(|re| re.is_match(stderr))
    }
}

impl Invoker for OpencodeInvoker {
    #[instrument(skip_all, fields(tool = %self.tool, model = %request.model, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &InvocationRequest) -> Result<InvocationResult> {
        info!(workdir = %request.workdir.display(), "starting tool");
        let cmd = self.command(request)?;
        let output = run_with_timeout(
            cmd,
            request.timeout,
            self.output_limit_bytes,
            request.raw_output_path.as_deref(),
        )
        .with_context(|| format!("run {}", self.tool))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if let Some(path) = &request.raw_output_path {
            append_stderr(path, &stderr, output.timed_out)?;
        }

        let exit_code = if output.timed_out {
            None
        } else {
            output.status.code()
        };
        let rate_limited = exit_code != Some(0) && self.is_rate_limited(&stderr);
        let result = InvocationResult {
            exit_code,
            stdout,
            stderr,
            elapsed: output.elapsed,
            timed_out: output.timed_out,
            rate_limited,
        };

        match result.outcome() {
            SessionOutcome::Success => debug!("tool completed successfully"),
            SessionOutcome::TimedOut => warn!("tool timed out"),
            _ => warn!(exit_code = ?result.exit_code, rate_limited, "tool failed"),
        }
        if rate_limited {
            warn!(tool = %self.tool, "tool reported a rate limit");
        }
        Ok(result)
    }
}

/// JSON object mapping every known capability to `allow` or `deny`.
pub fn permission_env(declared: &BTreeSet<Capability>) -> Result<String> {
    let map: serde_json::Map<String, serde_json::Value> = Capability::ALL
        .iter()
        .map(|cap| {
            let verdict = if declared.contains(cap) { "allow" } else { "deny" };
            (cap.as_str().to_string(), serde_json::Value::from(verdict))
        })
        .collect();
    serde_json::to_string(&map).context("serialize permission map")
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid rate limit pattern '{pattern}'"))
        })
        .collect()
}

fn append_stderr(path: &Path, stderr: &str, timed_out: bool) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open raw output {}", path.display()))?;
    let mut buf = String::from("\n=== stderr ===\n");
    buf.push_str(stderr);
    if timed_out {
        buf.push_str("\n[timed out]\n");
    }
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append raw output {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: Option<i32>, timed_out: bool) -> InvocationResult {
        InvocationResult {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
            timed_out,
            rate_limited: false,
        }
    }

    #[test]
    fn outcome_follows_process_signals() {
        assert_eq!(result(Some(0), false).outcome(), SessionOutcome::Success);
        assert_eq!(result(Some(1), false).outcome(), SessionOutcome::Failure);
        assert_eq!(result(None, false).outcome(), SessionOutcome::Failure);
        assert_eq!(result(None, true).outcome(), SessionOutcome::TimedOut);
        // A timeout is never success, even if an exit code slipped through.
        assert_eq!(result(Some(0), true).outcome(), SessionOutcome::TimedOut);
    }

    #[test]
    fn permission_env_lists_every_capability() {
        let env = permission_env(&BTreeSet::from([Capability::Edit])).expect("env");
        let value: serde_json::Value = serde_json::from_str(&env).expect("json");
        assert_eq!(value["edit"], "allow");
        assert_eq!(value["bash"], "deny");
        assert_eq!(value["webfetch"], "deny");
        assert_eq!(value["external_directory"], "deny");
    }

    #[test]
    fn rate_limit_patterns_are_case_insensitive() {
        let invoker = OpencodeInvoker::new(
            "opencode",
            "autonomous",
            1000,
            &["quota exceeded".to_string(), "rate limit".to_string()],
        )
        .expect("invoker");
        assert!(invoker.is_rate_limited("Error: Rate Limit reached"));
        assert!(!invoker.is_rate_limited("syntax error"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = OpencodeInvoker::new("opencode", "a", 10, &["(".to_string()]).unwrap_err();
        assert!(err.to_string().contains("invalid rate limit pattern"));
    }

    #[test]
    fn preflight_reports_missing_tool_as_spawn_error() {
        let invoker = OpencodeInvoker::new("autopilot-no-such-tool", "a", 10, &[]).expect("invoker");
        let err = invoker.preflight().unwrap_err();
        assert!(err.downcast_ref::<SpawnError>().is_some());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn fake_tool(dir: &Path, script: &str) -> PathBuf {
            let path = dir.join("fake-opencode");
            std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write tool");
            let mut perms = std::fs::metadata(&path).expect("meta").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("chmod");
            path
        }

        fn request(dir: &Path) -> InvocationRequest {
            InvocationRequest {
                workdir: dir.to_path_buf(),
                prompt: "do the thing".to_string(),
                model: "opencode/big-pickle".to_string(),
                permissions: BTreeSet::from([Capability::Bash]),
                timeout: Duration::from_secs(10),
                raw_output_path: Some(dir.join("raw").join("001.log")),
            }
        }

        #[test]
        fn passes_arguments_and_permission_env() {
            let temp = tempfile::tempdir().expect("tempdir");
            let tool = fake_tool(
                temp.path(),
                "echo \"$@\"; echo \"$OPENCODE_PERMISSION\"",
            );
            let invoker = OpencodeInvoker::new(
                tool.to_string_lossy(),
                "autonomous",
                10_000,
                &[],
            )
            .expect("invoker");
            let result = invoker.invoke(&request(temp.path())).expect("invoke");

            assert_eq!(result.outcome(), SessionOutcome::Success);
            let mut lines = result.stdout.lines();
            assert_eq!(
                lines.next(),
                Some("run --agent autonomous --model opencode/big-pickle do the thing")
            );
            assert!(lines.next().expect("env line").contains("\"bash\":\"allow\""));

            let raw = std::fs::read_to_string(temp.path().join("raw/001.log")).expect("raw");
            assert!(raw.starts_with("run --agent autonomous"));
            assert!(raw.contains("=== stderr ==="));
        }

        #[test]
        fn failing_tool_with_quota_message_is_rate_limited_failure() {
            let temp = tempfile::tempdir().expect("tempdir");
            let tool = fake_tool(temp.path(), "echo 'Quota exceeded for model' >&2; exit 1");
            let invoker = OpencodeInvoker::new(
                tool.to_string_lossy(),
                "autonomous",
                10_000,
                &["quota exceeded".to_string()],
            )
            .expect("invoker");
            let result = invoker.invoke(&request(temp.path())).expect("invoke");
            assert_eq!(result.outcome(), SessionOutcome::Failure);
            assert!(result.rate_limited);
            assert_eq!(result.exit_code, Some(1));
        }
    }
}
