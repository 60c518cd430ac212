//! Shared deterministic types for the session loop.
//!
//! These types are the stable contracts between the controller, the state
//! store and the tool invoker. They serialize in lowercase so the persisted
//! HEARTBEAT files stay readable.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Category of a session; selects which template is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Research,
    Blueprint,
    Build,
    Run,
    Final,
}

impl SessionType {
    pub const ALL: [SessionType; 5] = [
        SessionType::Research,
        SessionType::Blueprint,
        SessionType::Build,
        SessionType::Run,
        SessionType::Final,
    ];

    /// Template identifier for this session type.
    pub fn template_id(self) -> &'static str {
        match self {
            SessionType::Research => "research",
            SessionType::Blueprint => "blueprint",
            SessionType::Build => "build",
            SessionType::Run => "run",
            SessionType::Final => "final",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.template_id())
    }
}

/// Classified result of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Tool exited with status zero.
    Success,
    /// Tool started and exited non-zero.
    Failure,
    /// Tool was killed after exceeding the per-session timeout.
    TimedOut,
    /// Session was not invoked because its `skip_if` artifact already exists.
    Skipped,
}

impl SessionOutcome {
    /// Outcomes counted by the two-strikes policy.
    pub fn is_failure(self) -> bool {
        matches!(self, SessionOutcome::Failure | SessionOutcome::TimedOut)
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionOutcome::Success => "success",
            SessionOutcome::Failure => "failure",
            SessionOutcome::TimedOut => "timed_out",
            SessionOutcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Persisted run status, read by the next CLI invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run in progress, paused, or interrupted by a crash.
    Active,
    /// Every planned session ran.
    Mature,
    /// Aborted by the two-strikes policy; waiting for a human.
    Blocked,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Active => "active",
            RunStatus::Mature => "mature",
            RunStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Shape of a session plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    /// Research first, then blueprint, build and a final pass.
    Explore,
    /// Blueprint, build sessions, final pass.
    Build,
    /// Improvement sessions against an existing blueprint, final pass.
    Run,
}

impl fmt::Display for PlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanMode::Explore => "explore",
            PlanMode::Build => "build",
            PlanMode::Run => "run",
        };
        f.write_str(s)
    }
}

/// Tool capability a template may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Edit,
    Bash,
    Webfetch,
    ExternalDirectory,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Edit,
        Capability::Bash,
        Capability::Webfetch,
        Capability::ExternalDirectory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Edit => "edit",
            Capability::Bash => "bash",
            Capability::Webfetch => "webfetch",
            Capability::ExternalDirectory => "external_directory",
        }
    }
}

impl FromStr for Capability {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Capability::ALL
            .into_iter()
            .find(|cap| cap.as_str() == s)
            .ok_or_else(|| anyhow!("unknown permission '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failure_and_timeout_count_as_strikes() {
        assert!(SessionOutcome::Failure.is_failure());
        assert!(SessionOutcome::TimedOut.is_failure());
        assert!(!SessionOutcome::Success.is_failure());
        assert!(!SessionOutcome::Skipped.is_failure());
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&SessionOutcome::TimedOut).expect("serialize");
        assert_eq!(json, "\"timed_out\"");
    }

    #[test]
    fn capability_parses_known_names() {
        assert_eq!(
            "external_directory".parse::<Capability>().expect("parse"),
            Capability::ExternalDirectory
        );
        assert!("sudo".parse::<Capability>().is_err());
    }
}
