//! Session loop controller.
//!
//! Drives a [`SessionPlan`] from a starting index: resolve the template,
//! invoke the tool, append the record, persist [`RunState`], then ask
//! [`decide`] what happens next. Exactly one invocation is in flight at a
//! time.
//!
//! Persistence order per session:
//! 1. `RunState{current_index = index, last_outcome = None}` before invoking,
//!    so a crash mid-invoke resumes at the same index;
//! 2. the finalized [`SessionRecord`] is appended;
//! 3. `RunState{last_outcome = Some(..)}` plus the terminal status, if any.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{Local, Utc};
use tracing::{debug, info, warn};

use crate::core::plan::SessionPlan;
use crate::core::transition::{ControllerState, Decision, Transition, decide};
use crate::core::types::SessionOutcome;
use crate::errors::UsageError;
use crate::io::invoker::{InvocationRequest, InvocationResult, Invoker};
use crate::io::pause::{PauseFile, PauseSignal};
use crate::io::state_store::{PendingSession, RunState, SessionFinish, SessionRecord, StateStore};
use crate::io::templates::{RenderContext, TemplateStore};

const NOTE_LIMIT: usize = 240;

/// Settings fixed for the duration of one loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Project root; the tool runs here and `skip_if` paths resolve against it.
    pub workdir: PathBuf,
    pub model: String,
    pub interval: Duration,
    pub session_timeout: Duration,
    /// Free-text hint exposed to templates as `topic`.
    pub topic: Option<String>,
}

/// Where a loop starts.
#[derive(Debug, Clone)]
pub struct Launch {
    pub run_id: String,
    pub plan: SessionPlan,
    /// 1-based; sessions before it are never invoked.
    pub start_index: u32,
    /// Failure streak carried over from a continued run.
    pub consecutive_failures: u32,
}

/// Pause polling and the inter-session wait.
pub trait Pacer {
    /// Consume a pending pause request, if any.
    fn pause_requested(&self) -> Result<bool>;

    /// Wait `interval`, returning early with `true` if a pause is requested.
    fn wait(&self, interval: Duration) -> Result<bool>;
}

/// Real pacer: sleeps in short ticks and polls the pause marker.
#[derive(Debug, Clone)]
pub struct SleepPacer {
    pause: PauseFile,
    tick: Duration,
}

impl SleepPacer {
    pub fn new(pause: PauseFile) -> Self {
        Self {
            pause,
            tick: Duration::from_secs(1),
        }
    }
}

impl Pacer for SleepPacer {
    fn pause_requested(&self) -> Result<bool> {
        self.pause.take_request()
    }

    fn wait(&self, interval: Duration) -> Result<bool> {
        let deadline = Instant::now() + interval;
        loop {
            if self.pause.take_request()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            thread::sleep(self.tick.min(deadline - now));
        }
    }
}

/// Reason why [`run_loop`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// Every planned session ran.
    Completed,
    /// Two consecutive failures/timeouts.
    Aborted,
    /// A pause was requested; `next_index` is where a continued run starts.
    Paused { next_index: u32 },
}

impl LoopStop {
    pub fn state(self) -> ControllerState {
        match self {
            LoopStop::Completed => ControllerState::Completed,
            LoopStop::Aborted => ControllerState::Aborted,
            LoopStop::Paused { .. } => ControllerState::Paused,
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub started_at_index: u32,
    pub sessions_executed: u32,
    pub last_index: u32,
    pub stop: LoopStop,
}

/// External collaborators of the loop.
pub struct LoopDeps<'a, I, S, P> {
    pub templates: &'a TemplateStore,
    pub invoker: &'a I,
    pub store: &'a S,
    pub pacer: &'a P,
}

/// Run sessions `launch.start_index..=plan.len()` until the plan completes,
/// the two-strikes rule aborts, or a pause is requested.
///
/// `on_session` is called after each finalized record is persisted.
///
/// Errors are fatal classes only (template, state or spawn problems); the
/// persisted state stays resumable when one escapes mid-run.
pub fn run_loop<I, S, P, F>(
    deps: &LoopDeps<'_, I, S, P>,
    config: &LoopConfig,
    launch: &Launch,
    mut on_session: F,
) -> Result<LoopOutcome>
where
    I: Invoker,
    S: StateStore,
    P: Pacer,
    F: FnMut(&SessionRecord, &Decision),
{
    let session_count = launch.plan.len();
    if launch.start_index == 0 || launch.start_index > session_count {
        return Err(UsageError(format!(
            "resume index {} is outside 1..={session_count}",
            launch.start_index
        ))
        .into());
    }

    info!(
        run_id = %launch.run_id,
        mode = %launch.plan.mode(),
        start_index = launch.start_index,
        session_count,
        "session loop starting"
    );

    let mut state = RunState::begin(
        launch.run_id.clone(),
        launch.plan.mode(),
        session_count,
        launch.start_index,
        config.model.clone(),
    );
    state.consecutive_failures = launch.consecutive_failures;

    let mut index = launch.start_index;
    let mut sessions_executed = 0u32;
    loop {
        let session_type = launch
            .plan
            .session_type(index)
            .ok_or_else(|| anyhow!("plan has no session {index}"))?;

        state.current_index = index;
        state.last_outcome = None;
        state.updated_at = Utc::now();
        deps.store.save_state(&state)?;

        let pending = PendingSession::begin(index, session_type);
        info!(index, session_count, %session_type, "session starting");
        let template = deps.templates.resolve(session_type)?;

        let skip_marker = template
            .skip_if
            .as_ref()
            .filter(|rel| config.workdir.join(rel).exists());
        let finish = if let Some(marker) = skip_marker {
            info!(index, marker = %marker.display(), "skip condition met");
            SessionFinish::skipped(format!("skipped: {} exists", marker.display()))
        } else {
            let prompt = template.render(&RenderContext {
                index,
                total: session_count,
                session_type,
                date: Local::now().format("%Y-%m-%d %H:%M").to_string(),
                model: &config.model,
                topic: config.topic.as_deref(),
            })?;
            let raw = deps.store.raw_output(&launch.run_id, index);
            let request = InvocationRequest {
                workdir: config.workdir.clone(),
                prompt,
                model: config.model.clone(),
                permissions: template.permissions.clone(),
                timeout: config.session_timeout,
                raw_output_path: raw.as_ref().map(|target| target.path.clone()),
            };
            let result = deps.invoker.invoke(&request)?;
            SessionFinish {
                outcome: result.outcome(),
                exit_code: result.exit_code,
                rate_limited: result.rate_limited,
                raw_output_ref: raw.map(|target| target.reference),
                note: failure_note(&result, config.session_timeout),
            }
        };

        let record = pending.finish(finish);
        deps.store.append_log(&launch.run_id, &record)?;
        sessions_executed += 1;

        let decision = decide(index, session_count, record.outcome, state.consecutive_failures);
        state.last_outcome = Some(record.outcome);
        state.consecutive_failures = decision.consecutive_failures;
        if let Some(status) = decision.transition.terminal_status() {
            state.status = status;
        }
        state.updated_at = Utc::now();
        deps.store.save_state(&state)?;

        match record.outcome {
            SessionOutcome::Failure | SessionOutcome::TimedOut => warn!(
                index,
                outcome = %record.outcome,
                streak = decision.consecutive_failures,
                "session did not succeed"
            ),
            _ => info!(index, outcome = %record.outcome, duration_ms = record.duration_ms, "session finished"),
        }
        on_session(&record, &decision);

        let stop = match decision.transition {
            Transition::Complete => Some(LoopStop::Completed),
            Transition::Abort => Some(LoopStop::Aborted),
            Transition::Continue { next_index, wait } => {
                let paused = deps.pacer.pause_requested()?
                    || (wait && !config.interval.is_zero() && {
                        debug!(secs = config.interval.as_secs(), "waiting before next session");
                        deps.pacer.wait(config.interval)?
                    });
                if paused {
                    info!(next_index, "pause requested");
                    Some(LoopStop::Paused { next_index })
                } else {
                    index = next_index;
                    None
                }
            }
        };

        if let Some(stop) = stop {
            info!(run_id = %launch.run_id, state = ?stop.state(), sessions_executed, "session loop stopped");
            return Ok(LoopOutcome {
                run_id: launch.run_id.clone(),
                started_at_index: launch.start_index,
                sessions_executed,
                last_index: index,
                stop,
            });
        }
    }
}

/// Short human-readable reason for a non-success session.
fn failure_note(result: &InvocationResult, timeout: Duration) -> Option<String> {
    match result.outcome() {
        SessionOutcome::TimedOut => Some(format!("timed out after {}s", timeout.as_secs())),
        SessionOutcome::Failure => {
            let tail = result
                .stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("no stderr output");
            let tail: String = tail.chars().take(NOTE_LIMIT).collect();
            let prefix = if result.rate_limited { "rate limited: " } else { "" };
            Some(format!("{prefix}{tail}"))
        }
        SessionOutcome::Success | SessionOutcome::Skipped => None,
    }
}
