//! Orchestration for starting (or continuing) a run.
//!
//! Turns the CLI intent, the layered config and any persisted [`RunState`]
//! into a [`Launch`] plus [`LoopConfig`] for the session loop. Nothing here
//! invokes the tool; every error is raised before the first session.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::plan::SessionPlan;
use crate::core::types::{PlanMode, RunStatus};
use crate::errors::UsageError;
use crate::io::config::{ConfigLayer, LoadedConfig, Settings};
use crate::io::detect::{ProjectState, detect};
use crate::io::invoker::OpencodeInvoker;
use crate::io::paths::ProjectPaths;
use crate::io::state_store::{RunState, StateStore};
use crate::io::templates::TemplateStore;
use crate::session_loop::{Launch, LoopConfig};

/// Run mode requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChoice {
    /// Pick build or run from the project's contents.
    Auto,
    Explore,
    Build,
    Run,
}

/// Flags shared by the run-style subcommands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub sessions: Option<u32>,
    pub interval_minutes: Option<u64>,
    pub resume: Option<u32>,
    pub continue_run: bool,
    pub model: Option<String>,
}

impl RunFlags {
    /// CLI overrides as the topmost config layer.
    fn as_layer(&self) -> ConfigLayer {
        ConfigLayer {
            model: self.model.clone(),
            sessions: self.sessions,
            interval_minutes: self.interval_minutes,
            ..ConfigLayer::default()
        }
    }
}

/// Everything the loop needs, resolved.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub launch: Launch,
    pub loop_config: LoopConfig,
    pub settings: Settings,
    /// True when `--continue` picked up an existing run id.
    pub continued: bool,
}

/// Resolve a run from CLI intent, config layers and persisted state.
pub fn prepare<S: StateStore>(
    paths: &ProjectPaths,
    config: &LoadedConfig,
    store: &S,
    mode: ModeChoice,
    flags: &RunFlags,
    topic: Option<&str>,
) -> Result<Prepared> {
    let effective = config.effective().overlay(flags.as_layer());
    let settings = Settings::from_layer(&effective).map_err(|err| UsageError(format!("{err:#}")))?;

    // Read for every mode: a corrupt record must stop the run, not be overwritten.
    let previous = store.load_state()?;
    let (launch, model, continued) = if flags.continue_run {
        let (launch, model) = continue_launch(previous, mode, flags)?;
        (launch, model, true)
    } else {
        if let Some(previous) = &previous {
            debug!(run_id = %previous.run_id, status = %previous.status, "new run supersedes persisted run");
        }
        let launch = fresh_launch(paths, store, mode, flags, &settings)?;
        (launch, settings.model.clone(), false)
    };

    let loop_config = LoopConfig {
        workdir: paths.root.clone(),
        model,
        interval: settings.interval,
        session_timeout: settings.session_timeout,
        topic: topic.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string),
    };
    info!(
        run_id = %launch.run_id,
        mode = %launch.plan.mode(),
        start_index = launch.start_index,
        session_count = launch.plan.len(),
        continued,
        "run prepared"
    );
    Ok(Prepared {
        launch,
        loop_config,
        settings,
        continued,
    })
}

fn continue_launch(
    previous: Option<RunState>,
    mode: ModeChoice,
    flags: &RunFlags,
) -> Result<(Launch, String)> {
    if flags.resume.is_some() {
        return Err(UsageError("--continue and --resume cannot be combined".to_string()).into());
    }
    let state = previous.ok_or_else(|| UsageError("no previous run to continue".to_string()))?;
    if state.status == RunStatus::Mature {
        return Err(UsageError(format!(
            "run {} already completed; start a new run instead of --continue",
            state.run_id
        ))
        .into());
    }
    if let Some(requested) = explicit_mode(mode)
        && requested != state.mode
    {
        warn!(requested = %requested, persisted = %state.mode, "--continue keeps the persisted plan mode");
    }
    if flags.sessions.is_some() {
        warn!(session_count = state.session_count, "--continue keeps the persisted session count");
    }

    let start_index = state.resume_index();
    if start_index > state.session_count {
        return Err(UsageError(format!(
            "run {} has no sessions left to continue",
            state.run_id
        ))
        .into());
    }
    let consecutive_failures = match state.status {
        // A human looked at a blocked run and chose to continue it.
        RunStatus::Blocked => 0,
        _ => state.consecutive_failures,
    };
    let plan = SessionPlan::build(state.mode, state.session_count)?;
    debug!(run_id = %state.run_id, start_index, status = %state.status, "continuing run");

    let model = flags.model.clone().unwrap_or(state.model);
    Ok((
        Launch {
            run_id: state.run_id,
            plan,
            start_index,
            consecutive_failures,
        },
        model,
    ))
}

fn fresh_launch<S: StateStore>(
    paths: &ProjectPaths,
    store: &S,
    mode: ModeChoice,
    flags: &RunFlags,
    settings: &Settings,
) -> Result<Launch> {
    let plan_mode = match explicit_mode(mode) {
        Some(plan_mode) => plan_mode,
        None => auto_mode(paths)?,
    };
    let plan = SessionPlan::build(plan_mode, settings.sessions)
        .map_err(|err| UsageError(format!("{err:#}")))?;

    let start_index = flags.resume.unwrap_or(1);
    if start_index == 0 || start_index > plan.len() {
        return Err(UsageError(format!(
            "--resume {start_index} is outside 1..={}",
            plan.len()
        ))
        .into());
    }

    Ok(Launch {
        run_id: unique_run_id(store, Utc::now())?,
        plan,
        start_index,
        consecutive_failures: 0,
    })
}

fn explicit_mode(mode: ModeChoice) -> Option<PlanMode> {
    match mode {
        ModeChoice::Auto => None,
        ModeChoice::Explore => Some(PlanMode::Explore),
        ModeChoice::Build => Some(PlanMode::Build),
        ModeChoice::Run => Some(PlanMode::Run),
    }
}

/// Plan mode for `auto`: build when nothing was planned yet, run otherwise.
pub fn auto_mode(paths: &ProjectPaths) -> Result<PlanMode> {
    let detection = detect(paths)?;
    let mode = match detection.state {
        ProjectState::Empty => {
            return Err(UsageError(
                "project is empty; use `autopilot explore [TOPIC]` to start from an idea".to_string(),
            )
            .into());
        }
        ProjectState::HasCode => PlanMode::Build,
        ProjectState::BlueprintOnly | ProjectState::Active | ProjectState::Completed => {
            PlanMode::Run
        }
    };
    debug!(state = ?detection.state, mode = %mode, "auto mode selected");
    Ok(mode)
}

/// Fail before the loop if the tool is missing or a template the plan needs
/// is absent or invalid.
pub fn preflight(templates: &TemplateStore, plan: &SessionPlan, invoker: &OpencodeInvoker) -> Result<()> {
    templates.check_all(&plan.distinct_types())?;
    invoker.preflight()?;
    Ok(())
}

fn unique_run_id<S: StateStore>(store: &S, now: DateTime<Utc>) -> Result<String> {
    let base = format!("run-{}", now.format("%Y%m%d-%H%M%S"));
    for suffix in 1..=99u32 {
        let id = if suffix == 1 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        if store.read_log(&id)?.is_empty() {
            return Ok(id);
        }
    }
    Err(UsageError(format!("unable to allocate a run id from '{base}'")).into())
}
