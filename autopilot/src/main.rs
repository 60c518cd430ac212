//! `autopilot` command-line entry point.
//!
//! Run-style subcommands (`auto`, `explore`, `build`, `run`) plan a session
//! sequence and drive `opencode run` until the plan completes, two sessions
//! in a row fail, or a pause is requested. The exit code reports which.

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use autopilot::core::transition::{Decision, Transition};
use autopilot::core::types::SessionOutcome;
use autopilot::errors::UsageError;
use autopilot::exit_codes;
use autopilot::io::config::{ConfigFiles, ConfigLayer, GLOBAL_CONFIG_ENV, Scope, update_layer};
use autopilot::io::detect::{ProjectState, detect};
use autopilot::io::invoker::OpencodeInvoker;
use autopilot::io::pause::PauseFile;
use autopilot::io::paths::ProjectPaths;
use autopilot::io::scaffold::ensure_scaffolded;
use autopilot::io::state_store::{HeartbeatStore, SessionRecord, StateStore};
use autopilot::io::templates::TemplateStore;
use autopilot::session_loop::{LoopDeps, LoopStop, SleepPacer, run_loop};
use autopilot::start::{ModeChoice, RunFlags, preflight, prepare};
use autopilot::{logging, status};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Run OpenCode sessions unattended against a project"
)]
struct Cli {
    /// Project directory.
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Total sessions in the plan.
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    sessions: Option<u32>,
    /// Minutes to wait between sessions.
    #[arg(short, long, value_name = "MINUTES")]
    interval: Option<u64>,
    /// Start a new run at session K, skipping 1..K-1.
    #[arg(short, long, value_name = "K", value_parser = clap::value_parser!(u32).range(1..))]
    resume: Option<u32>,
    /// Continue the persisted run where it stopped.
    #[arg(long = "continue", conflicts_with = "resume")]
    continue_run: bool,
    /// Model identifier passed to the tool.
    #[arg(short, long)]
    model: Option<String>,
}

impl RunArgs {
    fn flags(&self) -> RunFlags {
        RunFlags {
            sessions: self.sessions,
            interval_minutes: self.interval,
            resume: self.resume,
            continue_run: self.continue_run,
            model: self.model.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Build when nothing is planned yet, otherwise improve the existing project.
    Auto(RunArgs),
    /// Research an idea from scratch, then blueprint and build it.
    Explore {
        /// Loose idea to steer the research session.
        topic: Option<String>,
        /// Do not ask before exploring in a project that already has autopilot state.
        #[arg(short, long)]
        yes: bool,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Write a blueprint, then build it.
    Build(RunArgs),
    /// Improvement sessions against an existing blueprint.
    Run(RunArgs),
    /// Show or change persisted defaults.
    Config {
        #[arg(long)]
        model: Option<String>,
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        sessions: Option<u32>,
        /// Minutes between sessions.
        #[arg(long, value_name = "MINUTES")]
        interval: Option<u64>,
        #[arg(long)]
        agent: Option<String>,
        /// Write to the global config instead of the project's.
        #[arg(long)]
        global: bool,
        /// Print effective values and where they come from.
        #[arg(long)]
        show: bool,
    },
    /// Summarize the project and its last run.
    Status,
    /// Ask a running loop to stop after the current session.
    Pause,
    /// Write default templates, the agent file and the .gitignore entry.
    Init,
}

fn main() -> ExitCode {
    logging::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.use_stderr() => {
            if err.print().is_err() {
                eprintln!("{err}");
            }
            return exit(exit_codes::INVALID);
        }
        // --help and --version.
        Err(err) => err.exit(),
    };

    match run(cli) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            exit(exit_codes::INVALID)
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: Cli) -> Result<i32> {
    let root = std::fs::canonicalize(&cli.project)
        .with_context(|| format!("project directory {}", cli.project.display()))?;
    let paths = ProjectPaths::new(&root);
    let files = ConfigFiles::resolve(
        &root,
        std::env::var_os(GLOBAL_CONFIG_ENV).map(PathBuf::from),
    );

    match cli.command {
        Command::Auto(args) => cmd_run(&paths, &files, ModeChoice::Auto, &args, None, false),
        Command::Explore { topic, yes, run } => {
            cmd_run(&paths, &files, ModeChoice::Explore, &run, topic.as_deref(), yes)
        }
        Command::Build(args) => cmd_run(&paths, &files, ModeChoice::Build, &args, None, false),
        Command::Run(args) => cmd_run(&paths, &files, ModeChoice::Run, &args, None, false),
        Command::Config {
            model,
            sessions,
            interval,
            agent,
            global,
            show,
        } => {
            let updates = ConfigLayer {
                model,
                sessions,
                interval_minutes: interval,
                agent,
                ..ConfigLayer::default()
            };
            cmd_config(&files, updates, global, show)
        }
        Command::Status => cmd_status(&paths),
        Command::Pause => cmd_pause(&paths),
        Command::Init => cmd_init(&paths, &files),
    }
}

fn cmd_run(
    paths: &ProjectPaths,
    files: &ConfigFiles,
    mode: ModeChoice,
    args: &RunArgs,
    topic: Option<&str>,
    yes: bool,
) -> Result<i32> {
    let loaded = files.load()?;
    let store = HeartbeatStore::new(paths.clone());

    if mode == ModeChoice::Explore && !args.continue_run && !yes && !confirm_explore(paths, &store)? {
        println!("explore cancelled");
        return Ok(exit_codes::OK);
    }

    let prepared = prepare(paths, &loaded, &store, mode, &args.flags(), topic)?;
    // First run scaffolds; afterwards a missing template is an error, not silently restored.
    if !paths.autopilot_dir.exists() {
        ensure_scaffolded(paths, &prepared.settings.agent)?;
    }
    let templates = TemplateStore::new(&paths.templates_dir);
    let invoker = OpencodeInvoker::from_settings(&prepared.settings)?;
    preflight(&templates, &prepared.launch.plan, &invoker)?;

    let pause = PauseFile::new(&paths.pause_path);
    pause.clear()?;
    let pacer = SleepPacer::new(pause);

    let launch = &prepared.launch;
    let total = launch.plan.len();
    println!(
        "{} {} ({} plan, sessions {}..={total}, model {})",
        if prepared.continued { "continuing" } else { "starting" },
        launch.run_id,
        launch.plan.mode(),
        launch.start_index,
        prepared.loop_config.model
    );

    let deps = LoopDeps {
        templates: &templates,
        invoker: &invoker,
        store: &store,
        pacer: &pacer,
    };
    let interval_minutes = prepared.loop_config.interval.as_secs() / 60;
    let outcome = run_loop(&deps, &prepared.loop_config, launch, |record, decision| {
        print_progress(record, decision, total, interval_minutes);
    })?;

    Ok(match outcome.stop {
        LoopStop::Completed => {
            println!("run {} completed ({} sessions executed)", outcome.run_id, outcome.sessions_executed);
            exit_codes::OK
        }
        LoopStop::Aborted => {
            eprintln!(
                "run {} aborted after two consecutive failed sessions; see `autopilot status`",
                outcome.run_id
            );
            exit_codes::ABORTED
        }
        LoopStop::Paused { next_index } => {
            println!(
                "run {} paused before session {next_index}; `autopilot run --continue` resumes it",
                outcome.run_id
            );
            exit_codes::PAUSED
        }
    })
}

fn print_progress(record: &SessionRecord, decision: &Decision, total: u32, interval_minutes: u64) {
    let mut line = format!(
        "[{}/{total}] {} {} ({}s)",
        record.index,
        record.session_type,
        record.outcome,
        record.duration_ms / 1000
    );
    if record.rate_limited {
        line.push_str(" rate limited");
    }
    if record.outcome != SessionOutcome::Success
        && let Some(note) = &record.note
    {
        line.push_str(": ");
        line.push_str(note);
    }
    println!("{line}");
    if let Transition::Continue { wait: true, .. } = decision.transition
        && interval_minutes > 0
    {
        println!("next session in {interval_minutes} min");
    }
}

/// Ask before exploring over an existing autopilot project.
fn confirm_explore(paths: &ProjectPaths, store: &HeartbeatStore) -> Result<bool> {
    let detection = detect(paths)?;
    let existing = matches!(detection.state, ProjectState::Active | ProjectState::Completed)
        || store.load_state()?.is_some();
    if !existing {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        return Err(UsageError(
            "project already has autopilot state; pass --yes to explore anyway".to_string(),
        )
        .into());
    }
    print!("project already has autopilot state; explore anyway? [y/N] ");
    std::io::stdout().flush().context("flush stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn cmd_config(files: &ConfigFiles, updates: ConfigLayer, global: bool, show: bool) -> Result<i32> {
    // Without any key to set, `config` behaves like `config --show`.
    let show = show || updates.is_empty();
    if !updates.is_empty() {
        let scope = if global { Scope::Global } else { Scope::Project };
        let path = files.path(scope)?;
        update_layer(path, updates)?;
        println!("saved {}", path.display());
    }
    if show {
        let loaded = files.load()?;
        for entry in loaded.describe()? {
            println!("{} = {}  ({})", entry.key, entry.value, entry.source.as_str());
        }
        println!("project config: {}", files.project.display());
        if let Some(global) = &files.global {
            println!("global config: {}", global.display());
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_status(paths: &ProjectPaths) -> Result<i32> {
    let store = HeartbeatStore::new(paths.clone());
    let report = status::collect(&store)?;
    print!("{}", report.render());
    Ok(exit_codes::OK)
}

fn cmd_pause(paths: &ProjectPaths) -> Result<i32> {
    let pause = PauseFile::new(&paths.pause_path);
    pause.request()?;
    println!("pause requested ({})", relative(&paths.root, pause.path()));
    Ok(exit_codes::OK)
}

fn cmd_init(paths: &ProjectPaths, files: &ConfigFiles) -> Result<i32> {
    let loaded = files.load()?;
    let agent = loaded
        .effective()
        .agent
        .unwrap_or_else(|| autopilot::io::config::DEFAULT_AGENT.to_string());
    let report = ensure_scaffolded(paths, &agent)?;
    for path in &report.created {
        println!("created {}", relative(&paths.root, path));
    }
    if report.gitignore_updated {
        println!("updated .gitignore");
    }
    if report.is_noop() {
        println!("already initialized");
    }
    Ok(exit_codes::OK)
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
