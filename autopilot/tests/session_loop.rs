//! End-to-end loop scenarios against the file-backed heartbeat store.
//!
//! Uses a scripted invoker so no tool is spawned; everything else (templates,
//! status record, session logs) is real files in a temp project.

use autopilot::core::types::{PlanMode, RunStatus, SessionOutcome};
use autopilot::errors::SpawnError;
use autopilot::io::config::LoadedConfig;
use autopilot::io::paths::ProjectPaths;
use autopilot::io::state_store::{HeartbeatStore, StateStore};
use autopilot::session_loop::{Launch, LoopDeps, LoopOutcome, LoopStop, run_loop};
use autopilot::start::{ModeChoice, RunFlags, prepare};
use autopilot::test_support::{NoWait, Scripted, ScriptedInvoker, TemplateDir, launch, loop_config};

fn run(
    templates: &TemplateDir,
    store: &HeartbeatStore,
    invoker: &ScriptedInvoker,
    launch: &Launch,
) -> anyhow::Result<LoopOutcome> {
    let pacer = NoWait::default();
    let deps = LoopDeps {
        templates: templates.store(),
        invoker,
        store,
        pacer: &pacer,
    };
    run_loop(&deps, &loop_config(templates.root()), launch, |_, _| {})
}

fn indices(store: &HeartbeatStore, run_id: &str) -> Vec<u32> {
    store
        .read_log(run_id)
        .expect("read log")
        .iter()
        .map(|r| r.index)
        .collect()
}

#[test]
fn three_successes_complete_with_three_records() {
    let templates = TemplateDir::with_defaults();
    let store = HeartbeatStore::new(ProjectPaths::new(templates.root()));
    let invoker = ScriptedInvoker::new(vec![Scripted::Success; 3]);

    let outcome = run(&templates, &store, &invoker, &launch(PlanMode::Run, 3, 1)).expect("loop");

    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(indices(&store, "run-test"), vec![1, 2, 3]);
    let state = store.load_state().expect("load").expect("state");
    assert_eq!(state.status, RunStatus::Mature);
    assert_eq!(state.current_index, 3);
}

#[test]
fn timeouts_at_two_and_three_abort_after_three_records() {
    let templates = TemplateDir::with_defaults();
    let store = HeartbeatStore::new(ProjectPaths::new(templates.root()));
    let invoker = ScriptedInvoker::new(vec![
        Scripted::Success,
        Scripted::TimedOut,
        Scripted::TimedOut,
    ]);

    let outcome = run(&templates, &store, &invoker, &launch(PlanMode::Run, 5, 1)).expect("loop");

    assert_eq!(outcome.stop, LoopStop::Aborted);
    invoker.assert_drained();
    let log = store.read_log("run-test").expect("log");
    assert_eq!(log.len(), 3);
    assert_eq!(log[1].outcome, SessionOutcome::TimedOut);
    assert_eq!(log[2].outcome, SessionOutcome::TimedOut);
    assert_eq!(
        store.load_state().expect("load").expect("state").status,
        RunStatus::Blocked
    );
}

#[test]
fn resume_from_three_logs_only_three_to_five() {
    let templates = TemplateDir::with_defaults();
    let store = HeartbeatStore::new(ProjectPaths::new(templates.root()));
    let invoker = ScriptedInvoker::new(vec![Scripted::Success; 3]);

    run(&templates, &store, &invoker, &launch(PlanMode::Run, 5, 3)).expect("loop");

    assert_eq!(indices(&store, "run-test"), vec![3, 4, 5]);
}

#[test]
fn rate_limited_sessions_count_as_failures() {
    let templates = TemplateDir::with_defaults();
    let store = HeartbeatStore::new(ProjectPaths::new(templates.root()));
    let invoker = ScriptedInvoker::new(vec![Scripted::RateLimited, Scripted::RateLimited]);

    let outcome = run(&templates, &store, &invoker, &launch(PlanMode::Run, 4, 1)).expect("loop");

    assert_eq!(outcome.stop, LoopStop::Aborted);
    let log = store.read_log("run-test").expect("log");
    assert!(log.iter().all(|r| r.rate_limited));
    assert!(log[0].note.as_deref().is_some_and(|n| n.starts_with("rate limited")));
}

/// A crash mid-invoke leaves the in-flight index persisted; `--continue`
/// re-attempts that same session and appends to the same log.
#[test]
fn continue_after_fatal_error_retries_the_unfinished_session() {
    let templates = TemplateDir::with_defaults();
    let paths = ProjectPaths::new(templates.root());
    let store = HeartbeatStore::new(paths.clone());

    let first = ScriptedInvoker::new(vec![Scripted::Success, Scripted::SpawnError]);
    let err = run(&templates, &store, &first, &launch(PlanMode::Run, 4, 1)).unwrap_err();
    assert!(err.downcast_ref::<SpawnError>().is_some());

    let flags = RunFlags {
        continue_run: true,
        ..RunFlags::default()
    };
    let prepared = prepare(&paths, &LoadedConfig::default(), &store, ModeChoice::Run, &flags, None).expect("prepare");
    assert_eq!(prepared.launch.run_id, "run-test");
    assert_eq!(prepared.launch.start_index, 2);

    let second = ScriptedInvoker::new(vec![Scripted::Success; 3]);
    let outcome = run(&templates, &store, &second, &prepared.launch).expect("loop");
    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(indices(&store, "run-test"), vec![1, 2, 3, 4]);
}

#[test]
fn explore_plan_runs_research_blueprint_build_final() {
    let templates = TemplateDir::with_defaults();
    let store = HeartbeatStore::new(ProjectPaths::new(templates.root()));
    let invoker = ScriptedInvoker::new(vec![Scripted::Success; 4]);

    run(&templates, &store, &invoker, &launch(PlanMode::Explore, 4, 1)).expect("loop");

    let types: Vec<String> = store
        .read_log("run-test")
        .expect("log")
        .iter()
        .map(|r| r.session_type.to_string())
        .collect();
    assert_eq!(types, vec!["research", "blueprint", "build", "final"]);
    let prompts = invoker.requests();
    assert!(prompts[0].prompt.contains("No direction was given"));
}
