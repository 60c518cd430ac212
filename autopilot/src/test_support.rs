//! Test-only doubles for the session loop: a scripted invoker, an in-memory
//! state store, a pacer that never sleeps, and template fixtures.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::core::plan::SessionPlan;
use crate::core::types::PlanMode;
use crate::errors::SpawnError;
use crate::io::invoker::{InvocationRequest, InvocationResult, Invoker};
use crate::io::paths::ProjectPaths;
use crate::io::scaffold::ensure_scaffolded;
use crate::io::state_store::{RunState, SessionRecord, StateStore};
use crate::io::templates::TemplateStore;
use crate::session_loop::{Launch, LoopConfig, Pacer};

/// Canned result for one [`ScriptedInvoker`] call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Success,
    /// Non-zero exit with the given stderr.
    Failure(&'static str),
    TimedOut,
    /// Non-zero exit whose stderr matched a rate-limit pattern.
    RateLimited,
    /// The tool could not be started.
    SpawnError,
}

/// Invoker that replays a fixed script and records every request.
#[derive(Debug)]
pub struct ScriptedInvoker {
    script: RefCell<VecDeque<Scripted>>,
    requests: RefCell<Vec<InvocationRequest>>,
}

impl ScriptedInvoker {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.requests.borrow().clone()
    }

    /// Panics if any scripted result was not consumed.
    pub fn assert_drained(&self) {
        let remaining = self.script.borrow().len();
        assert_eq!(remaining, 0, "{remaining} scripted invocation(s) never ran");
    }
}

impl Invoker for ScriptedInvoker {
    fn invoke(&self, request: &InvocationRequest) -> Result<InvocationResult> {
        self.requests.borrow_mut().push(request.clone());
        let next = self
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected invocation: {}", request.prompt));
        let (exit_code, stderr, timed_out, rate_limited) = match next {
            Scripted::Success => (Some(0), String::new(), false, false),
            Scripted::Failure(stderr) => (Some(1), stderr.to_string(), false, false),
            Scripted::TimedOut => (None, String::new(), true, false),
            Scripted::RateLimited => (Some(1), "rate limit exceeded".to_string(), false, true),
            Scripted::SpawnError => {
                return Err(SpawnError {
                    command: "opencode".to_string(),
                    reason: "scripted".to_string(),
                }
                .into());
            }
        };
        Ok(InvocationResult {
            exit_code,
            stdout: String::new(),
            stderr,
            elapsed: Duration::from_millis(5),
            timed_out,
            rate_limited,
        })
    }
}

/// State store kept in memory; remembers every saved state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: RefCell<Vec<RunState>>,
    logs: RefCell<BTreeMap<String, Vec<SessionRecord>>>,
}

impl MemoryStore {
    /// Most recently saved state.
    pub fn state(&self) -> Option<RunState> {
        self.saved.borrow().last().cloned()
    }

    pub fn saved_states(&self) -> Vec<RunState> {
        self.saved.borrow().clone()
    }

    pub fn log(&self, run_id: &str) -> Vec<SessionRecord> {
        self.logs.borrow().get(run_id).cloned().unwrap_or_default()
    }

    pub fn indices(&self, run_id: &str) -> Vec<u32> {
        self.log(run_id).iter().map(|r| r.index).collect()
    }
}

impl StateStore for MemoryStore {
    fn load_state(&self) -> Result<Option<RunState>> {
        Ok(self.state())
    }

    fn save_state(&self, state: &RunState) -> Result<()> {
        self.saved.borrow_mut().push(state.clone());
        Ok(())
    }

    fn append_log(&self, run_id: &str, record: &SessionRecord) -> Result<()> {
        self.logs
            .borrow_mut()
            .entry(run_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn read_log(&self, run_id: &str) -> Result<Vec<SessionRecord>> {
        Ok(self.log(run_id))
    }
}

/// Pacer that never sleeps. Optionally reports a pause on the n-th check.
#[derive(Debug, Default)]
pub struct NoWait {
    pause_on_check: Option<u32>,
    checks: Cell<u32>,
    waits: Cell<u32>,
}

impl NoWait {
    pub fn pause_after(sessions: u32) -> Self {
        Self {
            pause_on_check: Some(sessions),
            ..Self::default()
        }
    }

    /// Number of inter-session waits requested.
    pub fn waits(&self) -> u32 {
        self.waits.get()
    }
}

impl Pacer for NoWait {
    fn pause_requested(&self) -> Result<bool> {
        let checks = self.checks.get() + 1;
        self.checks.set(checks);
        Ok(self.pause_on_check == Some(checks))
    }

    fn wait(&self, _interval: Duration) -> Result<bool> {
        self.waits.set(self.waits.get() + 1);
        Ok(false)
    }
}

/// Scratch project with scaffolded default templates.
#[derive(Debug)]
pub struct TemplateDir {
    temp: tempfile::TempDir,
    store: TemplateStore,
}

impl TemplateDir {
    pub fn with_defaults() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        ensure_scaffolded(&paths, "autonomous").expect("scaffold");
        Self {
            store: TemplateStore::new(&paths.templates_dir),
            temp,
        }
    }

    /// Project root.
    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    pub fn write(&self, id: &str, contents: &str) {
        fs::write(self.store.path_for(id), contents).expect("write template");
    }

    pub fn remove(&self, id: &str) {
        fs::remove_file(self.store.path_for(id)).expect("remove template");
    }
}

/// Loop settings used across tests: 1s interval (never slept), 60s timeout.
pub fn loop_config(root: &Path) -> LoopConfig {
    LoopConfig {
        workdir: root.to_path_buf(),
        model: "test/model".to_string(),
        interval: Duration::from_secs(1),
        session_timeout: Duration::from_secs(60),
        topic: None,
    }
}

/// Launch of run `run-test` for a fresh plan.
pub fn launch(mode: PlanMode, session_count: u32, start_index: u32) -> Launch {
    Launch {
        run_id: "run-test".to_string(),
        plan: SessionPlan::build(mode, session_count).expect("plan"),
        start_index,
        consecutive_failures: 0,
    }
}
