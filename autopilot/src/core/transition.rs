//! Stop-condition logic for the session loop.
//!
//! `decide` is a pure function from the finished session and the current
//! failure streak to the controller's next move. The controller owns all
//! side effects (persisting, waiting, pausing); this module only answers
//! "what happens next".

use crate::core::types::{RunStatus, SessionOutcome};

/// Consecutive non-success outcomes that abort a run.
pub const STRIKE_LIMIT: u32 = 2;

/// Lifecycle of the session loop controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    Completed,
    Aborted,
    Paused,
}

impl ControllerState {
    /// `Completed` and `Aborted` end the run for good; `Paused` can be resumed.
    pub fn is_terminal(self) -> bool {
        matches!(self, ControllerState::Completed | ControllerState::Aborted)
    }
}

/// Next move after a session finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The plan is exhausted.
    Complete,
    /// Two strikes in a row.
    Abort,
    /// Run `next_index`, waiting the configured interval first when `wait` is set.
    Continue { next_index: u32, wait: bool },
}

impl Transition {
    /// Controller state entered by this transition.
    pub fn state(self) -> ControllerState {
        match self {
            Transition::Complete => ControllerState::Completed,
            Transition::Abort => ControllerState::Aborted,
            Transition::Continue { .. } => ControllerState::Running,
        }
    }

    /// RunState status persisted when the transition ends the run.
    pub fn terminal_status(self) -> Option<RunStatus> {
        match self {
            Transition::Complete => Some(RunStatus::Mature),
            Transition::Abort => Some(RunStatus::Blocked),
            Transition::Continue { .. } => None,
        }
    }
}

/// Result of [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub transition: Transition,
    /// Failure streak including the session just finished.
    pub consecutive_failures: u32,
}

/// Evaluate stop conditions for session `index` of `session_count`.
///
/// Rules, in order:
/// 1. success/skipped on the last index completes the run;
/// 2. a failure/timeout that makes the streak reach [`STRIKE_LIMIT`] aborts;
/// 3. a first failure/timeout moves on after the interval (on the last index
///    the plan is exhausted and the run completes);
/// 4. success moves on after the interval; skipped moves on immediately.
pub fn decide(
    index: u32,
    session_count: u32,
    outcome: SessionOutcome,
    consecutive_failures: u32,
) -> Decision {
    let last = index >= session_count;

    if outcome.is_failure() {
        let streak = consecutive_failures.saturating_add(1);
        let transition = if streak >= STRIKE_LIMIT {
            Transition::Abort
        } else if last {
            Transition::Complete
        } else {
            Transition::Continue {
                next_index: index + 1,
                wait: true,
            }
        };
        return Decision {
            transition,
            consecutive_failures: streak,
        };
    }

    let transition = if last {
        Transition::Complete
    } else {
        Transition::Continue {
            next_index: index + 1,
            wait: outcome == SessionOutcome::Success,
        }
    };
    Decision {
        transition,
        consecutive_failures: 0,
    }
}
