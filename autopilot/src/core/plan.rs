//! Session plan construction.
//!
//! A plan is a fixed prefix, a repeated body type and a closing `final`
//! session. Its length always equals the configured session count.

use anyhow::{Result, bail};

use crate::core::types::{PlanMode, SessionType};

/// Ordered session types for indices `1..=len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlan {
    mode: PlanMode,
    sessions: Vec<SessionType>,
}

impl SessionPlan {
    /// Build the plan for `mode` with exactly `session_count` sessions.
    pub fn build(mode: PlanMode, session_count: u32) -> Result<Self> {
        let (prefix, body) = shape(mode);
        let minimum = prefix.len() as u32 + 1;
        if session_count < minimum {
            bail!("{mode} plan needs at least {minimum} sessions (got {session_count})");
        }

        let body_len = session_count as usize - prefix.len() - 1;
        let mut sessions = Vec::with_capacity(session_count as usize);
        sessions.extend_from_slice(prefix);
        sessions.extend(std::iter::repeat_n(body, body_len));
        sessions.push(SessionType::Final);
        Ok(Self { mode, sessions })
    }

    pub fn mode(&self) -> PlanMode {
        self.mode
    }

    pub fn len(&self) -> u32 {
        self.sessions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session type at 1-based `index`.
    pub fn session_type(&self, index: u32) -> Option<SessionType> {
        let slot = index.checked_sub(1)? as usize;
        self.sessions.get(slot).copied()
    }

    /// Distinct session types in first-appearance order.
    pub fn distinct_types(&self) -> Vec<SessionType> {
        let mut seen = Vec::new();
        for ty in &self.sessions {
            if !seen.contains(ty) {
                seen.push(*ty);
            }
        }
        seen
    }
}

/// Smallest session count accepted for `mode`.
pub fn minimum_sessions(mode: PlanMode) -> u32 {
    shape(mode).0.len() as u32 + 1
}

fn shape(mode: PlanMode) -> (&'static [SessionType], SessionType) {
    match mode {
        PlanMode::Explore => (
            &[SessionType::Research, SessionType::Blueprint],
            SessionType::Build,
        ),
        PlanMode::Build => (&[SessionType::Blueprint], SessionType::Build),
        PlanMode::Run => (&[], SessionType::Run),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(plan: &SessionPlan) -> Vec<SessionType> {
        (1..=plan.len())
            .map(|i| plan.session_type(i).expect("in range"))
            .collect()
    }

    #[test]
    fn explore_plan_starts_with_research_and_ends_with_final() {
        let plan = SessionPlan::build(PlanMode::Explore, 5).expect("plan");
        assert_eq!(
            types(&plan),
            vec![
                SessionType::Research,
                SessionType::Blueprint,
                SessionType::Build,
                SessionType::Build,
                SessionType::Final,
            ]
        );
    }

    #[test]
    fn build_plan_at_minimum_has_no_body() {
        let plan = SessionPlan::build(PlanMode::Build, 2).expect("plan");
        assert_eq!(types(&plan), vec![SessionType::Blueprint, SessionType::Final]);
    }

    #[test]
    fn run_plan_of_one_is_final_only() {
        let plan = SessionPlan::build(PlanMode::Run, 1).expect("plan");
        assert_eq!(types(&plan), vec![SessionType::Final]);
    }

    #[test]
    fn plan_length_matches_session_count() {
        for mode in [PlanMode::Explore, PlanMode::Build, PlanMode::Run] {
            for count in minimum_sessions(mode)..12 {
                let plan = SessionPlan::build(mode, count).expect("plan");
                assert_eq!(plan.len(), count);
            }
        }
    }

    #[test]
    fn too_few_sessions_is_rejected() {
        let err = SessionPlan::build(PlanMode::Explore, 2).unwrap_err();
        assert!(err.to_string().contains("at least 3"));
        assert!(SessionPlan::build(PlanMode::Run, 0).is_err());
    }

    #[test]
    fn session_type_is_one_based() {
        let plan = SessionPlan::build(PlanMode::Run, 3).expect("plan");
        assert_eq!(plan.session_type(0), None);
        assert_eq!(plan.session_type(1), Some(SessionType::Run));
        assert_eq!(plan.session_type(3), Some(SessionType::Final));
        assert_eq!(plan.session_type(4), None);
    }

    #[test]
    fn distinct_types_keep_plan_order() {
        let plan = SessionPlan::build(PlanMode::Explore, 6).expect("plan");
        assert_eq!(
            plan.distinct_types(),
            vec![
                SessionType::Research,
                SessionType::Blueprint,
                SessionType::Build,
                SessionType::Final,
            ]
        );
    }
}
