//! The augmentation phase machine.
//!
//! Nine stages forming a cycle. A transition is legal only to the current
//! stage (a self-hold), to the immediate successor, or back to discover
//! (the reset every stage falls back to when its work dries up); anything
//! else is a caller bug and surfaces as an error, never as silent state
//! drift.

use anyhow::bail;

use crate::types::{
    AgentState, CandidateStatus, ExecutionClass, Stage, TransitionRecord, TRANSITIONS_CAP,
};

/// The immediate successor in the fixed cycle.
pub fn successor(stage: Stage) -> Stage {
    match stage {
        Stage::Discover => Stage::Design,
        Stage::Design => Stage::Synthesize,
        Stage::Synthesize => Stage::Verify,
        Stage::Verify => Stage::Canary,
        Stage::Canary => Stage::Promote,
        Stage::Promote => Stage::Observe,
        Stage::Observe => Stage::Learn,
        Stage::Learn => Stage::Retire,
        Stage::Retire => Stage::Discover,
    }
}

/// Pure legality check, exposed so callers can gate without exceptions.
/// Discovery is always reachable: it is the reset target of every stage
/// whose actionable work dried up.
pub fn is_legal_transition(from: Stage, to: Stage) -> bool {
    to == from || to == successor(from) || to == Stage::Discover
}

/// Perform a legal transition, updating stage bookkeeping and the bounded
/// transition history. An illegal request is a programmatic bug.
pub fn transition_stage(
    state: &mut AgentState,
    to: Stage,
    reason: &str,
    now_ms: i64,
) -> anyhow::Result<()> {
    let from = state.augmentation.stage;
    if !is_legal_transition(from, to) {
        bail!(
            "illegal stage transition {} -> {}",
            from.as_str(),
            to.as_str()
        );
    }
    if to == from {
        return Ok(());
    }

    state.augmentation.stage = to;
    state.augmentation.stage_entered_at = now_ms;
    state.augmentation.last_transition_at = now_ms;
    state.augmentation.last_transition_reason = reason.to_string();
    state.augmentation.phase_run_count = 0;
    state.augmentation.transitions.push(TransitionRecord {
        from,
        to,
        ts: now_ms,
        reason: reason.to_string(),
    });
    if state.augmentation.transitions.len() > TRANSITIONS_CAP {
        let start = state.augmentation.transitions.len() - TRANSITIONS_CAP;
        state.augmentation.transitions.drain(..start);
    }
    Ok(())
}

/// Choose the next stage from the current one and the work available.
/// Stages with nothing actionable fall back to discovery rather than
/// spinning forward through empty phases.
pub fn resolve_next_stage(state: &AgentState) -> Stage {
    let has_workable_candidates = state.count_candidates(CandidateStatus::Candidate) > 0
        || state.count_candidates(CandidateStatus::Planned) > 0;
    let has_verified = state.count_candidates(CandidateStatus::Verified) > 0;

    match state.augmentation.stage {
        Stage::Discover => {
            if state.has_open_gaps() {
                Stage::Design
            } else {
                Stage::Discover
            }
        }
        Stage::Design => {
            if has_workable_candidates {
                Stage::Synthesize
            } else {
                Stage::Discover
            }
        }
        Stage::Synthesize => {
            if has_workable_candidates {
                Stage::Verify
            } else {
                Stage::Discover
            }
        }
        Stage::Verify => {
            if has_verified {
                Stage::Canary
            } else {
                Stage::Discover
            }
        }
        Stage::Canary => {
            if has_verified {
                Stage::Promote
            } else {
                Stage::Discover
            }
        }
        Stage::Promote => Stage::Observe,
        Stage::Observe => Stage::Learn,
        Stage::Learn => Stage::Retire,
        Stage::Retire => Stage::Discover,
    }
}

/// Risk band of acting in a stage: promotion and retirement mutate what the
/// agent is, synthesis and verification only touch revertible artifacts.
pub fn execution_class_for_stage(stage: Stage) -> ExecutionClass {
    match stage {
        Stage::Promote | Stage::Retire => ExecutionClass::Destructive,
        Stage::Synthesize | Stage::Verify | Stage::Canary => ExecutionClass::ReversibleWrite,
        Stage::Discover | Stage::Design | Stage::Observe | Stage::Learn => {
            ExecutionClass::ReadOnly
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidateSafety, GapStatus, SkillCandidate};

    fn state_at(stage: Stage) -> AgentState {
        let mut state = AgentState::default();
        state.augmentation.stage = stage;
        state
    }

    fn candidate(status: CandidateStatus) -> SkillCandidate {
        SkillCandidate {
            id: "c1".to_string(),
            source_gap_id: "g1".to_string(),
            name: "autonomy-test".to_string(),
            intent: "Address gap: test".to_string(),
            status,
            priority: 10,
            created_at: 0,
            updated_at: 0,
            safety: CandidateSafety {
                execution_class: ExecutionClass::ReversibleWrite,
                constraints: vec!["constraint".to_string()],
            },
            tests: vec!["test".to_string()],
        }
    }

    #[test]
    fn cycle_closes_back_to_discover() {
        let mut stage = Stage::Discover;
        for _ in 0..9 {
            stage = successor(stage);
        }
        assert_eq!(stage, Stage::Discover);
    }

    #[test]
    fn self_successor_and_discover_reset_are_legal() {
        assert!(is_legal_transition(Stage::Discover, Stage::Discover));
        assert!(is_legal_transition(Stage::Discover, Stage::Design));
        assert!(!is_legal_transition(Stage::Discover, Stage::Verify));
        assert!(!is_legal_transition(Stage::Design, Stage::Canary));
        assert!(!is_legal_transition(Stage::Observe, Stage::Promote));
        assert!(is_legal_transition(Stage::Design, Stage::Discover), "reset");
        assert!(is_legal_transition(Stage::Canary, Stage::Discover), "reset");
        assert!(is_legal_transition(Stage::Retire, Stage::Discover));
    }

    #[test]
    fn transition_updates_bookkeeping_and_history() {
        let mut state = state_at(Stage::Discover);
        state.augmentation.phase_run_count = 7;
        transition_stage(&mut state, Stage::Design, "open gaps", 5_000).expect("legal");

        assert_eq!(state.augmentation.stage, Stage::Design);
        assert_eq!(state.augmentation.stage_entered_at, 5_000);
        assert_eq!(state.augmentation.last_transition_at, 5_000);
        assert_eq!(state.augmentation.last_transition_reason, "open gaps");
        assert_eq!(state.augmentation.phase_run_count, 0);
        let record = state.augmentation.transitions.last().expect("record");
        assert_eq!(record.from, Stage::Discover);
        assert_eq!(record.to, Stage::Design);
        assert_eq!(record.ts, 5_000);
    }

    #[test]
    fn self_transition_is_a_quiet_hold() {
        let mut state = state_at(Stage::Verify);
        state.augmentation.stage_entered_at = 1_000;
        transition_stage(&mut state, Stage::Verify, "hold", 9_000).expect("legal");
        assert_eq!(state.augmentation.stage_entered_at, 1_000, "no re-entry");
        assert!(state.augmentation.transitions.is_empty());
    }

    #[test]
    fn illegal_transition_is_an_error() {
        let mut state = state_at(Stage::Discover);
        let err = transition_stage(&mut state, Stage::Canary, "skip ahead", 0)
            .expect_err("must fail");
        assert!(err.to_string().contains("illegal stage transition"));
        assert_eq!(state.augmentation.stage, Stage::Discover, "state untouched");
    }

    #[test]
    fn transition_history_is_bounded() {
        let mut state = state_at(Stage::Discover);
        state.augmentation.gaps.push(crate::types::Gap {
            id: "g".to_string(),
            key: "k".to_string(),
            title: String::new(),
            category: crate::types::GapCategory::Unknown,
            status: GapStatus::Open,
            severity: 1,
            confidence: 0.1,
            score: 1,
            occurrences: 1,
            first_seen_at: 0,
            last_seen_at: 0,
            last_source: String::new(),
            evidence: Vec::new(),
        });
        for i in 0..(TRANSITIONS_CAP + 30) {
            let next = successor(state.augmentation.stage);
            transition_stage(&mut state, next, "walk", i as i64).expect("legal");
        }
        assert_eq!(state.augmentation.transitions.len(), TRANSITIONS_CAP);
    }

    #[test]
    fn resolver_advances_only_with_work_available() {
        let mut state = state_at(Stage::Discover);
        assert_eq!(resolve_next_stage(&state), Stage::Discover);
        state.augmentation.gaps.push(crate::types::Gap {
            id: "g".to_string(),
            key: "k".to_string(),
            title: String::new(),
            category: crate::types::GapCategory::Unknown,
            status: GapStatus::Open,
            severity: 1,
            confidence: 0.1,
            score: 1,
            occurrences: 1,
            first_seen_at: 0,
            last_seen_at: 0,
            last_source: String::new(),
            evidence: Vec::new(),
        });
        assert_eq!(resolve_next_stage(&state), Stage::Design);

        let mut state = state_at(Stage::Design);
        assert_eq!(resolve_next_stage(&state), Stage::Discover);
        state.augmentation.candidates.push(candidate(CandidateStatus::Candidate));
        assert_eq!(resolve_next_stage(&state), Stage::Synthesize);

        let mut state = state_at(Stage::Verify);
        state.augmentation.candidates.push(candidate(CandidateStatus::Planned));
        assert_eq!(resolve_next_stage(&state), Stage::Discover);
        state.augmentation.candidates.push(candidate(CandidateStatus::Verified));
        assert_eq!(resolve_next_stage(&state), Stage::Canary);

        let mut state = state_at(Stage::Canary);
        state.augmentation.candidates.push(candidate(CandidateStatus::Verified));
        assert_eq!(resolve_next_stage(&state), Stage::Promote);

        assert_eq!(resolve_next_stage(&state_at(Stage::Promote)), Stage::Observe);
        assert_eq!(resolve_next_stage(&state_at(Stage::Observe)), Stage::Learn);
        assert_eq!(resolve_next_stage(&state_at(Stage::Learn)), Stage::Retire);
        assert_eq!(resolve_next_stage(&state_at(Stage::Retire)), Stage::Discover);
    }

    #[test]
    fn execution_classes_map_by_risk() {
        assert_eq!(
            execution_class_for_stage(Stage::Promote),
            ExecutionClass::Destructive
        );
        assert_eq!(
            execution_class_for_stage(Stage::Retire),
            ExecutionClass::Destructive
        );
        assert_eq!(
            execution_class_for_stage(Stage::Synthesize),
            ExecutionClass::ReversibleWrite
        );
        assert_eq!(
            execution_class_for_stage(Stage::Canary),
            ExecutionClass::ReversibleWrite
        );
        assert_eq!(
            execution_class_for_stage(Stage::Discover),
            ExecutionClass::ReadOnly
        );
        assert_eq!(
            execution_class_for_stage(Stage::Learn),
            ExecutionClass::ReadOnly
        );
    }
}
