//! Candidate planner: one proposal per unaddressed gap.
//!
//! Deterministic by construction: for a fixed gap snapshot the output is
//! bytewise identical, so replayed cycles cannot fork the candidate set.

use std::collections::HashSet;

use tracing::debug;

use crate::types::{
    CandidateSafety, CandidateStatus, ExecutionClass, Gap, GapCategory, GapStatus, SkillCandidate,
    CANDIDATES_CAP,
};
use crate::utils::{sha1_16, slug};

/// New proposals per planning call.
const MAX_NEW_CANDIDATES: usize = 5;

/// Constraints every generated candidate carries.
const BASE_CONSTRAINTS: [&str; 3] = [
    "No destructive operations without explicit operator approval",
    "Operate only inside the agent workspace",
    "Record every action in the augmentation ledger",
];

/// Checks every candidate must declare before verification can pass.
const REQUIRED_TESTS: [&str; 3] = [
    "Dry run succeeds on a representative input",
    "Policy denial path is exercised and observed",
    "Generated artifacts match the declared intent",
];

fn candidate_name(gap: &Gap) -> String {
    let base = if !gap.title.trim().is_empty() {
        slug(&gap.title)
    } else if !gap.key.trim().is_empty() {
        slug(&gap.key)
    } else {
        slug(&gap.id)
    };
    format!("autonomy-{}", base)
}

fn candidate_constraints(gap: &Gap) -> Vec<String> {
    let mut constraints: Vec<String> = BASE_CONSTRAINTS.iter().map(|s| s.to_string()).collect();
    match gap.category {
        GapCategory::Safety => {
            constraints.push("Include a policy-deny regression test before rollout".to_string());
        }
        GapCategory::Reliability => {
            constraints.push("Include a timeout and retry resilience test".to_string());
        }
        _ => {}
    }
    constraints
}

/// A candidate with no declared safety constraints is unplannable.
pub fn validate_candidate(candidate: &SkillCandidate) -> Result<(), String> {
    if candidate.safety.constraints.is_empty() {
        return Err("candidate declares no safety constraints".to_string());
    }
    if candidate.tests.is_empty() {
        return Err("candidate declares no verification tests".to_string());
    }
    Ok(())
}

fn build_candidate(gap: &Gap, now_ms: i64) -> SkillCandidate {
    let intent_subject = if gap.title.trim().is_empty() {
        gap.key.as_str()
    } else {
        gap.title.trim()
    };
    SkillCandidate {
        id: sha1_16(&format!("candidate:{}", gap.id)),
        source_gap_id: gap.id.clone(),
        name: candidate_name(gap),
        intent: format!("Address gap: {}", intent_subject),
        status: CandidateStatus::Candidate,
        priority: gap.score.max(1),
        created_at: now_ms,
        updated_at: now_ms,
        safety: CandidateSafety {
            execution_class: ExecutionClass::ReversibleWrite,
            constraints: candidate_constraints(gap),
        },
        tests: REQUIRED_TESTS.iter().map(|s| s.to_string()).collect(),
    }
}

/// Generate candidates for open gaps that do not already back one. Marks
/// planned gaps, merges into the existing list, and re-ranks. Returns the
/// ids of newly created candidates.
pub fn plan_candidates(
    gaps: &mut [Gap],
    candidates: &mut Vec<SkillCandidate>,
    now_ms: i64,
) -> Vec<String> {
    let backed: HashSet<String> = candidates
        .iter()
        .map(|c| c.source_gap_id.clone())
        .collect();

    let mut created = Vec::new();
    for gap in gaps.iter_mut() {
        if created.len() >= MAX_NEW_CANDIDATES {
            break;
        }
        if gap.status != GapStatus::Open || backed.contains(&gap.id) {
            continue;
        }
        let candidate = build_candidate(gap, now_ms);
        if let Err(reason) = validate_candidate(&candidate) {
            debug!(gap_id = %gap.id, reason = %reason, "skipping unplannable candidate");
            continue;
        }
        gap.status = GapStatus::Planned;
        created.push(candidate.id.clone());
        candidates.push(candidate);
    }

    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates.truncate(CANDIDATES_CAP);

    created
}
