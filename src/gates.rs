//! Promotion gates: the checks a promote transition must clear.
//!
//! Checked while the machine sits in promote. A failed gate is not an
//! error: the stage freezes and the denial is audited. Every threshold has
//! a default and every failure names its reason.

use serde::{Deserialize, Serialize};

use crate::canary::recent_error_rate;
use crate::types::{AgentState, CandidateStatus, CanaryStatus, CycleStatus};

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase", default)]
pub struct GateThresholds {
    pub minimum_recent_cycles: usize,
    pub maximum_error_rate: f64,
    pub minimum_eval_score: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            minimum_recent_cycles: 3,
            maximum_error_rate: 0.2,
            minimum_eval_score: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcome {
    pub passed: bool,
    pub reasons: Vec<String>,
}

/// Evaluate all promotion gates. Reasons accumulate so an operator sees
/// the full distance to promotion, not just the first failure.
pub fn check_promotion(state: &AgentState, thresholds: &GateThresholds) -> GateOutcome {
    let mut reasons = Vec::new();

    let verified = state.count_candidates(CandidateStatus::Verified);
    if verified == 0 {
        reasons.push("no verified candidates".to_string());
    }

    let recent_cycles = state
        .recent_cycles
        .iter()
        .filter(|c| c.status != CycleStatus::Skipped)
        .count();
    if recent_cycles < thresholds.minimum_recent_cycles {
        reasons.push(format!(
            "insufficient cycle history ({} of {} required)",
            recent_cycles, thresholds.minimum_recent_cycles
        ));
    }

    let error_rate = recent_error_rate(&state.recent_cycles);
    if error_rate > thresholds.maximum_error_rate {
        reasons.push(format!(
            "recent error rate {:.3} exceeds {:.3}",
            error_rate, thresholds.maximum_error_rate
        ));
    }

    if state.augmentation.last_canary_status == Some(CanaryStatus::Regressed) {
        reasons.push("canary regressed".to_string());
    }

    match state.augmentation.last_eval_score {
        Some(score) if score >= thresholds.minimum_eval_score => {}
        Some(score) => reasons.push(format!(
            "eval score {:.2} below {:.2}",
            score, thresholds.minimum_eval_score
        )),
        None => reasons.push("no eval score recorded".to_string()),
    }

    GateOutcome {
        passed: reasons.is_empty(),
        reasons,
    }
}
