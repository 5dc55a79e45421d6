//! Long-horizon evaluation: scenario-pack scoring over current state.
//!
//! The score is a deterministic function of the agent's own record: how
//! many candidates survived verification, how error-prone recent cycles
//! were, and how much work sits blocked. Scenario steps then nudge the base
//! per their expectation and weight. No LLM is involved.

use serde::{Deserialize, Serialize};

use crate::canary::recent_error_rate;
use crate::types::{AgentState, CandidateStatus, TaskStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepExpectation {
    Improve,
    Degrade,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioStep {
    #[serde(rename = "type")]
    pub step_type: String,
    pub expected: StepExpectation,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<ScenarioStep>,
}

fn step(step_type: &str, expected: StepExpectation, weight: f64) -> ScenarioStep {
    ScenarioStep {
        step_type: step_type.to_string(),
        expected,
        weight,
    }
}

/// The built-in pack: a steady baseline, an adversarial squeeze, and a
/// regression probe.
pub fn default_pack() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "baseline".to_string(),
            steps: vec![
                step("ingest.signals", StepExpectation::Neutral, 1.0),
                step("plan.candidates", StepExpectation::Improve, 1.0),
                step("synthesize.artifacts", StepExpectation::Improve, 1.0),
            ],
        },
        Scenario {
            name: "adversarial".to_string(),
            steps: vec![
                step("inject.malformed.events", StepExpectation::Degrade, 1.0),
                step("policy.denial.pressure", StepExpectation::Degrade, 0.5),
                step("recover.from.noise", StepExpectation::Improve, 1.0),
            ],
        },
        Scenario {
            name: "regression".to_string(),
            steps: vec![
                step("replay.past.failures", StepExpectation::Degrade, 1.0),
                step("verify.guardrails.hold", StepExpectation::Improve, 1.5),
            ],
        },
    ]
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Base score for the current state, shared by every scenario.
fn base_score(state: &AgentState) -> f64 {
    let verified = state.count_candidates(CandidateStatus::Verified) as f64;
    let error_rate = recent_error_rate(&state.recent_cycles);
    let blocked = state
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .count() as f64;

    clamp01(
        0.65 + (0.06 * verified).min(0.25) - (0.7 * error_rate).min(0.35) - (0.02 * blocked).min(0.2),
    )
}

/// Score one scenario: the base adjusted step by step, clipped each time.
pub fn score_scenario(state: &AgentState, scenario: &Scenario) -> f64 {
    let mut score = base_score(state);
    for step in &scenario.steps {
        let delta = match step.expected {
            StepExpectation::Improve => 0.03 * step.weight,
            StepExpectation::Degrade => -0.03 * step.weight,
            StepExpectation::Neutral => 0.005 * step.weight,
        };
        score = clamp01(score + delta);
    }
    score
}

/// Mean score across the pack. An empty pack scores the bare base.
pub fn evaluate_pack(state: &AgentState, pack: &[Scenario]) -> f64 {
    if pack.is_empty() {
        return base_score(state);
    }
    let total: f64 = pack.iter().map(|s| score_scenario(state, s)).sum();
    total / pack.len() as f64
}
