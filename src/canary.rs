//! Canary evaluator: error-rate and latency-regression checks.
//!
//! Runs while the machine sits in the canary stage. Hosts may feed explicit
//! metrics; when none are available the evaluator derives them from the
//! agent's own recent cycle history. A regression demotes every verified
//! candidate back to rejected so nothing regressed can reach promotion.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{AgentState, CandidateStatus, CanaryStatus, CycleRecord, CycleStatus};

/// Cycles sampled when deriving metrics from history.
const CYCLE_SAMPLE: usize = 5;

/// Latency regression tolerated when no explicit limit is supplied.
pub const DEFAULT_MAX_LATENCY_REGRESSION_PCT: f64 = 25.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryInputs {
    pub error_rate: f64,
    pub max_error_rate: f64,
    pub latency_p95_ms: f64,
    pub baseline_latency_p95_ms: f64,
    pub max_latency_regression_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryOutcome {
    pub status: CanaryStatus,
    pub reason: String,
    pub should_rollback: bool,
}

fn clamp_metric(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Evaluate canary inputs. Error-rate exceedance wins over latency; a
/// baseline of zero disables the latency check.
pub fn evaluate_canary(inputs: CanaryInputs) -> CanaryOutcome {
    let error_rate = clamp_metric(inputs.error_rate);
    let max_error_rate = clamp_metric(inputs.max_error_rate);
    let p95 = clamp_metric(inputs.latency_p95_ms);
    let baseline = clamp_metric(inputs.baseline_latency_p95_ms);
    let max_regression_pct = clamp_metric(inputs.max_latency_regression_pct);

    if error_rate > max_error_rate {
        return CanaryOutcome {
            status: CanaryStatus::Regressed,
            reason: format!(
                "error rate {:.3} exceeds limit {:.3}",
                error_rate, max_error_rate
            ),
            should_rollback: true,
        };
    }

    if baseline > 0.0 {
        let regression_pct = (p95 - baseline) / baseline * 100.0;
        if regression_pct > max_regression_pct {
            return CanaryOutcome {
                status: CanaryStatus::Regressed,
                reason: format!(
                    "latency p95 {:.0}ms regressed {:.1}% over baseline {:.0}ms (limit {:.1}%)",
                    p95, regression_pct, baseline, max_regression_pct
                ),
                should_rollback: true,
            };
        }
    }

    CanaryOutcome {
        status: CanaryStatus::Healthy,
        reason: format!(
            "error rate {:.3} within {:.3}, latency p95 {:.0}ms within bounds",
            error_rate, max_error_rate, p95
        ),
        should_rollback: false,
    }
}

/// The last few non-skipped cycles, oldest first.
pub fn recent_cycle_sample(cycles: &[CycleRecord]) -> Vec<&CycleRecord> {
    cycles
        .iter()
        .filter(|c| c.status != CycleStatus::Skipped)
        .rev()
        .take(CYCLE_SAMPLE)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

/// Error rate over the recent cycle sample.
pub fn recent_error_rate(cycles: &[CycleRecord]) -> f64 {
    let sample = recent_cycle_sample(cycles);
    if sample.is_empty() {
        return 0.0;
    }
    let errors = sample
        .iter()
        .filter(|c| c.status == CycleStatus::Error)
        .count();
    errors as f64 / sample.len() as f64
}

fn percentile_95(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (0.95 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn median(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Derive canary inputs from cycle history when explicit metrics are
/// absent: error rate over the sample, p95 from sorted durations, median
/// as the latency baseline.
pub fn derive_inputs_from_cycles(
    cycles: &[CycleRecord],
    max_error_rate: f64,
    max_latency_regression_pct: f64,
) -> CanaryInputs {
    let sample = recent_cycle_sample(cycles);
    let mut durations: Vec<f64> = sample.iter().map(|c| c.duration_ms.max(0) as f64).collect();
    durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    CanaryInputs {
        error_rate: recent_error_rate(cycles),
        max_error_rate,
        latency_p95_ms: percentile_95(&durations),
        baseline_latency_p95_ms: median(&durations),
        max_latency_regression_pct,
    }
}

/// Record the outcome on the state. A regression demotes every verified
/// candidate to rejected; the returned ids feed the rollback ledger entry.
pub fn apply_outcome(state: &mut AgentState, outcome: &CanaryOutcome, now_ms: i64) -> Vec<String> {
    state.augmentation.last_canary_status = Some(outcome.status);
    state.augmentation.last_canary_at = Some(now_ms);

    match outcome.status {
        CanaryStatus::Healthy => {
            info!(reason = %outcome.reason, "canary healthy");
            Vec::new()
        }
        CanaryStatus::Regressed => {
            let mut demoted = Vec::new();
            for candidate in &mut state.augmentation.candidates {
                if candidate.status == CandidateStatus::Verified {
                    candidate.status = CandidateStatus::Rejected;
                    candidate.updated_at = now_ms;
                    demoted.push(candidate.id.clone());
                }
            }
            warn!(
                reason = %outcome.reason,
                demoted = demoted.len(),
                "canary regression, rolled back verified candidates"
            );
            demoted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidateSafety, ExecutionClass, SkillCandidate};

    fn inputs() -> CanaryInputs {
        CanaryInputs {
            error_rate: 0.05,
            max_error_rate: 0.2,
            latency_p95_ms: 1_000.0,
            baseline_latency_p95_ms: 900.0,
            max_latency_regression_pct: 25.0,
        }
    }

    fn cycle(status: CycleStatus, duration_ms: i64) -> CycleRecord {
        CycleRecord {
            started_at: 0,
            finished_at: duration_ms,
            duration_ms,
            status,
            summary: None,
            error: None,
            events_processed: 0,
            tokens_used: 0,
        }
    }

    #[test]
    fn healthy_within_both_limits() {
        let outcome = evaluate_canary(inputs());
        assert_eq!(outcome.status, CanaryStatus::Healthy);
        assert!(!outcome.should_rollback);
    }

    #[test]
    fn error_rate_exceedance_regresses_and_rolls_back() {
        let outcome = evaluate_canary(CanaryInputs {
            error_rate: 0.5,
            ..inputs()
        });
        assert_eq!(outcome.status, CanaryStatus::Regressed);
        assert!(outcome.should_rollback);
        assert!(outcome.reason.contains("error rate"));
    }

    #[test]
    fn latency_regression_past_limit_regresses() {
        let outcome = evaluate_canary(CanaryInputs {
            latency_p95_ms: 2_000.0,
            baseline_latency_p95_ms: 1_000.0,
            max_latency_regression_pct: 50.0,
            ..inputs()
        });
        assert_eq!(outcome.status, CanaryStatus::Regressed);
        assert!(outcome.reason.contains("latency"));
    }

    #[test]
    fn zero_baseline_disables_latency_check() {
        let outcome = evaluate_canary(CanaryInputs {
            latency_p95_ms: 99_999.0,
            baseline_latency_p95_ms: 0.0,
            ..inputs()
        });
        assert_eq!(outcome.status, CanaryStatus::Healthy);
    }

    #[test]
    fn non_finite_and_negative_inputs_clamp_to_zero() {
        let outcome = evaluate_canary(CanaryInputs {
            error_rate: f64::NAN,
            max_error_rate: -3.0,
            latency_p95_ms: f64::INFINITY,
            baseline_latency_p95_ms: -100.0,
            max_latency_regression_pct: f64::NAN,
        });
        // Everything clamps to zero: no error exceedance, no baseline.
        assert_eq!(outcome.status, CanaryStatus::Healthy);
    }

    #[test]
    fn derivation_samples_last_five_non_skipped() {
        let mut cycles = vec![cycle(CycleStatus::Error, 50)];
        for d in [100, 200, 300, 400] {
            cycles.push(cycle(CycleStatus::Ok, d));
        }
        cycles.push(cycle(CycleStatus::Skipped, 9_999));
        cycles.push(cycle(CycleStatus::Error, 500));

        let derived = derive_inputs_from_cycles(&cycles, 0.2, 25.0);
        // Sample is [100, 200, 300, 400, 500]: one error of five.
        assert!((derived.error_rate - 0.2).abs() < 1e-9);
        assert_eq!(derived.latency_p95_ms, 500.0);
        assert_eq!(derived.baseline_latency_p95_ms, 300.0);
    }

    #[test]
    fn derivation_of_empty_history_is_all_zero() {
        let derived = derive_inputs_from_cycles(&[], 0.2, 25.0);
        assert_eq!(derived.error_rate, 0.0);
        assert_eq!(derived.latency_p95_ms, 0.0);
        assert_eq!(derived.baseline_latency_p95_ms, 0.0);
    }

    #[test]
    fn regression_demotes_verified_candidates_only() {
        let mut state = AgentState::default();
        for (i, status) in [
            CandidateStatus::Verified,
            CandidateStatus::Planned,
            CandidateStatus::Verified,
        ]
        .into_iter()
        .enumerate()
        {
            state.augmentation.candidates.push(SkillCandidate {
                id: format!("c{}", i),
                source_gap_id: "g".to_string(),
                name: format!("autonomy-c{}", i),
                intent: String::new(),
                status,
                priority: 1,
                created_at: 0,
                updated_at: 0,
                safety: CandidateSafety {
                    execution_class: ExecutionClass::ReversibleWrite,
                    constraints: vec!["c".to_string()],
                },
                tests: vec!["t".to_string()],
            });
        }

        let outcome = CanaryOutcome {
            status: CanaryStatus::Regressed,
            reason: "test".to_string(),
            should_rollback: true,
        };
        let demoted = apply_outcome(&mut state, &outcome, 9_000);
        assert_eq!(demoted, vec!["c0".to_string(), "c2".to_string()]);
        assert_eq!(
            state.augmentation.candidates[1].status,
            CandidateStatus::Planned
        );
        assert_eq!(state.augmentation.last_canary_status, Some(CanaryStatus::Regressed));
        assert_eq!(state.augmentation.last_canary_at, Some(9_000));
    }

    #[test]
    fn healthy_outcome_records_status_without_demotion() {
        let mut state = AgentState::default();
        let outcome = CanaryOutcome {
            status: CanaryStatus::Healthy,
            reason: "fine".to_string(),
            should_rollback: false,
        };
        let demoted = apply_outcome(&mut state, &outcome, 1_000);
        assert!(demoted.is_empty());
        assert_eq!(state.augmentation.last_canary_status, Some(CanaryStatus::Healthy));
    }
}
