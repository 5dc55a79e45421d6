//! Gap registry: turn discovery signals into a ranked capability-gap set.
//!
//! Matching keys merge: occurrence count bumps, severity and confidence
//! blend toward the newer reading, evidence rolls in a bounded window.
//! Scores favor severe, confident, fresh and recurring gaps.

use tracing::debug;

use crate::signals::DiscoverySignal;
use crate::types::{Gap, GapStatus, EVIDENCE_CAP, GAPS_CAP};
use crate::utils::sha1_16;

/// Blend weights: an established severity moves slowly, confidence slower.
const SEVERITY_KEEP: f64 = 0.65;
const SEVERITY_TAKE: f64 = 0.35;
const CONFIDENCE_KEEP: f64 = 0.7;
const CONFIDENCE_TAKE: f64 = 0.3;

/// Score one gap at `now_ms`.
///
/// `0.55·severity + 0.25·confidence·100 + 0.2·clip(24 − freshnessHours, 0, 24)
///  + 0.5·min(20, occurrences)`, rounded.
pub fn score_gap(gap: &Gap, now_ms: i64) -> u32 {
    let freshness_hours = (now_ms - gap.last_seen_at).max(0) as f64 / 3_600_000.0;
    let freshness = (24.0 - freshness_hours).clamp(0.0, 24.0);
    let occurrences = (gap.occurrences as f64).min(20.0);
    let score = 0.55 * gap.severity as f64
        + 0.25 * gap.confidence * 100.0
        + 0.2 * freshness
        + 0.5 * occurrences;
    score.round().max(0.0) as u32
}

fn apply_signal(gap: &mut Gap, signal: &DiscoverySignal) {
    gap.title = signal.title.clone();
    gap.category = signal.category;
    gap.last_source = signal.source.clone();
    gap.occurrences = gap.occurrences.saturating_add(1);
    gap.last_seen_at = gap.last_seen_at.max(signal.ts);
    gap.severity = (SEVERITY_KEEP * gap.severity as f64 + SEVERITY_TAKE * signal.severity as f64)
        .round() as u32;
    gap.confidence = CONFIDENCE_KEEP * gap.confidence + CONFIDENCE_TAKE * signal.confidence;
    gap.evidence.push(signal.evidence.clone());
    if gap.evidence.len() > EVIDENCE_CAP {
        let start = gap.evidence.len() - EVIDENCE_CAP;
        gap.evidence.drain(..start);
    }
}

fn new_gap(signal: &DiscoverySignal) -> Gap {
    Gap {
        id: sha1_16(&signal.key),
        key: signal.key.clone(),
        title: signal.title.clone(),
        category: signal.category,
        status: GapStatus::Open,
        severity: signal.severity.min(100),
        confidence: signal.confidence.clamp(0.0, 1.0),
        score: 0,
        occurrences: 1,
        first_seen_at: signal.ts,
        last_seen_at: signal.ts,
        last_source: signal.source.clone(),
        evidence: vec![signal.evidence.clone()],
    }
}

/// Upsert a batch of signals into the gap set, rescore everything, and
/// return the set ranked by score desc, recency desc, key asc, truncated
/// to the registry cap.
pub fn upsert_signals(gaps: &mut Vec<Gap>, signals: &[DiscoverySignal], now_ms: i64) {
    for signal in signals {
        match gaps.iter_mut().find(|gap| gap.key == signal.key) {
            Some(existing) => apply_signal(existing, signal),
            None => gaps.push(new_gap(signal)),
        }
    }

    for gap in gaps.iter_mut() {
        gap.score = score_gap(gap, now_ms).min(10_000);
    }

    gaps.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
            .then_with(|| a.key.cmp(&b.key))
    });
    if gaps.len() > GAPS_CAP {
        debug!(dropped = gaps.len() - GAPS_CAP, "gap registry full, dropping lowest-ranked");
        gaps.truncate(GAPS_CAP);
    }
}
