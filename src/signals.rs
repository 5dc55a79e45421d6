//! Signal normalizer: classify drained events into discovery signals.
//!
//! A fixed table maps event-type shapes to a gap category plus severity and
//! confidence. One signal per dedupe key per call; repeats within a batch
//! only add evidence downstream, they do not multiply signals.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::{Event, GapCategory};
use crate::utils::{sha1_16, title_from_type};

/// A classified discovery signal, ready for the gap registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverySignal {
    /// 16-hex SHA-1 prefix over the key.
    pub id: String,
    /// Source-qualified key; identical keys merge into one gap.
    pub key: String,
    pub title: String,
    pub category: GapCategory,
    pub severity: u32,
    pub confidence: f64,
    pub source: String,
    pub ts: i64,
    pub evidence: String,
}

/// Classification for one event type: (category, severity, confidence).
fn classify(event_type: &str) -> (GapCategory, u32, f64) {
    // Synthetic cycle events carry an `autonomy.` prefix; classification
    // works on the bare type.
    let bare = event_type.strip_prefix("autonomy.").unwrap_or(event_type);

    if bare.starts_with("queue.") {
        return (GapCategory::Reliability, 85, 0.9);
    }
    if bare.starts_with("task.stale") {
        return (GapCategory::Capability, 70, 0.85);
    }
    if bare.starts_with("review.") {
        return (GapCategory::Quality, 40, 0.6);
    }
    if bare.contains("security") || bare.contains("policy") {
        return (GapCategory::Safety, 90, 0.8);
    }
    if bare.contains("timeout") || bare.contains("error") || bare.contains("failed") {
        return (GapCategory::Reliability, 75, 0.8);
    }
    if bare.contains("latency") {
        return (GapCategory::Latency, 65, 0.65);
    }
    if bare.contains("cost") || bare.contains("budget") {
        return (GapCategory::Cost, 55, 0.7);
    }
    (GapCategory::Unknown, 30, 0.4)
}

fn signal_key(event: &Event) -> String {
    let base = event
        .dedupe_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .unwrap_or(&event.event_type);
    format!("{}:{}", event.source.as_str(), base)
}

fn signal_title(event: &Event) -> String {
    if let Some(title) = event
        .payload
        .as_ref()
        .and_then(|p| p.get("title"))
        .and_then(|t| t.as_str())
    {
        let title = title.trim();
        if !title.is_empty() {
            return title.to_string();
        }
    }
    title_from_type(&event.event_type)
}

fn signal_evidence(event: &Event) -> String {
    match &event.payload {
        Some(payload) => format!("{} {}", event.event_type, payload),
        None => event.event_type.clone(),
    }
}

/// Normalize a batch of events into at most one signal per key.
pub fn normalize_events(events: &[Event]) -> Vec<DiscoverySignal> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut signals = Vec::new();
    for event in events {
        let key = signal_key(event);
        if !seen.insert(key.clone()) {
            continue;
        }
        let (category, severity, confidence) = classify(&event.event_type);
        signals.push(DiscoverySignal {
            id: sha1_16(&key),
            key,
            title: signal_title(event),
            category,
            severity,
            confidence,
            source: event.source.as_str().to_string(),
            ts: event.ts,
            evidence: signal_evidence(event),
        });
    }
    signals
}
