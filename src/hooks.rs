//! Plugin signal hook: the one external callout of the cycle.
//!
//! A host may register a hook that contributes additional discovery signals
//! each cycle. The contract is deterministic-under-replay: given identical
//! inputs and hook ordering, identical outputs. The orchestrator bounds the
//! call with a timeout; a failed or slow hook contributes nothing and never
//! fails the cycle.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Event, EventSource, Stage};

/// Name under which hosts register the hook.
pub const SIGNAL_HOOK_NAME: &str = "autonomy_signal";

/// What the hook sees about the cycle in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalHookContext {
    pub agent_id: String,
    pub workspace_dir: PathBuf,
    pub stage: Stage,
    pub now_ms: i64,
}

/// One additional signal contributed by the hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookSignal {
    pub source: EventSource,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl HookSignal {
    /// Materialize the signal as a cycle event.
    pub fn into_event(self, now_ms: i64) -> Event {
        Event {
            id: uuid::Uuid::new_v4().to_string(),
            source: self.source,
            event_type: self.event_type,
            ts: now_ms,
            dedupe_key: self.dedupe_key,
            payload: self.payload,
        }
    }
}

/// The `autonomy_signal` hook. Implementations must be deterministic for
/// identical inputs and must not block longer than the caller's timeout.
#[async_trait]
pub trait SignalHook: Send + Sync {
    async fn collect(
        &self,
        context: &SignalHookContext,
        known_events: &[Event],
    ) -> anyhow::Result<Vec<HookSignal>>;
}
