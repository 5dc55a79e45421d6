//! Shared test fixtures: isolated state roots, workspaces and cycle
//! helpers used by unit and integration tests.

use std::path::PathBuf;

use tempfile::TempDir;

use crate::config::AutonomyConfig;
use crate::runtime::{FinalizeParams, Prepared, PrepareParams, Runtime, TokenUsage};
use crate::store::{AgentStore, NewEvent};
use crate::types::{CycleStatus, EventSource};

#[derive(Debug, Clone, Default)]
pub struct FixtureOptions {
    pub config: AutonomyConfig,
}

pub struct Fixture {
    pub config: AutonomyConfig,
    state_root: TempDir,
    workspace_dir: TempDir,
}

/// Build an isolated fixture: fresh temp state root and workspace.
pub async fn fixture(options: FixtureOptions) -> Fixture {
    Fixture {
        config: options.config,
        state_root: TempDir::new().expect("state root tempdir"),
        workspace_dir: TempDir::new().expect("workspace tempdir"),
    }
}

impl Fixture {
    pub fn runtime(&self) -> Runtime {
        Runtime::new(AgentStore::new(self.state_root.path()), self.config.clone())
    }

    pub fn workspace(&self) -> PathBuf {
        self.workspace_dir.path().to_path_buf()
    }

    pub fn prepare_params(&self, agent_id: &str, now_ms: i64) -> PrepareParams {
        PrepareParams {
            agent_id: agent_id.to_string(),
            workspace_dir: self.workspace(),
            overrides: None,
            canary: None,
            now_ms: Some(now_ms),
        }
    }

    pub fn manual_event(&self, agent_id: &str, event_type: &str, key: Option<&str>) -> NewEvent {
        NewEvent {
            agent_id: agent_id.to_string(),
            source: EventSource::Manual,
            event_type: event_type.to_string(),
            dedupe_key: key.map(str::to_string),
            payload: None,
            ts: Some(0),
        }
    }

    /// Finalize a prepared cycle with plain defaults.
    pub async fn finish(&self, runtime: &Runtime, prepared: Prepared, status: CycleStatus) {
        let finished_at = prepared.cycle_started_at + 1_000;
        runtime
            .finalize(FinalizeParams {
                state: prepared.state,
                workspace_dir: self.workspace(),
                status,
                summary: None,
                error: match status {
                    CycleStatus::Error => Some("injected test failure".to_string()),
                    _ => None,
                },
                events: prepared.events,
                dropped_duplicates: prepared.dropped_duplicates,
                dropped_invalid: prepared.dropped_invalid,
                dropped_overflow: prepared.dropped_overflow,
                remaining_events: prepared.remaining_events,
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                cycle_started_at: prepared.cycle_started_at,
                lock_token: prepared.lock_token,
                now_ms: Some(finished_at),
            })
            .await
            .expect("finalize");
    }
}
