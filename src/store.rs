//! Durable per-agent state and event queue.
//!
//! The store owns the on-disk representation for one agent under a
//! per-agent directory: `state.json`, `state.backup.json`, `events.jsonl`,
//! the augmentation ledger and the run-lock file. It provides:
//! - Load with corruption recovery (primary, then backup, then defaults)
//! - Atomic saves (temp file + rename) with a trailing backup mirror
//! - Queue append and drain with dedupe, overflow and malformed-line counts
//! - Ledger access and operator reset

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::config::AutonomyConfig;
use crate::ledger::{self, NewLedgerEntry};
use crate::path_locks::lock_path;
use crate::types::{AgentState, Event, EventSource, LedgerEntry};
use crate::utils::normalize_agent_id;

pub const STATE_FILE: &str = "state.json";
pub const BACKUP_FILE: &str = "state.backup.json";
pub const EVENTS_FILE: &str = "events.jsonl";
/// Hard cap on retained queue lines; overflow drops the oldest.
pub const QUEUE_HARD_CAP: usize = 5000;

/// Environment variable redirecting the state root (test isolation).
pub const STATE_DIR_ENV: &str = "AUTONOMYD_STATE_DIR";

/// Parameters for appending one event to an agent's queue.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub agent_id: String,
    pub source: EventSource,
    pub event_type: String,
    pub dedupe_key: Option<String>,
    pub payload: Option<Value>,
    pub ts: Option<i64>,
}

/// Outcome of one queue drain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub events: Vec<Event>,
    pub dropped_duplicates: usize,
    pub dropped_invalid: usize,
    pub dropped_overflow: usize,
    pub remaining: usize,
}

/// Filesystem store rooted at `<config-root>/autonomy`.
#[derive(Debug, Clone)]
pub struct AgentStore {
    root: PathBuf,
}

impl AgentStore {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            root: config_root.into().join("autonomy"),
        }
    }

    /// Like [`AgentStore::new`], but `AUTONOMYD_STATE_DIR` wins when set.
    pub fn from_env(default_config_root: impl Into<PathBuf>) -> Self {
        match std::env::var(STATE_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => Self {
                root: PathBuf::from(dir.trim()),
            },
            _ => Self::new(default_config_root),
        }
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(normalize_agent_id(agent_id))
    }

    // =====================================================================
    // State document
    // =====================================================================

    /// Load the agent's state. Falls back to the backup when the primary is
    /// empty or corrupt, and to a default document built from `defaults`
    /// when both are. Never returns a partial state.
    pub async fn load_state(
        &self,
        agent_id: &str,
        defaults: &AutonomyConfig,
        now_ms: i64,
    ) -> anyhow::Result<AgentState> {
        let dir = self.agent_dir(agent_id);
        let primary = dir.join(STATE_FILE);
        let backup = dir.join(BACKUP_FILE);

        let mut fresh = false;
        let mut state = match read_state_file(&primary).await {
            Some(state) => state,
            None => match read_state_file(&backup).await {
                Some(state) => {
                    warn!(agent_id = %agent_id, "state.json unreadable, recovered from backup");
                    state
                }
                None => {
                    info!(agent_id = %agent_id, "initializing fresh agent state");
                    fresh = true;
                    defaults.initial_state(agent_id, now_ms)
                }
            },
        };

        state.agent_id = normalize_agent_id(agent_id);
        state.normalize(now_ms);
        state.refresh_budget_window(now_ms);

        if fresh {
            self.save_state(&state).await?;
        }
        Ok(state)
    }

    /// Serialize the state as pretty JSON, write it to a per-process unique
    /// temp file, atomically rename over the primary, then mirror to the
    /// backup. The backup may lag the primary by at most one successful
    /// save and never precedes it.
    pub async fn save_state(&self, state: &AgentState) -> anyhow::Result<()> {
        let dir = self.agent_dir(&state.agent_id);
        let primary = dir.join(STATE_FILE);
        let _guard = lock_path(&primary).await;

        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::to_string_pretty(state)?;

        write_atomic(&dir, &primary, &body).await?;
        write_atomic(&dir, &dir.join(BACKUP_FILE), &body).await?;
        Ok(())
    }

    pub async fn has_state(&self, agent_id: &str) -> bool {
        tokio::fs::try_exists(self.agent_dir(agent_id).join(STATE_FILE))
            .await
            .unwrap_or(false)
    }

    /// Delete the agent directory. Operator action only.
    pub async fn reset_runtime(&self, agent_id: &str) -> anyhow::Result<()> {
        let dir = self.agent_dir(agent_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(agent_id = %agent_id, "agent runtime reset");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // =====================================================================
    // Event queue
    // =====================================================================

    /// Append one event to the agent's queue, assigning an id when absent.
    /// Returns the materialized event.
    pub async fn enqueue_event(&self, new: NewEvent) -> anyhow::Result<Event> {
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            source: new.source,
            event_type: new.event_type.trim().to_string(),
            ts: new
                .ts
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            dedupe_key: new
                .dedupe_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            payload: new.payload,
        };
        anyhow::ensure!(!event.event_type.is_empty(), "event type must be non-empty");

        let dir = self.agent_dir(&new.agent_id);
        let path = dir.join(EVENTS_FILE);
        let _guard = lock_path(&path).await;

        tokio::fs::create_dir_all(&dir).await?;
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(event)
    }

    /// Number of lines currently queued (cheap telemetry; counts raw lines).
    pub async fn queue_depth(&self, agent_id: &str) -> usize {
        let path = self.agent_dir(agent_id).join(EVENTS_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => content.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(_) => 0,
        }
    }

    /// Drain the queue: drop overflow beyond the hard cap (oldest first),
    /// drop malformed lines, admit up to `max_events` events not seen
    /// within the dedupe window, record admissions in `state.dedupe`, and
    /// write the residual queue back atomically.
    pub async fn drain_events(
        &self,
        agent_id: &str,
        state: &mut AgentState,
        max_events: usize,
        now_ms: i64,
    ) -> anyhow::Result<DrainReport> {
        let dir = self.agent_dir(agent_id);
        let path = dir.join(EVENTS_FILE);
        let _guard = lock_path(&path).await;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut report = DrainReport::default();
        let mut lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        if lines.len() > QUEUE_HARD_CAP {
            report.dropped_overflow = lines.len() - QUEUE_HARD_CAP;
            lines.drain(..report.dropped_overflow);
            warn!(
                agent_id = %agent_id,
                dropped = report.dropped_overflow,
                "event queue overflow, dropped oldest lines"
            );
        }

        let mut residual: Vec<Event> = Vec::new();
        for line in lines {
            let event: Event = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(_) => {
                    report.dropped_invalid += 1;
                    continue;
                }
            };
            let key = event.effective_dedupe_key();
            if state.is_duplicate(&key, now_ms) {
                report.dropped_duplicates += 1;
                continue;
            }
            if report.events.len() < max_events {
                state.record_dedupe(key, now_ms);
                report.events.push(event);
            } else {
                residual.push(event);
            }
        }

        report.remaining = residual.len();
        let mut body = String::new();
        for event in &residual {
            body.push_str(&serde_json::to_string(event)?);
            body.push('\n');
        }
        write_atomic(&dir, &path, &body).await?;

        Ok(report)
    }

    // =====================================================================
    // Ledger
    // =====================================================================

    pub async fn append_ledger(
        &self,
        new: NewLedgerEntry,
        now_ms: i64,
    ) -> anyhow::Result<LedgerEntry> {
        let dir = self.agent_dir(&new.agent_id);
        ledger::append(&dir, new, now_ms).await
    }

    pub async fn read_ledger(
        &self,
        agent_id: &str,
        limit: usize,
        offset: usize,
    ) -> Vec<LedgerEntry> {
        ledger::read_entries(&self.agent_dir(agent_id), limit, offset).await
    }
}

async fn read_state_file(path: &Path) -> Option<AgentState> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    if content.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<AgentState>(&content) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state document unparseable");
            None
        }
    }
}

/// Write `body` to a per-process unique temp file in `dir`, then atomically
/// rename onto `target`.
async fn write_atomic(dir: &Path, target: &Path, body: &str) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let tmp = dir.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        uuid::Uuid::new_v4()
    ));
    tokio::fs::write(&tmp, body).await?;
    match tokio::fs::rename(&tmp, target).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e.into())
        }
    }
}
