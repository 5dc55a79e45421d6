//! Operator-visible workspace files.
//!
//! Goals, tasks and log files live in the agent's workspace directory and
//! are created from fixed templates on first use. The log gains one block
//! per cycle at finalize time; nothing here is ever parsed back into state.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::path_locks::lock_path;
use crate::types::{AgentState, CycleStatus, Event};
use crate::utils::{iso_timestamp, truncate_str};

const GOALS_TEMPLATE: &str = "\
# Autonomy Goals

Long-lived goals for this agent. One goal per bullet; the autonomy engine
reads these for context and never edits them.

- (add goals here)
";

const TASKS_TEMPLATE: &str = "\
# Autonomy Tasks

Working task list for this agent. Keep statuses current; blocked and
in-progress tasks that go stale raise discovery signals.

- (add tasks here)
";

const LOG_TEMPLATE: &str = "\
# Autonomy Log

One block per cycle, appended by the autonomy engine. Do not edit.
";

/// Resolve a state file reference against the workspace directory.
/// Absolute paths pass through untouched.
pub fn resolve_path(workspace_dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_dir.join(path)
    }
}

async fn ensure_file(path: &Path, template: &str) -> anyhow::Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, template).await?;
    info!(path = %path.display(), "created workspace file from template");
    Ok(())
}

/// Create the goals, tasks and log files from templates where absent.
pub async fn ensure_workspace_files(workspace_dir: &Path, state: &AgentState) -> anyhow::Result<()> {
    ensure_file(&resolve_path(workspace_dir, &state.goals_file), GOALS_TEMPLATE).await?;
    ensure_file(&resolve_path(workspace_dir, &state.tasks_file), TASKS_TEMPLATE).await?;
    ensure_file(&resolve_path(workspace_dir, &state.log_file), LOG_TEMPLATE).await?;
    Ok(())
}

/// Everything one cycle contributes to the log.
#[derive(Debug, Clone)]
pub struct CycleLogBlock<'a> {
    pub now_ms: i64,
    pub status: CycleStatus,
    pub summary: Option<&'a str>,
    pub error: Option<&'a str>,
    pub events: &'a [Event],
    pub dropped_duplicates: usize,
    pub dropped_invalid: usize,
    pub dropped_overflow: usize,
    pub remaining_events: usize,
}

fn render_block(state: &AgentState, block: &CycleLogBlock<'_>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "\n## {} cycle {}\n\n",
        iso_timestamp(block.now_ms),
        block.status.as_str()
    ));
    if let Some(summary) = block.summary {
        if !summary.trim().is_empty() {
            out.push_str(&format!("- summary: {}\n", truncate_str(summary.trim(), 300)));
        }
    }
    if let Some(error) = block.error {
        if !error.trim().is_empty() {
            out.push_str(&format!("- error: {}\n", truncate_str(error.trim(), 300)));
        }
    }
    out.push_str(&format!(
        "- events: {} processed (dropped {} duplicate, {} invalid, {} overflow), {} still queued\n",
        block.events.len(),
        block.dropped_duplicates,
        block.dropped_invalid,
        block.dropped_overflow,
        block.remaining_events
    ));
    out.push_str(&format!(
        "- budget: {} cycles, {} tokens used on {}\n",
        state.budget.cycles_used, state.budget.tokens_used, state.budget.day_key
    ));
    for event in block.events {
        let digest = event
            .payload
            .as_ref()
            .map(|p| truncate_str(&p.to_string(), 80))
            .unwrap_or_default();
        if digest.is_empty() {
            out.push_str(&format!("  - {} ({})\n", event.event_type, event.source.as_str()));
        } else {
            out.push_str(&format!(
                "  - {} ({}) {}\n",
                event.event_type,
                event.source.as_str(),
                digest
            ));
        }
    }
    out
}

/// Append one cycle block to the workspace log, creating it from the
/// template when absent. Appends to a path are serialized per path.
pub async fn append_log_block(
    workspace_dir: &Path,
    state: &AgentState,
    block: &CycleLogBlock<'_>,
) -> anyhow::Result<()> {
    let path = resolve_path(workspace_dir, &state.log_file);
    let _guard = lock_path(&path).await;

    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, LOG_TEMPLATE).await?;
    }

    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(render_block(state, block).as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
