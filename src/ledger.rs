//! Append-only JSONL audit log, tamper-evident per file.
//!
//! Entries are only ever appended; the core never rewrites or deletes a
//! line. Each entry chains a 16-hex SHA-1 digest over the previous entry's
//! digest and its own identifying fields, so any in-place edit breaks the
//! chain from that point on. Reads tolerate a truncated trailing line (a
//! crash mid-append) and skip malformed entries.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::path_locks::lock_path;
use crate::types::{LedgerEntry, LedgerEventType, Stage};
use crate::utils::sha1_16;

pub const LEDGER_FILE: &str = "augmentation-ledger.jsonl";
pub const GENESIS_DIGEST: &str = "genesis";

fn ledger_path(agent_dir: &Path) -> PathBuf {
    agent_dir.join(LEDGER_FILE)
}

/// Fields a caller provides; id, ts chaining digests and correlation id are
/// filled in on append when absent.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub agent_id: String,
    pub event_type: LedgerEventType,
    pub stage: Stage,
    pub actor: String,
    pub summary: String,
    pub evidence: Option<serde_json::Value>,
    pub correlation_id: Option<String>,
}

fn entry_digest(prev_digest: &str, entry: &LedgerEntry) -> String {
    sha1_16(&format!(
        "{}|{}|{}|{}|{}",
        prev_digest,
        entry.id,
        entry.ts,
        entry.event_type.as_str(),
        entry.summary
    ))
}

/// Digest of the last well-formed line (genesis for an empty file), plus
/// whether the file ends mid-line from a crashed append.
async fn tail_state(path: &Path) -> (String, bool) {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => return (GENESIS_DIGEST.to_string(), false),
    };
    let needs_newline = !content.is_empty() && !content.ends_with('\n');
    let digest = content
        .lines()
        .rev()
        .find_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            serde_json::from_str::<LedgerEntry>(line)
                .ok()
                .map(|entry| entry.digest)
        })
        .filter(|digest| !digest.is_empty())
        .unwrap_or_else(|| GENESIS_DIGEST.to_string());
    (digest, needs_newline)
}

/// Append one entry to the agent's ledger. Assigns id, timestamp,
/// correlation id and the chained digest, and returns the materialized
/// entry. Writes for one ledger file are serialized per path.
pub async fn append(agent_dir: &Path, new: NewLedgerEntry, now_ms: i64) -> anyhow::Result<LedgerEntry> {
    let path = ledger_path(agent_dir);
    let _guard = lock_path(&path).await;

    tokio::fs::create_dir_all(agent_dir).await?;
    let (prev_digest, needs_newline) = tail_state(&path).await;

    let mut entry = LedgerEntry {
        id: uuid::Uuid::new_v4().to_string(),
        agent_id: new.agent_id,
        ts: now_ms,
        correlation_id: new
            .correlation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        event_type: new.event_type,
        stage: new.stage,
        actor: new.actor,
        summary: new.summary,
        evidence: new.evidence,
        prev_digest: prev_digest.clone(),
        digest: String::new(),
    };
    entry.digest = entry_digest(&prev_digest, &entry);

    // A crashed append can leave a partial final line; terminate it so the
    // new entry starts on its own line and the partial stays skippable.
    let mut line = String::new();
    if needs_newline {
        line.push('\n');
    }
    line.push_str(&serde_json::to_string(&entry)?);
    line.push('\n');

    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;

    Ok(entry)
}

/// Parse every well-formed line of the ledger. Malformed and truncated
/// lines are skipped, not fatal.
async fn read_all(agent_dir: &Path) -> Vec<LedgerEntry> {
    let path = ledger_path(agent_dir);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(_) => return Vec::new(),
    };
    let mut entries = Vec::new();
    let mut skipped = 0usize;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "skipped malformed ledger lines");
    }
    entries
}

/// Read entries sorted by descending timestamp, then paginate.
pub async fn read_entries(agent_dir: &Path, limit: usize, offset: usize) -> Vec<LedgerEntry> {
    let mut entries = read_all(agent_dir).await;
    entries.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| b.id.cmp(&a.id)));
    entries.into_iter().skip(offset).take(limit).collect()
}

/// Outcome of a tamper-evidence walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    Intact { entries: usize },
    /// The chain breaks at this zero-based entry index.
    Broken { at: usize, reason: String },
}

/// Walk the file in append order and verify the digest chain.
pub async fn verify_chain(agent_dir: &Path) -> ChainStatus {
    let entries = read_all(agent_dir).await;
    let mut prev = GENESIS_DIGEST.to_string();
    for (index, entry) in entries.iter().enumerate() {
        if entry.prev_digest != prev {
            return ChainStatus::Broken {
                at: index,
                reason: format!(
                    "prevDigest {} does not match preceding digest {}",
                    entry.prev_digest, prev
                ),
            };
        }
        let expected = entry_digest(&prev, entry);
        if entry.digest != expected {
            return ChainStatus::Broken {
                at: index,
                reason: format!("digest {} does not match recomputed {}", entry.digest, expected),
            };
        }
        prev = entry.digest.clone();
    }
    ChainStatus::Intact {
        entries: entries.len(),
    }
}
