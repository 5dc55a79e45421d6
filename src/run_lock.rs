//! Per-agent run mutual exclusion.
//!
//! A cycle may only run while holding both the in-process entry for the
//! agent and the on-disk `run.lock` file. The file carries a token and an
//! expiry; locks past their expiry are stale and always reclaimable, so a
//! crashed process never wedges an agent for good.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const RUN_LOCK_FILE: &str = "run.lock";
/// Locks expire six hours after acquisition.
pub const RUN_LOCK_TTL_MS: i64 = 6 * 60 * 60 * 1000;
const ACQUIRE_ATTEMPTS: u32 = 3;

/// In-process lock table, keyed by agent directory so two agents with the
/// same id under different state roots never contend.
static LIVE: Lazy<Mutex<HashMap<String, String>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn live_key(agent_dir: &Path) -> String {
    if agent_dir.is_absolute() {
        agent_dir.display().to_string()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(agent_dir).display().to_string())
            .unwrap_or_else(|_| agent_dir.display().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunLockFile {
    token: String,
    acquired_at: i64,
    expires_at: i64,
}

/// A held run-lock. Release is explicit; dropping without release leaves
/// the file for stale reclamation.
#[derive(Debug)]
pub struct RunLockGuard {
    live_key: String,
    agent_label: String,
    path: PathBuf,
    token: String,
}

impl RunLockGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

fn lock_path(agent_dir: &Path) -> PathBuf {
    agent_dir.join(RUN_LOCK_FILE)
}

async fn read_lock_file(path: &Path) -> Option<RunLockFile> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&content).ok()
}

/// Remove the lock file, treating an already-gone file as success.
async fn remove_lock_file(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Try to acquire the run-lock for an agent directory.
///
/// Returns `Ok(None)` on contention (live in-memory entry, or an unexpired
/// lock file). Acquisition retries the exclusive create a bounded number of
/// times so a racing release does not surface as contention.
pub async fn acquire(
    agent_dir: &Path,
    agent_label: &str,
    now_ms: i64,
) -> anyhow::Result<Option<RunLockGuard>> {
    let map_key = live_key(agent_dir);
    {
        let live = LIVE.lock().unwrap_or_else(|e| e.into_inner());
        if live.contains_key(&map_key) {
            return Ok(None);
        }
    }

    tokio::fs::create_dir_all(agent_dir).await?;
    let path = lock_path(agent_dir);

    for attempt in 0..ACQUIRE_ATTEMPTS {
        match read_lock_file(&path).await {
            Some(existing) if existing.expires_at > now_ms => {
                debug!(
                    agent = %agent_label,
                    token = %existing.token,
                    "run-lock held on disk, refusing"
                );
                return Ok(None);
            }
            Some(_) => {
                // Stale lock: a previous holder crashed or expired.
                warn!(agent = %agent_label, "reclaiming stale run-lock");
                remove_lock_file(&path).await?;
            }
            None if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
                // Unreadable lock files cannot prove liveness.
                warn!(agent = %agent_label, "removing unreadable run-lock");
                remove_lock_file(&path).await?;
            }
            None => {}
        }

        let token = uuid::Uuid::new_v4().to_string();
        let record = RunLockFile {
            token: token.clone(),
            acquired_at: now_ms,
            expires_at: now_ms + RUN_LOCK_TTL_MS,
        };
        let body = serde_json::to_string_pretty(&record)?;

        // create-new-or-fail claims the lock.
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(body.as_bytes()).await?;
                file.flush().await?;
                let mut live = LIVE.lock().unwrap_or_else(|e| e.into_inner());
                // Both locks must agree before mutation begins.
                if live.contains_key(&map_key) {
                    drop(live);
                    let _ = tokio::fs::remove_file(&path).await;
                    return Ok(None);
                }
                live.insert(map_key.clone(), token.clone());
                return Ok(Some(RunLockGuard {
                    live_key: map_key,
                    agent_label: agent_label.to_string(),
                    path,
                    token,
                }));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(agent = %agent_label, attempt, "run-lock create raced, retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(None)
}

/// Release a held lock. The file is deleted only when its token matches the
/// guard's; the in-memory entry goes regardless so a mismatch cannot wedge
/// the process.
pub async fn release(guard: RunLockGuard) -> anyhow::Result<()> {
    {
        let mut live = LIVE.lock().unwrap_or_else(|e| e.into_inner());
        if live.get(&guard.live_key) == Some(&guard.token) {
            live.remove(&guard.live_key);
        }
    }

    match read_lock_file(&guard.path).await {
        Some(existing) if existing.token == guard.token => {
            remove_lock_file(&guard.path).await?;
        }
        Some(_) => {
            warn!(agent = %guard.agent_label, "run-lock token mismatch on release, leaving file");
        }
        None => {}
    }
    Ok(())
}
