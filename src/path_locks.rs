//! Per-path write serialization.
//!
//! Every append or rename targeting a persistent file goes through the lock
//! for that absolute path, so a write never starts until the previous write
//! for the same path has finished. Locks are per path: one agent's writes
//! never queue behind another agent's.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Acquire the write lock for `path`. The returned guard releases on drop;
/// a failed write releases the lock the same way, so failures never block
/// the chain.
pub async fn lock_path(path: &Path) -> OwnedMutexGuard<()> {
    let handle = {
        let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .entry(absolute(path))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    };
    handle.lock_owned().await
}
