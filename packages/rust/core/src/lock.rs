//! Advisory lock per output root.
//!
//! Runs sharing an output root serialize from id allocation through the
//! cursor update, and rebuilds take the same lock. The registry is
//! process-local; separate processes writing one root are not coordinated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use kbforge_shared::{KbError, Result};

static ROOT_LOCKS: LazyLock<StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| StdMutex::new(HashMap::new()));

/// Guard held while the root is locked.
#[derive(Debug)]
pub struct RootGuard {
    root: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

impl RootGuard {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Wait for exclusive access to `root`. The root must already exist.
pub async fn lock_root(root: &Path) -> Result<RootGuard> {
    let key = root.canonicalize().map_err(|e| KbError::io(root, e))?;

    let mutex = {
        let mut registry = ROOT_LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(registry.entry(key.clone()).or_default())
    };

    debug!(root = %key.display(), "waiting for output root lock");
    let guard = mutex.lock_owned().await;
    debug!(root = %key.display(), "output root lock acquired");

    Ok(RootGuard {
        root: key,
        _guard: guard,
    })
}
