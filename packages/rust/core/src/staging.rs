//! Staging record: every side effect of a run, in order, for rollback.

use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use kbforge_shared::{KbError, Result};

/// One reversible filesystem change.
#[derive(Debug, Clone)]
pub enum StagedChange {
    /// A new file. Undone by deleting it.
    Created(PathBuf),
    /// A new directory. Undone by removing it once empty.
    CreatedDir(PathBuf),
    /// An existing file overwritten. Undone by restoring `original`.
    Rewritten { path: PathBuf, original: String },
    /// An existing file deleted. Undone by writing `original` back.
    Removed { path: PathBuf, original: String },
}

impl StagedChange {
    pub fn path(&self) -> &Path {
        match self {
            Self::Created(path) | Self::CreatedDir(path) => path,
            Self::Rewritten { path, .. } | Self::Removed { path, .. } => path,
        }
    }

    fn undo(&self) -> std::io::Result<()> {
        match self {
            Self::Created(path) => match std::fs::remove_file(path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
            Self::CreatedDir(path) => match std::fs::remove_dir(path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
            Self::Rewritten { path, original } | Self::Removed { path, original } => {
                std::fs::write(path, original)
            }
        }
    }
}

/// Ordered list of changes made since staging began.
#[derive(Debug, Default)]
pub struct StagingRecord {
    changes: Vec<StagedChange>,
}

impl StagingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: StagedChange) {
        debug!(path = %change.path().display(), "staged");
        self.changes.push(change);
    }

    pub fn created(&mut self, path: impl Into<PathBuf>) {
        self.push(StagedChange::Created(path.into()));
    }

    pub fn rewritten(&mut self, path: impl Into<PathBuf>, original: String) {
        self.push(StagedChange::Rewritten {
            path: path.into(),
            original,
        });
    }

    pub fn extend(&mut self, changes: impl IntoIterator<Item = StagedChange>) {
        for change in changes {
            self.push(change);
        }
    }

    /// Create `dir` and any missing parents, staging each directory created.
    pub fn create_dir_all(&mut self, dir: &Path) -> Result<()> {
        let missing: Vec<PathBuf> = dir
            .ancestors()
            .take_while(|p| !p.as_os_str().is_empty() && !p.exists())
            .map(Path::to_path_buf)
            .collect();

        std::fs::create_dir_all(dir).map_err(|e| KbError::io(dir, e))?;
        for created in missing.into_iter().rev() {
            self.push(StagedChange::CreatedDir(created));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[StagedChange] {
        &self.changes
    }

    /// Forget every change. Called once the run is durably complete.
    pub fn commit(self) -> usize {
        self.changes.len()
    }

    /// Undo every change in reverse order. Failures are logged and skipped.
    /// Returns the number of changes successfully undone.
    pub fn rollback(self) -> usize {
        let total = self.changes.len();
        let mut undone = 0;

        for change in self.changes.iter().rev() {
            match change.undo() {
                Ok(()) => undone += 1,
                Err(e) => {
                    error!(path = %change.path().display(), error = %e, "rollback step failed");
                }
            }
        }

        if undone < total {
            warn!(undone, total, "rollback incomplete");
        } else {
            debug!(undone, "rollback complete");
        }
        undone
    }
}
