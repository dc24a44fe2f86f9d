//! Directory layout of a knowledge base output root.

use std::path::{Path, PathBuf};

use tracing::debug;

use kbforge_shared::{KbError, Result, UnitKind};

/// Resolves every well-known path under an output root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `questions/`, `answers/` or `notes/`.
    pub fn unit_dir(&self, kind: UnitKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn inbox_raw(&self) -> PathBuf {
        self.root.join("inbox").join("raw")
    }

    /// Drop folder for `source` exports waiting to be batch-processed.
    pub fn inbox_pending(&self, source: &str) -> PathBuf {
        self.inbox_raw().join(source)
    }

    pub fn inbox_analyzed(&self, source: &str) -> PathBuf {
        self.root.join("inbox").join("analyzed").join(source)
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.root.join("stats")
    }

    pub fn topics_dir(&self) -> PathBuf {
        self.root.join("topics")
    }

    pub fn people_dir(&self) -> PathBuf {
        self.root.join("people")
    }

    pub fn areas_dir(&self) -> PathBuf {
        self.root.join("areas")
    }

    pub fn index_file(&self) -> PathBuf {
        self.root.join("INDEX.md")
    }

    pub fn cursor_file(&self) -> PathBuf {
        self.root.join("source_config.json")
    }

    /// Every file and directory derived from the units by aggregation.
    pub fn derived_paths(&self) -> [PathBuf; 5] {
        [
            self.stats_dir(),
            self.topics_dir(),
            self.people_dir(),
            self.areas_dir(),
            self.index_file(),
        ]
    }

    /// Create the standard subtree for a run against `source`, if absent.
    pub fn ensure(&self, source: &str) -> Result<()> {
        let dirs = [
            self.root.clone(),
            self.unit_dir(UnitKind::Question),
            self.unit_dir(UnitKind::Answer),
            self.unit_dir(UnitKind::Note),
            self.inbox_raw(),
            self.inbox_analyzed(source),
        ];

        for dir in &dirs {
            std::fs::create_dir_all(dir).map_err(|e| KbError::io(dir, e))?;
        }

        debug!(root = %self.root.display(), "directory structure ensured");
        Ok(())
    }
}
