//! Knowledge unit persistence: id allocation, scans, writes and cleanup.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use kbforge_shared::{KbError, KnowledgeUnit, Result, StoreSnapshot, UnitId, UnitKind};

use crate::header::{UnitFile, render_unit};
use crate::layout::StoreLayout;

static UNIT_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(q|a|n)_(\d{4,})\.md$").expect("valid regex")
});

/// Parse a unit file name, returning its id only if it belongs in `kind`'s directory.
fn id_from_file_name(kind: UnitKind, name: &str) -> Option<UnitId> {
    let caps = UNIT_FILE_RE.captures(name)?;
    let found = UnitKind::from_prefix(caps.get(1)?.as_str())?;
    if found != kind {
        return None;
    }
    let seq = caps.get(2)?.as_str().parse::<u32>().ok()?;
    Some(UnitId::new(kind, seq))
}

/// File-backed store of questions, answers and notes under one output root.
///
/// Nothing is cached: every call re-reads the directory tree, so id
/// allocation always reflects what is on disk right now.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    layout: StoreLayout,
}

impl KnowledgeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: StoreLayout::new(root),
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn ensure_layout(&self, source: &str) -> Result<()> {
        self.layout.ensure(source)
    }

    pub fn unit_path(&self, id: UnitId) -> PathBuf {
        self.layout.unit_dir(id.kind).join(id.file_name())
    }

    /// Every well-named unit file of `kind`, sorted by sequence number.
    pub fn unit_files(&self, kind: UnitKind) -> Result<Vec<(UnitId, PathBuf)>> {
        let dir = self.layout.unit_dir(kind);
        let mut files: Vec<(UnitId, PathBuf)> = list_dir(&dir)?
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                id_from_file_name(kind, name).map(|id| (id, path.clone()))
            })
            .collect();
        files.sort_by_key(|(id, _)| *id);
        Ok(files)
    }

    /// Highest sequence number on disk for `kind`, or 0.
    pub fn max_seq(&self, kind: UnitKind) -> Result<u32> {
        Ok(self
            .unit_files(kind)?
            .last()
            .map(|(id, _)| id.seq)
            .unwrap_or(0))
    }

    /// `max + 1` for `kind`. Unrelated files in the directory are ignored.
    pub fn next_id(&self, kind: UnitKind) -> Result<UnitId> {
        let seq = self
            .max_seq(kind)?
            .checked_add(1)
            .ok_or_else(|| KbError::Invariant(format!("{kind} sequence exhausted")))?;
        Ok(UnitId::new(kind, seq))
    }

    pub fn read_unit(&self, id: UnitId) -> Result<KnowledgeUnit> {
        read_unit_at(&self.unit_path(id), id)
    }

    /// Parse every unit of `kind`. Files without a usable header are skipped.
    pub fn scan_all(&self, kind: UnitKind) -> Result<Vec<KnowledgeUnit>> {
        let mut units = Vec::new();
        for (id, path) in self.unit_files(kind)? {
            match read_unit_at(&path, id) {
                Ok(unit) => units.push(unit),
                Err(KbError::Parse { message }) => {
                    warn!(path = %path.display(), %message, "skipping unparseable unit file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(units)
    }

    /// Paths of `.md` files in `kind`'s directory whose `source` header equals `source`.
    pub fn scan_by_source(&self, kind: UnitKind, source: &str) -> Result<Vec<PathBuf>> {
        let mut matches = Vec::new();
        for path in list_dir(&self.layout.unit_dir(kind))? {
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| KbError::io(&path, e))?;
            if UnitFile::parse(&content).scalar("source").as_deref() == Some(source) {
                matches.push(path);
            }
        }
        matches.sort();
        Ok(matches)
    }

    /// The whole store, read fresh from disk.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        Ok(StoreSnapshot {
            questions: self.scan_all(UnitKind::Question)?,
            answers: self.scan_all(UnitKind::Answer)?,
            notes: self.scan_all(UnitKind::Note)?,
        })
    }

    /// Create the file for a new unit. An existing file with the same name is
    /// an invariant violation and is left untouched.
    pub fn write_unit(&self, unit: &KnowledgeUnit) -> Result<PathBuf> {
        self.write_unit_with(unit, write_bytes)
    }

    /// [`Self::write_unit`] with the byte writer supplied by the caller. A
    /// failed write removes the half-written file before returning.
    pub(crate) fn write_unit_with<W>(&self, unit: &KnowledgeUnit, write: W) -> Result<PathBuf>
    where
        W: FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
    {
        let path = self.unit_path(unit.id);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(KbError::Invariant(format!(
                    "unit file {} already exists",
                    path.display()
                )));
            }
            Err(e) => return Err(KbError::io(&path, e)),
        };

        if let Err(e) = write(&mut file, render_unit(unit).as_bytes()) {
            drop(file);
            discard(&path);
            return Err(KbError::io(&path, e));
        }
        debug!(id = %unit.id, path = %path.display(), "unit written");
        Ok(path)
    }

    /// Replace an existing unit file, returning its previous content.
    ///
    /// The new content goes to a temp file that is renamed over the unit, so
    /// a failed write leaves the previous file intact.
    pub fn rewrite_unit(&self, unit: &KnowledgeUnit) -> Result<String> {
        self.rewrite_unit_with(unit, write_bytes)
    }

    pub(crate) fn rewrite_unit_with<W>(&self, unit: &KnowledgeUnit, write: W) -> Result<String>
    where
        W: FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
    {
        let path = self.unit_path(unit.id);
        let previous = std::fs::read_to_string(&path).map_err(|e| KbError::io(&path, e))?;

        // Leading dot keeps the temp name out of unit scans.
        let temp = path.with_file_name(format!(".{}.tmp", unit.id.file_name()));
        let mut file = File::create(&temp).map_err(|e| KbError::io(&temp, e))?;
        if let Err(e) = write(&mut file, render_unit(unit).as_bytes()) {
            drop(file);
            discard(&temp);
            return Err(KbError::io(&temp, e));
        }
        drop(file);
        if let Err(e) = std::fs::rename(&temp, &path) {
            discard(&temp);
            return Err(KbError::io(&path, e));
        }

        debug!(id = %unit.id, "unit rewritten");
        Ok(previous)
    }

    /// Delete everything inside the three unit directories, plus the derived
    /// indices that describe them. Returns the number of entries removed.
    pub fn clean_all(&self) -> Result<usize> {
        let mut removed = 0;
        let unit_entries = UnitKind::ALL
            .into_iter()
            .map(|kind| list_dir(&self.layout.unit_dir(kind)))
            .collect::<Result<Vec<_>>>()?;
        let derived = self.layout.derived_paths().into_iter().filter(|p| p.exists());

        for path in unit_entries.into_iter().flatten().chain(derived) {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            result.map_err(|e| KbError::io(&path, e))?;
            removed += 1;
        }
        info!(removed, "output directories cleaned");
        Ok(removed)
    }

    /// Delete only the unit files produced by `source`. Returns the number removed.
    pub fn clean_source(&self, source: &str) -> Result<usize> {
        let mut removed = 0;
        for kind in UnitKind::ALL {
            for path in self.scan_by_source(kind, source)? {
                std::fs::remove_file(&path).map_err(|e| KbError::io(&path, e))?;
                removed += 1;
            }
        }
        info!(source, removed, "source units cleaned");
        Ok(removed)
    }
}

fn write_bytes(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes)?;
    file.flush()
}

/// Remove a file left behind by a failed write. Failure is only logged.
fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "could not remove partial file");
    }
}

fn read_unit_at(path: &Path, id: UnitId) -> Result<KnowledgeUnit> {
    let content = std::fs::read_to_string(path).map_err(|e| KbError::io(path, e))?;
    UnitFile::parse(&content).into_unit(id)
}

/// Entries of `dir`, or nothing if it does not exist.
fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(KbError::io(dir, e)),
    };

    entries
        .map(|entry| entry.map(|e| e.path()).map_err(|e| KbError::io(dir, e)))
        .collect()
}
