//! Batch processing of exports dropped under `inbox/raw/<source>/`.
//!
//! Each directory name is a source. Files run one at a time in PROCESS_ONLY
//! mode, sorted by name within a source. A file whose content hash already
//! appears in an analyzed snapshot for that source is skipped. A failed file
//! is recorded and the batch moves on; each file's run rolls itself back. One
//! rebuild follows if anything was processed.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use kbforge_shared::{KbError, ProcessingMode, Result, RunParams, StageInstructions};
use kbforge_store::StoreLayout;

use crate::pipeline::{Orchestrator, ProgressReporter};
use crate::rebuild::RebuildResult;

/// Input to [`Orchestrator::process_inbox`].
#[derive(Debug, Clone)]
pub struct InboxParams {
    pub output_root: PathBuf,
    /// Recorded as the sync timestamp of every file processed in this batch.
    pub sync_timestamp: String,
    pub instructions: StageInstructions,
    /// Rebuild derived indices once at the end if any file was processed.
    pub rebuild: bool,
}

impl InboxParams {
    pub fn new(output_root: impl Into<PathBuf>, sync_timestamp: impl Into<String>) -> Self {
        Self {
            output_root: output_root.into(),
            sync_timestamp: sync_timestamp.into(),
            instructions: StageInstructions::default(),
            rebuild: true,
        }
    }
}

/// What happened to one pending file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    Processed { run_id: Uuid, units_created: usize },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct InboxEntry {
    pub source: String,
    pub file: PathBuf,
    pub outcome: InboxOutcome,
}

/// Result of [`Orchestrator::process_inbox`].
#[derive(Debug, Clone, Default)]
pub struct InboxReport {
    pub entries: Vec<InboxEntry>,
    pub rebuild: Option<RebuildResult>,
    pub elapsed: Duration,
}

impl InboxReport {
    pub fn processed(&self) -> usize {
        self.count(|o| matches!(o, InboxOutcome::Processed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, InboxOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, InboxOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&InboxOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}

impl Orchestrator {
    /// Process every pending export under `inbox/raw/<source>/`.
    ///
    /// Only a missing root or an unreadable inbox fails the whole batch; a
    /// failing rebuild is returned as an error after all files were handled.
    #[instrument(skip_all, fields(root = %params.output_root.display()))]
    pub async fn process_inbox(
        &self,
        params: &InboxParams,
        progress: &dyn ProgressReporter,
    ) -> Result<InboxReport> {
        let start = Instant::now();
        let root = params.output_root.as_path();
        if !root.is_dir() {
            return Err(KbError::validation(format!(
                "output root {} does not exist",
                root.display()
            )));
        }

        let layout = StoreLayout::new(root);
        let pending = pending_files(&layout)?;
        info!(files = pending.len(), "inbox scanned");

        let mut report = InboxReport::default();
        for (source, file) in pending {
            let outcome = self.process_pending(&layout, &source, &file, params, progress).await;
            report.entries.push(InboxEntry {
                source,
                file,
                outcome,
            });
        }

        if params.rebuild && report.processed() > 0 {
            report.rebuild = Some(self.rebuild(root, None, progress).await?);
        }

        report.elapsed = start.elapsed();
        info!(
            processed = report.processed(),
            skipped = report.skipped(),
            failed = report.failed(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "inbox batch complete"
        );
        Ok(report)
    }

    async fn process_pending(
        &self,
        layout: &StoreLayout,
        source: &str,
        file: &Path,
        params: &InboxParams,
        progress: &dyn ProgressReporter,
    ) -> InboxOutcome {
        let digest = match std::fs::read(file) {
            Ok(bytes) => format!("{:x}", Sha256::digest(&bytes)),
            Err(e) => {
                warn!(file = %file.display(), error = %e, "cannot read pending file");
                return InboxOutcome::Failed {
                    error: KbError::io(file, e).to_string(),
                };
            }
        };

        if let Some(snapshot) = analyzed_snapshot_for(&layout.inbox_analyzed(source), &digest) {
            debug!(file = %file.display(), snapshot = %snapshot.display(), "already analyzed");
            return InboxOutcome::Skipped {
                reason: format!("already analyzed in {}", snapshot.display()),
            };
        }

        let mut run = RunParams::new(source, file, &params.sync_timestamp, &params.output_root);
        run.processing_mode = ProcessingMode::ProcessOnly;
        run.instructions = params.instructions.clone();

        progress.phase(&format!("Processing {source}/{}", display_name(file)));
        match self.run(&run, progress).await {
            Ok(result) => InboxOutcome::Processed {
                run_id: result.run_id,
                units_created: result.units_created(),
            },
            Err(e) => {
                warn!(source, file = %file.display(), error = %e, "pending file failed, continuing");
                InboxOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

/// `(source, file)` pairs under `inbox/raw/`, sorted by source then file name.
/// Hidden entries and loose files directly under `inbox/raw/` are ignored.
fn pending_files(layout: &StoreLayout) -> Result<Vec<(String, PathBuf)>> {
    let raw = layout.inbox_raw();
    if !raw.is_dir() {
        return Ok(Vec::new());
    }

    let mut sources: Vec<String> = visible_entries(&raw)?
        .into_iter()
        .filter(|(_, path)| path.is_dir())
        .map(|(name, _)| name)
        .collect();
    sources.sort();

    let mut pending = Vec::new();
    for source in sources {
        let mut files: Vec<(String, PathBuf)> = visible_entries(&layout.inbox_pending(&source))?
            .into_iter()
            .filter(|(_, path)| path.is_file())
            .collect();
        files.sort();
        pending.extend(files.into_iter().map(|(_, path)| (source.clone(), path)));
    }
    Ok(pending)
}

fn visible_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = std::fs::read_dir(dir).map_err(|e| KbError::io(dir, e))?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| KbError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            out.push((name, entry.path()));
        }
    }
    Ok(out)
}

/// First `*_analyzed.json` in `dir` whose `input_sha256` equals `digest`.
fn analyzed_snapshot_for(dir: &Path, digest: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut snapshots: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("_analyzed.json"))
        })
        .collect();
    snapshots.sort();

    snapshots.into_iter().find(|path| {
        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).map_err(|e| e.to_string()));
        match parsed {
            Ok(value) => value.get("input_sha256").and_then(|v| v.as_str()) == Some(digest),
            Err(e) => {
                warn!(snapshot = %path.display(), error = %e, "unreadable analyzed snapshot, ignoring");
                false
            }
        }
    })
}

fn display_name(file: &Path) -> String {
    file.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}
