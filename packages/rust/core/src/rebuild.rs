//! Recovery path: recompute derived indices from the unit files alone.
//!
//! No analysis or mapping agent is called and the sync cursor is left alone.
//! Primary unit files are only read. If writing the indices fails, the
//! previous indices are restored.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument};

use kbforge_shared::{KbError, Result, Statistics};
use kbforge_store::KnowledgeStore;

use crate::indices::write_indices;
use crate::lock::lock_root;
use crate::pipeline::{Orchestrator, ProgressReporter};
use crate::staging::StagingRecord;

/// Result of [`Orchestrator::rebuild`].
#[derive(Debug, Clone)]
pub struct RebuildResult {
    pub units_scanned: usize,
    pub statistics: Statistics,
    pub topics_written: usize,
    pub people_written: usize,
    pub areas_written: usize,
    pub elapsed: Duration,
}

impl Orchestrator {
    /// Rebuild topic indices and statistics for the whole store under
    /// `output_root`. `source_name` only labels the operation; aggregation
    /// always covers every source.
    #[instrument(skip_all, fields(root = %output_root.display(), source = source_name.unwrap_or("*")))]
    pub async fn rebuild(
        &self,
        output_root: &Path,
        source_name: Option<&str>,
        progress: &dyn ProgressReporter,
    ) -> Result<RebuildResult> {
        let start = Instant::now();
        if !output_root.is_dir() {
            return Err(KbError::validation(format!(
                "output root {} does not exist",
                output_root.display()
            )));
        }

        let store = KnowledgeStore::new(output_root);
        let _guard = lock_root(output_root).await?;

        progress.phase("Scanning knowledge units");
        let snapshot = store.snapshot()?;
        info!(
            questions = snapshot.questions.len(),
            answers = snapshot.answers.len(),
            notes = snapshot.notes.len(),
            "store scanned"
        );

        progress.phase("Aggregating knowledge base");
        let aggregation = self.agents.aggregator.aggregate(&snapshot, &[]).await?;

        progress.phase("Writing indices");
        let mut staging = StagingRecord::new();
        let summary = match write_indices(store.layout(), &aggregation, &snapshot, &mut staging) {
            Ok(summary) => {
                staging.commit();
                summary
            }
            Err(e) => {
                error!(error = %e, "index write failed, restoring previous indices");
                let undone = staging.rollback();
                return Err(KbError::rolled_back(undone, e));
            }
        };

        let result = RebuildResult {
            units_scanned: snapshot.len(),
            statistics: aggregation.statistics,
            topics_written: summary.topics,
            people_written: summary.people,
            areas_written: summary.areas,
            elapsed: start.elapsed(),
        };
        info!(
            units = result.units_scanned,
            topics = result.topics_written,
            people = result.people_written,
            areas = result.areas_written,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "rebuild complete"
        );
        Ok(result)
    }
}
