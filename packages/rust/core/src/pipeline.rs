//! End-to-end ingestion run: input → chunks → analysis → merge → units →
//! mapping → aggregation → sync cursor.
//!
//! Cleanup requested through [`RunParams`] happens before staging begins and
//! is never undone. From the raw input copy onwards every side effect is
//! recorded in a [`StagingRecord`]; any failure up to and including the cursor
//! update rolls all of them back and surfaces [`KbError::RolledBack`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use kbforge_shared::{
    AgentStage, Chunk, ExtractionResult, KbError, KnowledgeUnit, MappingFailurePolicy,
    PipelineOptions, ProcessingMode, Result, RunParams, Statistics, UnitId, UnitKind,
};
use kbforge_store::KnowledgeStore;

use crate::agents::Agents;
use crate::chunking::normalize_input;
use crate::indices::write_indices;
use crate::lock::{RootGuard, lock_root};
use crate::mapping;
use crate::merge::merge_results;
use crate::staging::StagingRecord;

/// Result of a successful [`Orchestrator::run`].
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub source_name: String,
    pub chunk_count: usize,
    pub questions_created: usize,
    pub answers_created: usize,
    pub notes_created: usize,
    /// Mappings that marked a question answered or added a back-reference.
    pub mappings_applied: usize,
    /// Present in FULL mode only.
    pub statistics: Option<Statistics>,
    pub raw_copy: PathBuf,
    pub analyzed_snapshot: PathBuf,
    pub elapsed: Duration,
}

impl RunResult {
    pub fn units_created(&self) -> usize {
        self.questions_created + self.answers_created + self.notes_created
    }
}

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as each chunk's analysis is collected, in chunk order.
    fn chunk_analyzed(&self, index: usize, completed: usize, total: usize);
    /// Called when the run completes successfully.
    fn done(&self, result: &RunResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn chunk_analyzed(&self, _index: usize, _completed: usize, _total: usize) {}
    fn done(&self, _result: &RunResult) {}
}

/// Pretty-printed contents of `inbox/analyzed/<source>/<stamp>_analyzed.json`.
#[derive(Serialize)]
struct AnalyzedSnapshot<'a> {
    run_id: Uuid,
    source: &'a str,
    sync_timestamp: &'a str,
    chunk_count: usize,
    input_sha256: &'a str,
    #[serde(flatten)]
    result: &'a ExtractionResult,
}

/// Drives the collaborators through one transactional run.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    pub(crate) agents: Agents,
    pub(crate) options: PipelineOptions,
}

impl Orchestrator {
    pub fn new(agents: Agents, options: PipelineOptions) -> Self {
        Self { agents, options }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run the full ingestion pipeline for one input file.
    ///
    /// Returns either a populated [`RunResult`] or exactly one error. Errors
    /// raised after staging began are wrapped in [`KbError::RolledBack`].
    #[instrument(skip_all, fields(run_id = tracing::field::Empty, source = %params.source_name))]
    pub async fn run(&self, params: &RunParams, progress: &dyn ProgressReporter) -> Result<RunResult> {
        let start = Instant::now();
        let run_id = Uuid::now_v7();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        params.validate()?;
        info!(
            input = %params.input_file.display(),
            root = %params.output_root.display(),
            mode = ?params.processing_mode,
            "starting run"
        );

        progress.phase("Preparing output directory");
        let store = KnowledgeStore::new(&params.output_root);
        store.ensure_layout(&params.source_name)?;

        if params.clean_output {
            progress.phase("Cleaning output");
            store.clean_all()?;
        } else if params.clean_source_before_processing {
            progress.phase("Cleaning previous source units");
            store.clean_source(&params.source_name)?;
        }

        let mut staging = StagingRecord::new();
        // Held from id allocation until commit or rollback has finished.
        let mut root_guard: Option<RootGuard> = None;

        let outcome = self
            .run_staged(run_id, start, params, &store, &mut staging, &mut root_guard, progress)
            .await;

        match outcome {
            Ok(result) => {
                let committed = staging.commit();
                drop(root_guard);
                info!(
                    committed,
                    questions = result.questions_created,
                    answers = result.answers_created,
                    notes = result.notes_created,
                    mappings = result.mappings_applied,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "run complete"
                );
                progress.done(&result);
                Ok(result)
            }
            Err(cause) => {
                error!(error = %cause, staged = staging.len(), "run failed, rolling back");
                let undone = staging.rollback();
                drop(root_guard);
                Err(KbError::rolled_back(undone, cause))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_staged(
        &self,
        run_id: Uuid,
        start: Instant,
        params: &RunParams,
        store: &KnowledgeStore,
        staging: &mut StagingRecord,
        root_guard: &mut Option<RootGuard>,
        progress: &dyn ProgressReporter,
    ) -> Result<RunResult> {
        let layout = store.layout();
        let stamp = run_stamp(run_id);

        // --- Raw input copy ---
        progress.phase("Copying input");
        let raw_copy = layout.inbox_raw().join(format!("{stamp}_{}", input_file_name(params)));
        std::fs::copy(&params.input_file, &raw_copy).map_err(|e| KbError::io(&raw_copy, e))?;
        staging.created(&raw_copy);

        // --- Chunk preparation ---
        progress.phase("Preparing chunks");
        let bytes = std::fs::read(&params.input_file).map_err(|e| KbError::io(&params.input_file, e))?;
        let input_sha256 = format!("{:x}", Sha256::digest(&bytes));
        let content = normalize_input(&String::from_utf8_lossy(&bytes));
        let mut chunks = self.agents.preparer.prepare(&content)?;
        chunks.sort_by_key(|c| c.index);
        info!(chunks = chunks.len(), "input prepared");

        // --- Analysis ---
        progress.phase("Analyzing content");
        let chunk_count = chunks.len();
        let results = self
            .analyze_chunks(chunks, &params.instructions.analysis, progress)
            .await?;
        let merged = merge_results(results);
        info!(
            questions = merged.questions.len(),
            answers = merged.answers.len(),
            notes = merged.notes.len(),
            "analysis merged"
        );

        // --- Analyzed snapshot ---
        let analyzed_snapshot = layout
            .inbox_analyzed(&params.source_name)
            .join(format!("{stamp}_analyzed.json"));
        let snapshot_json = serde_json::to_string_pretty(&AnalyzedSnapshot {
            run_id,
            source: &params.source_name,
            sync_timestamp: &params.sync_timestamp,
            chunk_count,
            input_sha256: &input_sha256,
            result: &merged,
        })
        .map_err(|e| KbError::Store(format!("analyzed snapshot serialization failed: {e}")))?;
        std::fs::write(&analyzed_snapshot, snapshot_json)
            .map_err(|e| KbError::io(&analyzed_snapshot, e))?;
        staging.created(&analyzed_snapshot);

        // --- Id allocation and unit writes (under the root lock) ---
        progress.phase("Waiting for output root");
        *root_guard = Some(lock_root(layout.root()).await?);

        progress.phase("Writing knowledge units");
        let new_units = self.write_units(store, &params.source_name, &merged, staging)?;

        // --- Answer mapping ---
        progress.phase("Mapping answers to questions");
        let mappings_applied = self
            .map_answers(store, &new_units, &params.instructions.mapping, staging)
            .await?;

        // --- Aggregation ---
        let statistics = match params.processing_mode {
            ProcessingMode::Full => {
                progress.phase("Aggregating knowledge base");
                let snapshot = store.snapshot()?;
                let aggregation = self
                    .agents
                    .aggregator
                    .aggregate(&snapshot, &params.instructions.aggregation)
                    .await?;
                write_indices(layout, &aggregation, &snapshot, staging)?;
                Some(aggregation.statistics)
            }
            ProcessingMode::ProcessOnly => {
                debug!("process-only mode, skipping aggregation");
                None
            }
        };

        // --- Sync cursor ---
        progress.phase("Recording sync cursor");
        self.agents
            .cursor
            .update_last_sync(&params.source_name, &params.sync_timestamp)
            .await
            .map_err(|e| match e {
                KbError::Agent { .. } => e,
                other => KbError::agent(AgentStage::Cursor, other.to_string()),
            })?;

        let count = |kind: UnitKind| new_units.iter().filter(|u| u.kind() == kind).count();
        Ok(RunResult {
            run_id,
            source_name: params.source_name.clone(),
            chunk_count,
            questions_created: count(UnitKind::Question),
            answers_created: count(UnitKind::Answer),
            notes_created: count(UnitKind::Note),
            mappings_applied,
            statistics,
            raw_copy,
            analyzed_snapshot,
            elapsed: start.elapsed(),
        })
    }

    /// Analyze every chunk with bounded parallelism, collecting results in
    /// chunk order regardless of completion order.
    async fn analyze_chunks(
        &self,
        chunks: Vec<Chunk>,
        instructions: &[String],
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<ExtractionResult>> {
        let semaphore = Arc::new(Semaphore::new(self.options.analysis_concurrency.max(1)));
        let instructions: Arc<[String]> = Arc::from(instructions);

        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                let sem = Arc::clone(&semaphore);
                let analyzer = Arc::clone(&self.agents.analyzer);
                let instructions = Arc::clone(&instructions);
                tokio::spawn(async move {
                    let _permit = sem.acquire_owned().await.map_err(|e| {
                        KbError::agent(AgentStage::Analyze, format!("analysis pool closed: {e}"))
                    })?;
                    debug!(index = chunk.index, chars = chunk.text.chars().count(), "analyzing chunk");
                    analyzer
                        .analyze(&chunk, &instructions)
                        .await
                        .map(|result| (chunk.index, result))
                })
            })
            .collect();

        let total = handles.len();
        let mut results = Vec::with_capacity(total);
        let mut pending = handles.into_iter();

        while let Some(handle) = pending.next() {
            let joined = handle.await.map_err(|e| {
                KbError::agent(AgentStage::Analyze, format!("analysis task failed: {e}"))
            });
            match joined.and_then(|r| r) {
                Ok((index, result)) => {
                    progress.chunk_analyzed(index, results.len() + 1, total);
                    results.push(result);
                }
                Err(e) => {
                    pending.for_each(|h| h.abort());
                    return Err(e);
                }
            }
        }

        Ok(results)
    }

    /// Allocate ids from the current on-disk maximum and write one file per draft.
    fn write_units(
        &self,
        store: &KnowledgeStore,
        source: &str,
        merged: &ExtractionResult,
        staging: &mut StagingRecord,
    ) -> Result<Vec<KnowledgeUnit>> {
        let mut units = Vec::with_capacity(merged.total());

        for kind in UnitKind::ALL {
            let drafts = merged.drafts(kind);
            if drafts.is_empty() {
                continue;
            }
            let first = store.next_id(kind)?;
            debug!(%kind, first = %first, count = drafts.len(), "allocating ids");

            for (offset, draft) in drafts.iter().enumerate() {
                let seq = u32::try_from(offset)
                    .ok()
                    .and_then(|o| first.seq.checked_add(o))
                    .ok_or_else(|| KbError::Invariant(format!("{kind} sequence exhausted")))?;
                let unit = KnowledgeUnit::from_draft(UnitId::new(kind, seq), source, draft);
                let path = store.write_unit(&unit)?;
                staging.created(path);
                units.push(unit);
            }
        }

        Ok(units)
    }

    /// Map this run's answers and notes onto questions and rewrite the
    /// questions that changed. Agent failure follows the configured policy.
    async fn map_answers(
        &self,
        store: &KnowledgeStore,
        new_units: &[KnowledgeUnit],
        instructions: &[String],
        staging: &mut StagingRecord,
    ) -> Result<usize> {
        let questions = store.scan_all(UnitKind::Question)?;
        let Some(request) = mapping::build_request(new_units, &questions) else {
            return Ok(0);
        };
        info!(
            answers = request.answers.len(),
            questions = request.questions.len(),
            "running answer mapping"
        );

        let mappings = match self
            .agents
            .mapper
            .map_answers(&request.answers, &request.questions, instructions)
            .await
        {
            Ok(mappings) => mappings,
            Err(e) => match self.options.mapping_failure {
                MappingFailurePolicy::Skip => {
                    warn!(error = %e, "answer mapping failed, continuing without mappings");
                    return Ok(0);
                }
                MappingFailurePolicy::Abort => return Err(e),
            },
        };

        let outcome = mapping::apply_mappings(
            &mappings,
            &request,
            &questions,
            self.options.acceptance_threshold,
        );
        for question in &outcome.updated {
            let original = store.rewrite_unit(question)?;
            staging.rewritten(store.unit_path(question.id), original);
        }
        Ok(outcome.applied)
    }
}

/// Run-unique file prefix: UTC time plus the random tail of the run id.
fn run_stamp(run_id: Uuid) -> String {
    let id = run_id.simple().to_string();
    let tail = &id[id.len().saturating_sub(8)..];
    format!("{}_{tail}", Utc::now().format("%Y%m%dT%H%M%S%3fZ"))
}

fn input_file_name(params: &RunParams) -> String {
    params
        .input_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}

#[cfg(test)]
mod tests;
