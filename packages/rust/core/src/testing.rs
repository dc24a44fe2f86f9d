//! In-process fake collaborators for orchestrator tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use kbforge_shared::{
    AgentStage, Aggregation, AnswerLikeSummary, Chunk, Draft, ExtractionResult, KbError, Mapping,
    PipelineOptions, QuestionSummary, Result, RunParams, StoreSnapshot,
};
use kbforge_store::SyncCursorStore;

use crate::aggregate::StructureAggregator;
use crate::agents::{Agents, Aggregator, AnswerMapper, ChunkPreparer, ContentAnalyzer};
use crate::chunking::ParagraphChunker;
use crate::pipeline::Orchestrator;

pub fn draft(author: &str, text: &str, area: Option<&str>, topics: &[&str]) -> Draft {
    Draft {
        author: author.into(),
        text: text.into(),
        area: area.map(String::from),
        topics: topics.iter().map(|t| t.to_string()).collect(),
        date: None,
    }
}

/// Splits content on `---` lines so tests control the chunk count.
pub struct MarkerPreparer;

impl ChunkPreparer for MarkerPreparer {
    fn prepare(&self, content: &str) -> Result<Vec<Chunk>> {
        Ok(content
            .split("\n---\n")
            .enumerate()
            .map(|(index, text)| Chunk {
                text: text.trim().to_string(),
                origin: None,
                index,
            })
            .collect())
    }
}

pub struct FailingPreparer;

impl ChunkPreparer for FailingPreparer {
    fn prepare(&self, _content: &str) -> Result<Vec<Chunk>> {
        Err(KbError::agent(AgentStage::Prepare, "preparer unavailable"))
    }
}

/// Returns a fixed result per chunk index, optionally delayed or failing.
#[derive(Default)]
pub struct ScriptedAnalyzer {
    pub results: Vec<ExtractionResult>,
    pub delays_ms: Vec<u64>,
    pub fail_on: Option<usize>,
    pub calls: AtomicUsize,
    pub completion_order: Mutex<Vec<usize>>,
}

impl ScriptedAnalyzer {
    pub fn returning(results: Vec<ExtractionResult>) -> Self {
        Self {
            results,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContentAnalyzer for ScriptedAnalyzer {
    async fn analyze(&self, chunk: &Chunk, _instructions: &[String]) -> Result<ExtractionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ms) = self.delays_ms.get(chunk.index) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if self.fail_on == Some(chunk.index) {
            return Err(KbError::agent(
                AgentStage::Analyze,
                format!("agent exploded on chunk {}", chunk.index),
            ));
        }
        if let Ok(mut order) = self.completion_order.lock() {
            order.push(chunk.index);
        }
        Ok(self.results.get(chunk.index).cloned().unwrap_or_default())
    }
}

/// Records what it was asked and answers with canned mappings.
#[derive(Default)]
pub struct FakeMapper {
    pub mappings: Vec<Mapping>,
    pub fail: bool,
    pub calls: AtomicUsize,
    pub last_request: Mutex<Option<(Vec<AnswerLikeSummary>, Vec<QuestionSummary>)>>,
}

#[async_trait]
impl AnswerMapper for FakeMapper {
    async fn map_answers(
        &self,
        answers: &[AnswerLikeSummary],
        questions: &[QuestionSummary],
        _instructions: &[String],
    ) -> Result<Vec<Mapping>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some((answers.to_vec(), questions.to_vec()));
        }
        if self.fail {
            return Err(KbError::agent(AgentStage::Map, "mapping model timed out"));
        }
        Ok(self.mappings.clone())
    }
}

/// Mechanical aggregation with a call counter and an optional failure.
#[derive(Default)]
pub struct CountingAggregator {
    pub fail: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Aggregator for CountingAggregator {
    async fn aggregate(&self, snapshot: &StoreSnapshot, instructions: &[String]) -> Result<Aggregation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(KbError::agent(AgentStage::Aggregate, "aggregation agent crashed"));
        }
        StructureAggregator.aggregate(snapshot, instructions).await
    }
}

#[derive(Default)]
pub struct RecordingCursor {
    pub fail: bool,
    pub updates: Mutex<Vec<(String, String)>>,
}

impl RecordingCursor {
    pub fn updates(&self) -> Vec<(String, String)> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SyncCursorStore for RecordingCursor {
    async fn last_sync(&self, source: &str) -> Result<Option<String>> {
        Ok(self
            .updates()
            .into_iter()
            .rev()
            .find(|(s, _)| s == source)
            .map(|(_, ts)| ts))
    }

    async fn update_last_sync(&self, source: &str, timestamp: &str) -> Result<()> {
        if self.fail {
            return Err(KbError::Store("cursor file is read-only".into()));
        }
        if let Ok(mut updates) = self.updates.lock() {
            updates.push((source.to_string(), timestamp.to_string()));
        }
        Ok(())
    }
}

/// A full set of fakes plus handles for inspecting them afterwards.
pub struct Rig {
    pub preparer: Arc<dyn ChunkPreparer>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub mapper: Arc<FakeMapper>,
    pub aggregator: Arc<CountingAggregator>,
    pub cursor: Arc<RecordingCursor>,
    pub options: PipelineOptions,
}

impl Rig {
    pub fn new(analyzer: ScriptedAnalyzer) -> Self {
        Self {
            preparer: Arc::new(ParagraphChunker::new(12_000)),
            analyzer: Arc::new(analyzer),
            mapper: Arc::new(FakeMapper::default()),
            aggregator: Arc::new(CountingAggregator::default()),
            cursor: Arc::new(RecordingCursor::default()),
            options: PipelineOptions::default(),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            Agents {
                preparer: Arc::clone(&self.preparer),
                analyzer: self.analyzer.clone(),
                mapper: self.mapper.clone(),
                aggregator: self.aggregator.clone(),
                cursor: self.cursor.clone(),
            },
            self.options.clone(),
        )
    }
}

/// A fresh output root and an input file inside its own temp directory.
pub struct Workspace {
    pub base: PathBuf,
    pub root: PathBuf,
    pub input: PathBuf,
}

impl Workspace {
    pub fn new(input_content: &str) -> Self {
        let base = std::env::temp_dir().join(format!("kbf-run-{}", uuid::Uuid::now_v7()));
        let root = base.join("kb");
        std::fs::create_dir_all(&base).unwrap();
        let input = base.join("slack_export.json");
        std::fs::write(&input, input_content).unwrap();
        Self { base, root, input }
    }

    pub fn params(&self, source: &str) -> RunParams {
        RunParams::new(source, &self.input, "2024-06-01T12:00:00Z", &self.root)
    }

    pub fn files_in(&self, rel: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.root.join(rel))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.base);
    }
}
