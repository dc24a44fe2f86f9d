//! Collaborator seams consumed by the orchestrator.
//!
//! Every agent call is a fallible, possibly slow operation. The orchestrator
//! never retries; retries belong inside the implementations.

use std::sync::Arc;

use async_trait::async_trait;

use kbforge_shared::{
    Aggregation, AnswerLikeSummary, Chunk, ExtractionResult, Mapping, QuestionSummary, Result,
    StoreSnapshot,
};
use kbforge_store::SyncCursorStore;

/// Splits raw input content into an ordered sequence of chunks.
pub trait ChunkPreparer: Send + Sync {
    /// Chunks must carry contiguous indices starting at 0.
    fn prepare(&self, content: &str) -> Result<Vec<Chunk>>;
}

/// Extracts questions, answers and notes from one chunk.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn analyze(&self, chunk: &Chunk, instructions: &[String]) -> Result<ExtractionResult>;
}

/// Pairs new answers and notes with existing questions.
#[async_trait]
pub trait AnswerMapper: Send + Sync {
    async fn map_answers(
        &self,
        answers: &[AnswerLikeSummary],
        questions: &[QuestionSummary],
        instructions: &[String],
    ) -> Result<Vec<Mapping>>;
}

/// Recomputes topic groupings and statistics over the whole store.
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self, snapshot: &StoreSnapshot, instructions: &[String])
    -> Result<Aggregation>;
}

/// The full set of collaborators one orchestrator drives.
#[derive(Clone)]
pub struct Agents {
    pub preparer: Arc<dyn ChunkPreparer>,
    pub analyzer: Arc<dyn ContentAnalyzer>,
    pub mapper: Arc<dyn AnswerMapper>,
    pub aggregator: Arc<dyn Aggregator>,
    pub cursor: Arc<dyn SyncCursorStore>,
}

impl std::fmt::Debug for Agents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agents").finish_non_exhaustive()
    }
}
