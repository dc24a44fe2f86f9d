//! Orchestration and domain logic for kbforge.
//!
//! This crate ties the collaborators together into one transactional run:
//! chunk preparation, per-chunk analysis, merging, unit persistence, answer
//! mapping, aggregation, and the sync cursor update. A failure inside the
//! run window undoes every staged change. [`Orchestrator::rebuild`] recomputes
//! derived indices from the unit files alone, and
//! [`Orchestrator::process_inbox`] batches exports dropped under `inbox/raw/`.

pub mod agents;
pub mod aggregate;
pub mod bridge;
pub mod chunking;
pub mod inbox;
pub mod indices;
pub mod lock;
pub mod mapping;
pub mod merge;
pub mod pipeline;
pub mod rebuild;
pub mod staging;

#[cfg(test)]
mod testing;

pub use agents::{Agents, Aggregator, AnswerMapper, ChunkPreparer, ContentAnalyzer};
pub use aggregate::StructureAggregator;
pub use bridge::{BridgeAgent, BridgeSettings};
pub use chunking::{ParagraphChunker, normalize_input};
pub use inbox::{InboxEntry, InboxOutcome, InboxParams, InboxReport};
pub use indices::IndexSummary;
pub use merge::merge_results;
pub use pipeline::{Orchestrator, ProgressReporter, RunResult, SilentProgress};
pub use rebuild::RebuildResult;
pub use staging::StagingRecord;
