//! Shared types, error model, and configuration for kbforge.
//!
//! This crate is the foundation depended on by all other kbforge crates.
//! It provides:
//! - [`KbError`]: the unified error type
//! - Domain types ([`KnowledgeUnit`], [`UnitId`], [`ExtractionResult`], [`RunParams`])
//! - Configuration ([`AppConfig`], [`PipelineOptions`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BridgeConfig, DefaultsConfig, MappingFailurePolicy, PipelineConfig,
    PipelineOptions, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_api_key,
};
pub use error::{AgentStage, KbError, Result};
pub use types::{
    Aggregation, AnswerLike, AnswerLikeSummary, Chunk, ContributionCounts, Draft,
    ExtractionResult, KnowledgeUnit, Mapping, ProcessingMode, QuestionSummary, RunParams,
    StageInstructions, Statistics, StoreSnapshot, TopicGroup, UnitId, UnitKind,
};
