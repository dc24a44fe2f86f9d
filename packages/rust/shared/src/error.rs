//! Error types for kbforge.
//!
//! Library crates use [`KbError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// The pipeline stage an external collaborator was serving when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStage {
    Prepare,
    Analyze,
    Map,
    Aggregate,
    Cursor,
}

impl std::fmt::Display for AgentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Prepare => "chunk preparation",
            Self::Analyze => "content analysis",
            Self::Map => "answer mapping",
            Self::Aggregate => "aggregation",
            Self::Cursor => "sync cursor update",
        };
        f.write_str(name)
    }
}

/// Top-level error type for all kbforge operations.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed run parameters or unusable input. Raised before any staging.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Header, JSON, or identifier parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// An external collaborator (preparer, agent, cursor store) failed.
    #[error("{stage} failed: {message}")]
    Agent { stage: AgentStage, message: String },

    /// Knowledge store or cursor store error.
    #[error("store error: {0}")]
    Store(String),

    /// A store invariant was violated (e.g. an allocated id already exists on disk).
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The run failed inside its transactional window and every staged change was undone.
    #[error("processing failed and was rolled back ({undone} staged changes undone): {source}")]
    RolledBack {
        undone: usize,
        #[source]
        source: Box<KbError>,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, KbError>;

impl KbError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a collaborator error for the given stage.
    pub fn agent(stage: AgentStage, msg: impl Into<String>) -> Self {
        Self::Agent {
            stage,
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a root cause after a completed rollback.
    pub fn rolled_back(undone: usize, source: KbError) -> Self {
        Self::RolledBack {
            undone,
            source: Box::new(source),
        }
    }

    /// The root cause, looking through any rollback wrapper.
    pub fn root_cause(&self) -> &KbError {
        match self {
            Self::RolledBack { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
