//! Core domain types for kbforge knowledge bases.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{KbError, Result};

// ---------------------------------------------------------------------------
// UnitKind / UnitId
// ---------------------------------------------------------------------------

/// The three kinds of knowledge unit, each stored in its own directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Question,
    Answer,
    Note,
}

impl UnitKind {
    /// Every kind, in allocation order.
    pub const ALL: [UnitKind; 3] = [Self::Question, Self::Answer, Self::Note];

    /// Filename prefix (without the trailing underscore).
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Question => "q",
            Self::Answer => "a",
            Self::Note => "n",
        }
    }

    /// Directory name under the output root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Question => "questions",
            Self::Answer => "answers",
            Self::Note => "notes",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "q" => Some(Self::Question),
            "a" => Some(Self::Answer),
            "n" => Some(Self::Note),
            _ => None,
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Question => "question",
            Self::Answer => "answer",
            Self::Note => "note",
        })
    }
}

/// Minimum number of digits in a rendered sequence number.
const ID_MIN_DIGITS: usize = 4;

/// Store-wide identifier of a knowledge unit, e.g. `q_0001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitId {
    pub kind: UnitKind,
    pub seq: u32,
}

impl UnitId {
    pub fn new(kind: UnitKind, seq: u32) -> Self {
        Self { kind, seq }
    }

    /// File name of the unit inside its kind directory.
    pub fn file_name(&self) -> String {
        format!("{self}.md")
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{:0width$}", self.kind.prefix(), self.seq, width = ID_MIN_DIGITS)
    }
}

impl std::str::FromStr for UnitId {
    type Err = KbError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (prefix, digits) = s
            .split_once('_')
            .ok_or_else(|| KbError::parse(format!("invalid unit id '{s}'")))?;
        let kind = UnitKind::from_prefix(prefix)
            .ok_or_else(|| KbError::parse(format!("unknown unit prefix in '{s}'")))?;
        if digits.len() < ID_MIN_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KbError::parse(format!("invalid sequence in unit id '{s}'")));
        }
        let seq = digits
            .parse::<u32>()
            .map_err(|e| KbError::parse(format!("unit id '{s}': {e}")))?;
        Ok(Self { kind, seq })
    }
}

impl TryFrom<String> for UnitId {
    type Error = KbError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnitId> for String {
    fn from(id: UnitId) -> Self {
        id.to_string()
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// A contiguous slice of input content with a stable ordinal index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// Opaque provenance supplied by the preparer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<serde_json::Value>,
    pub index: usize,
}

/// An extracted item before it has a store-wide id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub author: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// Structured output of analyzing one chunk (or the merge of several).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub questions: Vec<Draft>,
    #[serde(default)]
    pub answers: Vec<Draft>,
    #[serde(default)]
    pub notes: Vec<Draft>,
}

impl ExtractionResult {
    pub fn total(&self) -> usize {
        self.questions.len() + self.answers.len() + self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Drafts of the given kind, in extraction order.
    pub fn drafts(&self, kind: UnitKind) -> &[Draft] {
        match kind {
            UnitKind::Question => &self.questions,
            UnitKind::Answer => &self.answers,
            UnitKind::Note => &self.notes,
        }
    }
}

// ---------------------------------------------------------------------------
// KnowledgeUnit
// ---------------------------------------------------------------------------

/// A question, answer, or note persisted as one file.
///
/// `answered` and `answered_by` only carry meaning for questions and are
/// only written to question headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeUnit {
    pub id: UnitId,
    pub source: String,
    pub author: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default)]
    pub answered: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answered_by: Vec<UnitId>,
}

impl KnowledgeUnit {
    /// Materialize a draft under a freshly allocated id. Questions start unanswered.
    pub fn from_draft(id: UnitId, source: &str, draft: &Draft) -> Self {
        Self {
            id,
            source: source.to_string(),
            author: draft.author.clone(),
            text: draft.text.clone(),
            area: draft.area.clone(),
            topics: draft.topics.iter().cloned().collect(),
            date: draft.date.clone(),
            answered: false,
            answered_by: Vec::new(),
        }
    }

    pub fn kind(&self) -> UnitKind {
        self.id.kind
    }

    /// Lightweight projection handed to the QA-mapping agent.
    pub fn question_summary(&self) -> QuestionSummary {
        QuestionSummary {
            id: self.id,
            author: self.author.clone(),
            text: self.text.clone(),
            area: self.area.clone(),
            answered: self.answered,
        }
    }
}

/// Answers and notes both feed QA mapping through the same projection.
#[derive(Debug, Clone, Copy)]
pub enum AnswerLike<'a> {
    Answer(&'a KnowledgeUnit),
    Note(&'a KnowledgeUnit),
}

impl<'a> AnswerLike<'a> {
    /// `None` for questions.
    pub fn from_unit(unit: &'a KnowledgeUnit) -> Option<Self> {
        match unit.kind() {
            UnitKind::Answer => Some(Self::Answer(unit)),
            UnitKind::Note => Some(Self::Note(unit)),
            UnitKind::Question => None,
        }
    }

    pub fn unit(&self) -> &'a KnowledgeUnit {
        match self {
            Self::Answer(unit) | Self::Note(unit) => unit,
        }
    }

    pub fn summary(&self) -> AnswerLikeSummary {
        let unit = self.unit();
        AnswerLikeSummary {
            id: unit.id,
            kind: unit.kind(),
            author: unit.author.clone(),
            text: unit.text.clone(),
            area: unit.area.clone(),
            topics: unit.topics.iter().cloned().collect(),
        }
    }
}

/// Answer-like projection sent to the QA-mapping agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerLikeSummary {
    pub id: UnitId,
    pub kind: UnitKind,
    pub author: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Question projection sent to the QA-mapping agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionSummary {
    pub id: UnitId,
    pub author: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    pub answered: bool,
}

/// A confidence-scored pairing returned by the QA-mapping agent. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub answer_id: String,
    pub question_id: String,
    pub confidence: f64,
}

/// Every unit currently on disk, grouped by kind.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub questions: Vec<KnowledgeUnit>,
    pub answers: Vec<KnowledgeUnit>,
    pub notes: Vec<KnowledgeUnit>,
}

impl StoreSnapshot {
    pub fn len(&self) -> usize {
        self.questions.len() + self.answers.len() + self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn units(&self) -> impl Iterator<Item = &KnowledgeUnit> {
        self.questions
            .iter()
            .chain(self.answers.iter())
            .chain(self.notes.iter())
    }
}

// ---------------------------------------------------------------------------
// Aggregation output
// ---------------------------------------------------------------------------

/// Per-contributor counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionCounts {
    pub questions: usize,
    pub answers: usize,
    pub notes: usize,
}

impl ContributionCounts {
    pub fn total(&self) -> usize {
        self.questions + self.answers + self.notes
    }
}

/// Store-wide statistics recomputed by aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub questions: usize,
    pub answers: usize,
    pub notes: usize,
    pub answered_questions: usize,
    pub unanswered_questions: usize,
    #[serde(default)]
    pub contributors: BTreeMap<String, ContributionCounts>,
    #[serde(default)]
    pub areas: BTreeMap<String, usize>,
    #[serde(default)]
    pub topics: BTreeMap<String, usize>,
    #[serde(default)]
    pub sources: BTreeMap<String, usize>,
    /// Contributions per day (`YYYY-MM-DD`), for units that carry a date.
    #[serde(default)]
    pub activity: BTreeMap<String, usize>,
}

/// Units grouped under one topic (or area, for units without topics).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicGroup {
    pub name: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub questions: Vec<UnitId>,
    #[serde(default)]
    pub answers: Vec<UnitId>,
    #[serde(default)]
    pub notes: Vec<UnitId>,
}

impl TopicGroup {
    pub fn total(&self) -> usize {
        self.questions.len() + self.answers.len() + self.notes.len()
    }
}

/// Derived indices produced by the aggregation stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub statistics: Statistics,
    #[serde(default)]
    pub topics: Vec<TopicGroup>,
}

// ---------------------------------------------------------------------------
// Run parameters
// ---------------------------------------------------------------------------

/// Whether a run re-aggregates the whole store after writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Full,
    ProcessOnly,
}

/// Extra instructions forwarded to each agent stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageInstructions {
    #[serde(default)]
    pub analysis: Vec<String>,
    #[serde(default)]
    pub mapping: Vec<String>,
    #[serde(default)]
    pub aggregation: Vec<String>,
}

/// Immutable input to one orchestration run.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub source_name: String,
    pub input_file: PathBuf,
    pub sync_timestamp: String,
    pub output_root: PathBuf,
    pub clean_output: bool,
    pub clean_source_before_processing: bool,
    pub processing_mode: ProcessingMode,
    pub instructions: StageInstructions,
}

impl RunParams {
    /// Parameters with no cleanup, FULL mode, and no extra instructions.
    pub fn new(
        source_name: impl Into<String>,
        input_file: impl Into<PathBuf>,
        sync_timestamp: impl Into<String>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            input_file: input_file.into(),
            sync_timestamp: sync_timestamp.into(),
            output_root: output_root.into(),
            clean_output: false,
            clean_source_before_processing: false,
            processing_mode: ProcessingMode::Full,
            instructions: StageInstructions::default(),
        }
    }

    /// Reject parameters that cannot be processed. Runs before any side effect.
    pub fn validate(&self) -> Result<()> {
        let name = self.source_name.trim();
        if name.is_empty() {
            return Err(KbError::validation("source name must not be empty"));
        }
        // The source name becomes a directory under inbox/analyzed/.
        if name == "."
            || name == ".."
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(KbError::validation(format!(
                "source name '{}' may only contain letters, digits, '_', '-' and '.'",
                self.source_name
            )));
        }
        if self.sync_timestamp.trim().is_empty() {
            return Err(KbError::validation("sync timestamp must not be empty"));
        }
        if !self.input_file.is_file() {
            return Err(KbError::validation(format!(
                "input file {} does not exist or is not a regular file",
                self.input_file.display()
            )));
        }
        Ok(())
    }
}
