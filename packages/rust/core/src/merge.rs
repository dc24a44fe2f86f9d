//! Result merging across chunks.

use kbforge_shared::ExtractionResult;

/// Concatenate per-chunk results in the order given.
///
/// Callers pass results in chunk-index order. Nothing is deduplicated or
/// reordered, and a single result is returned as-is.
pub fn merge_results(mut results: Vec<ExtractionResult>) -> ExtractionResult {
    if results.len() == 1 {
        return results.pop().unwrap_or_default();
    }

    let mut merged = ExtractionResult::default();
    for result in results {
        merged.questions.extend(result.questions);
        merged.answers.extend(result.answers);
        merged.notes.extend(result.notes);
    }
    merged
}
