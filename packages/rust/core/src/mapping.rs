//! Answer-to-question mapping: candidate selection and mapping application.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use kbforge_shared::{AnswerLike, AnswerLikeSummary, KnowledgeUnit, Mapping, QuestionSummary, UnitId};

/// Input for one QA-mapping call.
#[derive(Debug, Clone, Default)]
pub struct MappingRequest {
    pub answers: Vec<AnswerLikeSummary>,
    pub questions: Vec<QuestionSummary>,
}

/// Build the mapping request for the answers and notes created by a run.
///
/// Questions are kept when their area equals one of the new items' areas or
/// contains one of their topics. Unanswered questions come first. Returns
/// `None` when there is nothing to map.
pub fn build_request(new_units: &[KnowledgeUnit], questions: &[KnowledgeUnit]) -> Option<MappingRequest> {
    let answer_like: Vec<AnswerLike<'_>> = new_units.iter().filter_map(AnswerLike::from_unit).collect();
    if answer_like.is_empty() {
        debug!("no new answers or notes to map");
        return None;
    }

    let areas: BTreeSet<&str> = answer_like
        .iter()
        .filter_map(|item| item.unit().area.as_deref())
        .collect();
    let topics: BTreeSet<&str> = answer_like
        .iter()
        .flat_map(|item| item.unit().topics.iter().map(String::as_str))
        .collect();

    let mut candidates: Vec<&KnowledgeUnit> = questions
        .iter()
        .filter(|q| {
            q.area.as_deref().is_some_and(|area| {
                areas.contains(area) || topics.iter().any(|topic| area.contains(topic))
            })
        })
        .collect();
    if candidates.is_empty() {
        debug!(answer_like = answer_like.len(), "no relevant questions for mapping");
        return None;
    }
    // Stable: unanswered first, id order within each group.
    candidates.sort_by_key(|q| (q.answered, q.id));

    Some(MappingRequest {
        answers: answer_like.iter().map(AnswerLike::summary).collect(),
        questions: candidates.iter().map(|q| q.question_summary()).collect(),
    })
}

/// Questions changed by applying accepted mappings.
#[derive(Debug, Default)]
pub struct MappingOutcome {
    /// Mappings that changed a question.
    pub applied: usize,
    /// Updated questions, in id order.
    pub updated: Vec<KnowledgeUnit>,
}

/// Apply mappings at or above `threshold` to the candidate questions.
///
/// A question becomes answered the first time an accepted mapping targets
/// it; later mappings only add back-references. Mappings naming ids outside
/// the request are ignored.
pub fn apply_mappings(
    mappings: &[Mapping],
    request: &MappingRequest,
    questions: &[KnowledgeUnit],
    threshold: f64,
) -> MappingOutcome {
    let answer_ids: HashSet<UnitId> = request.answers.iter().map(|a| a.id).collect();
    let candidate_ids: HashSet<UnitId> = request.questions.iter().map(|q| q.id).collect();
    let mut updated: HashMap<UnitId, KnowledgeUnit> = HashMap::new();
    let mut applied = 0;

    for mapping in mappings {
        if mapping.confidence.is_nan() || mapping.confidence < threshold {
            debug!(
                answer = %mapping.answer_id,
                question = %mapping.question_id,
                confidence = mapping.confidence,
                "skipping low-confidence mapping"
            );
            continue;
        }
        let (Ok(answer_id), Ok(question_id)) = (
            mapping.answer_id.parse::<UnitId>(),
            mapping.question_id.parse::<UnitId>(),
        ) else {
            debug!(?mapping, "skipping mapping with malformed ids");
            continue;
        };
        if !answer_ids.contains(&answer_id) || !candidate_ids.contains(&question_id) {
            debug!(%answer_id, %question_id, "skipping mapping to unknown unit");
            continue;
        }
        let Some(original) = questions.iter().find(|q| q.id == question_id) else {
            continue;
        };

        let question = updated.entry(question_id).or_insert_with(|| original.clone());
        if question.answered_by.contains(&answer_id) {
            continue;
        }
        question.answered = true;
        question.answered_by.push(answer_id);
        applied += 1;
        info!(%answer_id, %question_id, confidence = mapping.confidence, "mapping applied");
    }

    let mut updated: Vec<KnowledgeUnit> = updated.into_values().collect();
    updated.sort_by_key(|q| q.id);
    MappingOutcome { applied, updated }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbforge_shared::{Draft, UnitKind};

    fn unit(kind: UnitKind, seq: u32, area: Option<&str>, topics: &[&str]) -> KnowledgeUnit {
        let draft = Draft {
            author: "A".into(),
            text: format!("{kind} {seq}"),
            area: area.map(String::from),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            date: None,
        };
        KnowledgeUnit::from_draft(UnitId::new(kind, seq), "s", &draft)
    }

    fn mapping(answer: &str, question: &str, confidence: f64) -> Mapping {
        Mapping {
            answer_id: answer.into(),
            question_id: question.into(),
            confidence,
        }
    }

    #[test]
    fn request_filters_by_area_and_topic() {
        let new_units = vec![
            unit(UnitKind::Answer, 1, Some("backend"), &["auth"]),
            unit(UnitKind::Question, 9, Some("backend"), &[]),
        ];
        let mut answered = unit(UnitKind::Question, 1, Some("backend"), &[]);
        answered.answered = true;
        let questions = vec![
            answered,
            unit(UnitKind::Question, 2, Some("frontend"), &[]),
            unit(UnitKind::Question, 3, Some("auth-service"), &[]),
            unit(UnitKind::Question, 4, None, &[]),
            unit(UnitKind::Question, 9, Some("backend"), &[]),
        ];

        let request = build_request(&new_units, &questions).expect("candidates exist");
        let ids: Vec<String> = request.questions.iter().map(|q| q.id.to_string()).collect();
        assert_eq!(ids, vec!["q_0003", "q_0009", "q_0001"]);
        assert_eq!(request.answers.len(), 1);
        assert_eq!(request.answers[0].kind, UnitKind::Answer);
    }

    #[test]
    fn request_is_none_without_answer_like_items_or_candidates() {
        let questions = vec![unit(UnitKind::Question, 1, Some("x"), &[])];
        let only_questions = vec![unit(UnitKind::Question, 2, Some("x"), &[])];
        assert!(build_request(&only_questions, &questions).is_none());

        let unrelated = vec![unit(UnitKind::Note, 1, Some("y"), &["z"])];
        assert!(build_request(&unrelated, &questions).is_none());
    }

    #[test]
    fn applies_only_accepted_known_mappings() {
        let answers = vec![
            unit(UnitKind::Answer, 1, Some("x"), &[]),
            unit(UnitKind::Note, 1, Some("x"), &[]),
        ];
        let questions = vec![
            unit(UnitKind::Question, 1, Some("x"), &[]),
            unit(UnitKind::Question, 2, Some("x"), &[]),
        ];
        let request = build_request(&answers, &questions).unwrap();

        let outcome = apply_mappings(
            &[
                mapping("a_0001", "q_0001", 0.9),
                mapping("n_0001", "q_0001", 0.6),
                mapping("a_0001", "q_0002", 0.59),
                mapping("a_0099", "q_0002", 0.99),
                mapping("a_0001", "q_0077", 0.99),
                mapping("garbage", "q_0002", 1.0),
                mapping("a_0001", "q_0001", 0.95),
                mapping("a_0001", "q_0002", f64::NAN),
            ],
            &request,
            &questions,
            0.6,
        );

        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.updated.len(), 1);
        let q = &outcome.updated[0];
        assert!(q.answered);
        assert_eq!(
            q.answered_by,
            vec![UnitId::new(UnitKind::Answer, 1), UnitId::new(UnitKind::Note, 1)]
        );
    }
}
