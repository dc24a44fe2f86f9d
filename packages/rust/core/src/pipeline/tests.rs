use std::sync::Arc;
use std::sync::atomic::Ordering;

use kbforge_shared::{
    AgentStage, ExtractionResult, KbError, KnowledgeUnit, Mapping, MappingFailurePolicy,
    ProcessingMode, UnitId, UnitKind,
};
use kbforge_store::KnowledgeStore;

use super::*;
use crate::testing::{
    CountingAggregator, FailingPreparer, FakeMapper, MarkerPreparer, RecordingCursor, Rig,
    ScriptedAnalyzer, Workspace, draft,
};

const MESSAGES: &str = r#"{"messages":[{"author":"Test","text":"Test message"}]}"#;

fn questions(texts: &[&str]) -> ExtractionResult {
    ExtractionResult {
        questions: texts.iter().map(|t| draft("Alice", t, None, &[])).collect(),
        ..Default::default()
    }
}

fn write_raw_question(store: &KnowledgeStore, seq: u32, source: &str) {
    let path = store.unit_path(UnitId::new(UnitKind::Question, seq));
    std::fs::write(path, format!("---\nsource: {source}\n---\nOld question")).unwrap();
}

fn assert_rolled_back(err: &KbError, stage: AgentStage) {
    assert!(matches!(err, KbError::RolledBack { .. }), "expected rollback, got {err}");
    assert!(err.to_string().contains("rolled back"));
    match err.root_cause() {
        KbError::Agent { stage: got, .. } => assert_eq!(*got, stage),
        other => panic!("unexpected root cause: {other}"),
    }
}

#[tokio::test]
async fn empty_extraction_still_records_cursor() {
    let ws = Workspace::new(MESSAGES);
    let rig = Rig::new(ScriptedAnalyzer::returning(vec![ExtractionResult::default()]));

    let result = rig
        .orchestrator()
        .run(&ws.params("test_source"), &SilentProgress)
        .await
        .expect("run succeeds");

    assert_eq!(result.chunk_count, 1);
    assert_eq!(result.units_created(), 0);
    assert_eq!(rig.analyzer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        rig.cursor.updates(),
        vec![("test_source".to_string(), "2024-06-01T12:00:00Z".to_string())]
    );
    for kind in UnitKind::ALL {
        assert!(ws.files_in(kind.dir_name()).is_empty());
    }
}

#[tokio::test]
async fn success_leaves_one_raw_copy_and_one_snapshot() {
    let ws = Workspace::new(MESSAGES);
    let rig = Rig::new(ScriptedAnalyzer::returning(vec![questions(&["How?"])]));

    let result = rig
        .orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap();

    let raw = ws.files_in("inbox/raw");
    assert_eq!(raw.len(), 1);
    assert!(raw[0].ends_with("_slack_export.json"));
    assert_eq!(result.raw_copy.file_name().unwrap().to_string_lossy(), raw[0]);

    let analyzed = ws.files_in("inbox/analyzed/slack");
    assert_eq!(analyzed.len(), 1);
    assert!(analyzed[0].ends_with("_analyzed.json"));

    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&result.analyzed_snapshot).unwrap()).unwrap();
    assert_eq!(snapshot["source"], "slack");
    assert_eq!(snapshot["questions"][0]["text"], "How?");
    assert_eq!(snapshot["input_sha256"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn clean_source_removes_only_that_source() {
    let ws = Workspace::new(MESSAGES);
    let store = KnowledgeStore::new(&ws.root);
    store.ensure_layout("source_a").unwrap();
    write_raw_question(&store, 1, "source_a");
    write_raw_question(&store, 2, "source_b");

    let rig = Rig::new(ScriptedAnalyzer::returning(vec![ExtractionResult::default()]));
    let mut params = ws.params("source_a");
    params.clean_source_before_processing = true;
    rig.orchestrator().run(&params, &SilentProgress).await.unwrap();

    assert_eq!(ws.files_in("questions"), vec!["q_0002.md"]);
}

#[tokio::test]
async fn clean_output_removes_every_unit_before_writing() {
    let ws = Workspace::new(MESSAGES);
    let store = KnowledgeStore::new(&ws.root);
    store.ensure_layout("x").unwrap();
    write_raw_question(&store, 7, "source_a");
    write_raw_question(&store, 8, "source_b");

    let rig = Rig::new(ScriptedAnalyzer::returning(vec![questions(&["Fresh?"])]));
    let mut params = ws.params("source_c");
    params.clean_output = true;
    rig.orchestrator().run(&params, &SilentProgress).await.unwrap();

    // Ids restart once the directory is empty.
    assert_eq!(ws.files_in("questions"), vec!["q_0001.md"]);
    assert_eq!(store.read_unit(UnitId::new(UnitKind::Question, 1)).unwrap().text, "Fresh?");
}

#[tokio::test]
async fn analysis_failure_leaves_no_residue() {
    let ws = Workspace::new("first chunk\n---\nsecond chunk");
    let mut rig = Rig::new(ScriptedAnalyzer {
        results: vec![questions(&["q0"]), questions(&["q1"])],
        fail_on: Some(1),
        ..Default::default()
    });
    rig.preparer = Arc::new(MarkerPreparer);

    let err = rig
        .orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap_err();

    assert_rolled_back(&err, AgentStage::Analyze);
    assert!(ws.files_in("inbox/raw").is_empty());
    assert!(ws.files_in("inbox/analyzed/slack").is_empty());
    assert!(ws.files_in("questions").is_empty());
    assert!(rig.cursor.updates().is_empty());
}

#[tokio::test]
async fn preparer_failure_rolls_back_raw_copy() {
    let ws = Workspace::new(MESSAGES);
    let mut rig = Rig::new(ScriptedAnalyzer::default());
    rig.preparer = Arc::new(FailingPreparer);

    let err = rig
        .orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap_err();

    assert_rolled_back(&err, AgentStage::Prepare);
    assert!(ws.files_in("inbox/raw").is_empty());
    assert_eq!(rig.analyzer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_params_fail_before_staging() {
    let ws = Workspace::new(MESSAGES);
    let rig = Rig::new(ScriptedAnalyzer::default());
    let mut params = ws.params("slack");
    params.input_file = ws.base.join("missing.json");

    let err = rig.orchestrator().run(&params, &SilentProgress).await.unwrap_err();
    assert!(matches!(err, KbError::Validation { .. }));
    assert!(!ws.root.exists());
}

#[tokio::test]
async fn cursor_updated_once_in_both_modes() {
    for mode in [ProcessingMode::Full, ProcessingMode::ProcessOnly] {
        let ws = Workspace::new(MESSAGES);
        let rig = Rig::new(ScriptedAnalyzer::returning(vec![questions(&["Q?"])]));
        let mut params = ws.params("jira");
        params.processing_mode = mode;

        let result = rig.orchestrator().run(&params, &SilentProgress).await.unwrap();

        assert_eq!(rig.cursor.updates().len(), 1, "{mode:?}");
        let aggregated = rig.aggregator.calls.load(Ordering::SeqCst);
        match mode {
            ProcessingMode::Full => {
                assert_eq!(aggregated, 1);
                assert_eq!(result.statistics.as_ref().map(|s| s.questions), Some(1));
                assert!(ws.root.join("INDEX.md").exists());
                assert!(ws.root.join("stats/statistics.json").exists());
            }
            ProcessingMode::ProcessOnly => {
                assert_eq!(aggregated, 0);
                assert!(result.statistics.is_none());
                assert!(!ws.root.join("INDEX.md").exists());
            }
        }
    }
}

#[tokio::test]
async fn merge_follows_chunk_order_not_completion_order() {
    let ws = Workspace::new("c0\n---\nc1\n---\nc2");
    let mut rig = Rig::new(ScriptedAnalyzer {
        results: vec![
            ExtractionResult {
                questions: vec![draft("A", "first", None, &[])],
                notes: vec![draft("A", "note0", None, &[])],
                ..Default::default()
            },
            questions(&["second", "third"]),
            ExtractionResult {
                notes: vec![draft("A", "note2", None, &[])],
                ..Default::default()
            },
        ],
        delays_ms: vec![120, 40, 0],
        ..Default::default()
    });
    rig.preparer = Arc::new(MarkerPreparer);
    rig.options.analysis_concurrency = 3;

    rig.orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap();

    let order = rig.analyzer.completion_order.lock().unwrap().clone();
    assert_eq!(order, vec![2, 1, 0], "chunks should finish out of order");

    let store = KnowledgeStore::new(&ws.root);
    let texts: Vec<String> = store
        .scan_all(UnitKind::Question)
        .unwrap()
        .into_iter()
        .map(|u| u.text)
        .collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
    let notes: Vec<String> = store
        .scan_all(UnitKind::Note)
        .unwrap()
        .into_iter()
        .map(|u| u.text)
        .collect();
    assert_eq!(notes, vec!["note0", "note2"]);
}

#[tokio::test]
async fn ids_continue_across_runs() {
    let ws = Workspace::new(MESSAGES);
    let store = KnowledgeStore::new(&ws.root);
    store.ensure_layout("slack").unwrap();
    write_raw_question(&store, 41, "legacy");
    std::fs::write(ws.root.join("questions/notes.txt"), "not a unit").unwrap();

    let rig = Rig::new(ScriptedAnalyzer::returning(vec![questions(&["a", "b"])]));
    let orchestrator = rig.orchestrator();
    orchestrator.run(&ws.params("slack"), &SilentProgress).await.unwrap();
    orchestrator.run(&ws.params("slack"), &SilentProgress).await.unwrap();

    assert_eq!(
        ws.files_in("questions"),
        vec!["notes.txt", "q_0041.md", "q_0042.md", "q_0043.md", "q_0044.md", "q_0045.md"]
    );
    assert_eq!(store.next_id(UnitKind::Question).unwrap().seq, 46);
    assert_eq!(store.next_id(UnitKind::Answer).unwrap().seq, 1);
}

fn existing_question(store: &KnowledgeStore, seq: u32, area: &str) -> KnowledgeUnit {
    let unit = KnowledgeUnit::from_draft(
        UnitId::new(UnitKind::Question, seq),
        "older_source",
        &draft("Carol", "How do tokens expire?", Some(area), &[]),
    );
    store.write_unit(&unit).unwrap();
    unit
}

fn answer_run() -> ScriptedAnalyzer {
    ScriptedAnalyzer::returning(vec![ExtractionResult {
        answers: vec![draft("Bob", "After one hour.", Some("backend"), &["tokens"])],
        ..Default::default()
    }])
}

fn accepted(answer: &str, question: &str) -> Mapping {
    Mapping {
        answer_id: answer.into(),
        question_id: question.into(),
        confidence: 0.9,
    }
}

#[tokio::test]
async fn accepted_mapping_marks_question_answered() {
    let ws = Workspace::new(MESSAGES);
    let store = KnowledgeStore::new(&ws.root);
    store.ensure_layout("slack").unwrap();
    existing_question(&store, 1, "backend");
    existing_question(&store, 2, "frontend");

    let mut rig = Rig::new(answer_run());
    rig.mapper = Arc::new(FakeMapper {
        mappings: vec![accepted("a_0001", "q_0001"), accepted("a_0001", "q_0002")],
        ..Default::default()
    });

    let result = rig
        .orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(result.answers_created, 1);
    assert_eq!(result.mappings_applied, 1);

    let (answers, candidates) = rig.mapper.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(answers[0].id.to_string(), "a_0001");
    let candidate_ids: Vec<String> = candidates.iter().map(|q| q.id.to_string()).collect();
    assert_eq!(candidate_ids, vec!["q_0001"]);

    let q1 = store.read_unit(UnitId::new(UnitKind::Question, 1)).unwrap();
    assert!(q1.answered);
    assert_eq!(q1.answered_by, vec![UnitId::new(UnitKind::Answer, 1)]);
    assert!(!store.read_unit(UnitId::new(UnitKind::Question, 2)).unwrap().answered);
}

#[tokio::test]
async fn mapping_failure_is_skipped_by_default() {
    let ws = Workspace::new(MESSAGES);
    let store = KnowledgeStore::new(&ws.root);
    store.ensure_layout("slack").unwrap();
    existing_question(&store, 1, "backend");

    let mut rig = Rig::new(answer_run());
    rig.mapper = Arc::new(FakeMapper {
        fail: true,
        ..Default::default()
    });

    let result = rig
        .orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(result.mappings_applied, 0);
    assert_eq!(rig.mapper.calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.aggregator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.cursor.updates().len(), 1);
}

#[tokio::test]
async fn mapping_failure_aborts_when_configured() {
    let ws = Workspace::new(MESSAGES);
    let store = KnowledgeStore::new(&ws.root);
    store.ensure_layout("slack").unwrap();
    existing_question(&store, 1, "backend");

    let mut rig = Rig::new(answer_run());
    rig.mapper = Arc::new(FakeMapper {
        fail: true,
        ..Default::default()
    });
    rig.options.mapping_failure = MappingFailurePolicy::Abort;

    let err = rig
        .orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap_err();

    assert_rolled_back(&err, AgentStage::Map);
    assert!(ws.files_in("answers").is_empty());
    assert_eq!(ws.files_in("questions"), vec!["q_0001.md"]);
    assert!(rig.cursor.updates().is_empty());
}

#[tokio::test]
async fn no_answer_like_items_means_no_mapping_call() {
    let ws = Workspace::new(MESSAGES);
    let store = KnowledgeStore::new(&ws.root);
    store.ensure_layout("slack").unwrap();
    existing_question(&store, 1, "backend");

    let rig = Rig::new(ScriptedAnalyzer::returning(vec![questions(&["Another?"])]));
    rig.orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(rig.mapper.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn aggregation_failure_restores_previous_store() {
    let ws = Workspace::new(MESSAGES);
    let first = Rig::new(ScriptedAnalyzer::returning(vec![questions(&["kept"])]));
    first
        .orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap();
    let index_before = std::fs::read_to_string(ws.root.join("INDEX.md")).unwrap();

    let mut second = Rig::new(ScriptedAnalyzer::returning(vec![questions(&["doomed"])]));
    second.aggregator = Arc::new(CountingAggregator {
        fail: true,
        ..Default::default()
    });

    let err = second
        .orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap_err();

    assert_rolled_back(&err, AgentStage::Aggregate);
    assert_eq!(ws.files_in("questions"), vec!["q_0001.md"]);
    assert_eq!(ws.files_in("inbox/raw").len(), 1);
    assert_eq!(ws.files_in("inbox/analyzed/slack").len(), 1);
    assert_eq!(std::fs::read_to_string(ws.root.join("INDEX.md")).unwrap(), index_before);
    assert!(second.cursor.updates().is_empty());
}

#[tokio::test]
async fn cursor_failure_undoes_units_mappings_and_indices() {
    let ws = Workspace::new(MESSAGES);
    let store = KnowledgeStore::new(&ws.root);
    store.ensure_layout("slack").unwrap();
    existing_question(&store, 1, "backend");
    let question_path = store.unit_path(UnitId::new(UnitKind::Question, 1));
    let question_before = std::fs::read_to_string(&question_path).unwrap();

    let mut rig = Rig::new(answer_run());
    rig.mapper = Arc::new(FakeMapper {
        mappings: vec![accepted("a_0001", "q_0001")],
        ..Default::default()
    });
    rig.cursor = Arc::new(RecordingCursor {
        fail: true,
        ..Default::default()
    });

    let err = rig
        .orchestrator()
        .run(&ws.params("slack"), &SilentProgress)
        .await
        .unwrap_err();

    assert_rolled_back(&err, AgentStage::Cursor);
    assert_eq!(std::fs::read_to_string(&question_path).unwrap(), question_before);
    assert!(ws.files_in("answers").is_empty());
    assert!(ws.files_in("inbox/raw").is_empty());
    assert!(!ws.root.join("INDEX.md").exists());
    assert!(!ws.root.join("stats").exists());
    assert!(!ws.root.join("topics").exists());
}

#[tokio::test]
async fn concurrent_runs_on_one_root_never_share_ids() {
    let ws = Workspace::new(MESSAGES);
    let rig = Rig::new(ScriptedAnalyzer::returning(vec![questions(&["x", "y"])]));
    let orchestrator = rig.orchestrator();

    let params_a = ws.params("source_a");
    let params_b = ws.params("source_b");
    let (a, b) = tokio::join!(
        orchestrator.run(&params_a, &SilentProgress),
        orchestrator.run(&params_b, &SilentProgress),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(
        ws.files_in("questions"),
        vec!["q_0001.md", "q_0002.md", "q_0003.md", "q_0004.md"]
    );
    assert_eq!(rig.cursor.updates().len(), 2);
}

#[tokio::test]
async fn rebuild_reads_files_without_calling_agents() {
    let ws = Workspace::new(MESSAGES);
    let store = KnowledgeStore::new(&ws.root);
    store.ensure_layout("test_source").unwrap();
    std::fs::write(
        ws.root.join("questions/q_0001.md"),
        "---\nsource: test_source\nauthor: Ann\nanswered: true\ntopics: [deploy]\n---\n\nHow do we deploy?",
    )
    .unwrap();
    std::fs::write(
        ws.root.join("answers/a_0001.md"),
        "---\nsource: test_source\nauthor: Ben\ntopics: [deploy]\n---\n\nWith the pipeline.",
    )
    .unwrap();

    let rig = Rig::new(ScriptedAnalyzer::default());
    let result = rig
        .orchestrator()
        .rebuild(&ws.root, Some("test_source"), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(result.units_scanned, 2);
    assert_eq!(result.statistics.answered_questions, 1);
    assert_eq!(result.topics_written, 1);
    assert_eq!(rig.analyzer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(rig.mapper.calls.load(Ordering::SeqCst), 0);
    assert!(rig.cursor.updates().is_empty());
    assert!(ws.root.join("topics/deploy.md").exists());
    assert_eq!(ws.files_in("questions"), vec!["q_0001.md"]);
}

#[tokio::test]
async fn rebuild_requires_existing_root() {
    let ws = Workspace::new(MESSAGES);
    let rig = Rig::new(ScriptedAnalyzer::default());
    let err = rig
        .orchestrator()
        .rebuild(&ws.root, None, &SilentProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::Validation { .. }));
}
