//! Subprocess agent bridge.
//!
//! Spawns the agent runtime, exchanges JSON-lines messages over
//! stdin/stdout, and exposes it as the content-analysis, answer-mapping and
//! aggregation collaborator.
//!
//! Protocol: the bridge prints `{"type":"ready"}` once, then answers each
//! `{"type":"task","id":..,"model":..,"task":{"kind":..}}` line with either
//! `{"type":"result","id":..,"result":..}` or `{"type":"error","id":..,"error":..}`.
//! `{"type":"shutdown"}` asks it to exit.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use kbforge_shared::{
    AgentStage, Aggregation, AnswerLikeSummary, BridgeConfig, Chunk, ExtractionResult, KbError,
    Mapping, QuestionSummary, Result, StoreSnapshot, TopicGroup, UnitId,
};

use crate::aggregate::build_aggregation;
use crate::agents::{Aggregator, AnswerMapper, ContentAnalyzer};

/// Excerpts sent per topic description request.
const DESCRIBE_MAX_UNITS: usize = 20;
const DESCRIBE_EXCERPT_CHARS: usize = 280;

/// How long a graceful shutdown waits before the process is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// A task understood by the bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeTask {
    AnalyzeChunk {
        index: usize,
        text: String,
        instructions: Vec<String>,
    },
    MapAnswers {
        answers: Vec<AnswerLikeSummary>,
        questions: Vec<QuestionSummary>,
        instructions: Vec<String>,
    },
    DescribeTopic {
        name: String,
        excerpts: Vec<TopicExcerpt>,
        instructions: Vec<String>,
    },
}

impl BridgeTask {
    fn stage(&self) -> AgentStage {
        match self {
            Self::AnalyzeChunk { .. } => AgentStage::Analyze,
            Self::MapAnswers { .. } => AgentStage::Map,
            Self::DescribeTopic { .. } => AgentStage::Aggregate,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicExcerpt {
    pub id: UnitId,
    pub author: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage<'a> {
    Task {
        id: String,
        model: &'a str,
        task: BridgeTask,
    },
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Result {
        id: String,
        result: serde_json::Value,
    },
    Error {
        #[allow(dead_code)]
        id: String,
        error: String,
    },
}

#[derive(Debug, Deserialize)]
struct MappingResponse {
    #[serde(default)]
    mappings: Vec<Mapping>,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    #[serde(default)]
    description: String,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// How to launch the bridge process.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub command: String,
    pub args: Vec<String>,
    /// Empty means the current directory.
    pub working_dir: String,
    pub model: String,
}

impl From<&BridgeConfig> for BridgeSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: vec!["run".into(), config.script.clone()],
            working_dir: config.working_dir.clone(),
            model: config.model.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

/// Why a task did not produce a result.
#[derive(Debug)]
enum BridgeFault {
    /// The bridge answered with an error message; the process is still usable.
    Reply(String),
    /// The pipe or the message stream is broken; the process must be replaced.
    Broken(String),
}

impl From<String> for BridgeFault {
    fn from(msg: String) -> Self {
        Self::Broken(msg)
    }
}

/// Handle to the spawned bridge subprocess. Errors are plain messages; the
/// caller attaches the pipeline stage.
struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    request_counter: u64,
}

impl BridgeHandle {
    fn spawn(settings: &BridgeSettings) -> std::result::Result<Self, String> {
        info!(cmd = %settings.command, args = ?settings.args, "spawning agent bridge");

        let mut command = Command::new(&settings.command);
        command
            .args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if !settings.working_dir.is_empty() {
            command.current_dir(&settings.working_dir);
        }

        let mut child = command.spawn().map_err(|e| {
            format!("failed to spawn bridge: {e}. Is `{}` installed?", settings.command)
        })?;
        let stdin = child.stdin.take().ok_or("failed to capture bridge stdin")?;
        let stdout = child.stdout.take().ok_or("failed to capture bridge stdout")?;

        let mut handle = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
        };
        handle.wait_for_ready()?;
        Ok(handle)
    }

    fn read_message(&mut self) -> std::result::Result<ResponseMessage, String> {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|e| format!("bridge read error: {e}"))?;
        if line.is_empty() {
            return Err("bridge closed stdout unexpectedly".into());
        }
        serde_json::from_str(line.trim()).map_err(|e| {
            let preview: String = line.chars().take(200).collect();
            format!("invalid bridge message: {e} (got: {preview})")
        })
    }

    fn wait_for_ready(&mut self) -> std::result::Result<(), String> {
        match self.read_message()? {
            ResponseMessage::Ready => {
                info!("bridge is ready");
                Ok(())
            }
            other => Err(format!("expected ready message, got: {other:?}")),
        }
    }

    fn send_task(&mut self, model: &str, task: BridgeTask) -> std::result::Result<serde_json::Value, BridgeFault> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);

        let json = serde_json::to_string(&RequestMessage::Task {
            id: id.clone(),
            model,
            task,
        })
        .map_err(|e| format!("failed to serialize request: {e}"))?;

        writeln!(self.stdin, "{json}").map_err(|e| format!("failed to write to bridge stdin: {e}"))?;
        self.stdin
            .flush()
            .map_err(|e| format!("failed to flush bridge stdin: {e}"))?;

        match self.read_message()? {
            ResponseMessage::Result { id: resp_id, result } if resp_id == id => Ok(result),
            ResponseMessage::Result { id: resp_id, .. } => Err(BridgeFault::Broken(format!(
                "bridge answered {resp_id}, expected {id}"
            ))),
            ResponseMessage::Error { error, .. } => Err(BridgeFault::Reply(error)),
            ResponseMessage::Ready => Err(BridgeFault::Broken("unexpected ready message during task".into())),
        }
    }

    /// Ask the process to exit, killing it if it is still running after
    /// [`SHUTDOWN_GRACE`].
    fn shutdown(mut self) {
        if let Ok(json) = serde_json::to_string(&RequestMessage::Shutdown) {
            let _ = writeln!(self.stdin, "{json}");
            let _ = self.stdin.flush();
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!(?status, "bridge exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
                Ok(None) => {
                    warn!("bridge ignored shutdown, killing it");
                    self.kill();
                    return;
                }
                Err(e) => {
                    warn!("bridge wait error: {e}");
                    return;
                }
            }
        }
    }

    /// Kill the process and reap it if it has already exited. Never blocks.
    fn kill(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(e) = self.child.kill() {
            debug!("bridge kill failed: {e}");
        }
        match self.child.try_wait() {
            Ok(Some(status)) => debug!(?status, "bridge reaped"),
            Ok(None) => debug!(pid = self.child.id(), "bridge killed, exit not yet observed"),
            Err(e) => debug!("bridge reap failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Collaborator backed by one lazily spawned bridge process.
///
/// Calls are serialized over the single stdin/stdout pair, so analysis
/// concurrency above 1 only queues requests.
#[derive(Clone)]
pub struct BridgeAgent {
    settings: Arc<BridgeSettings>,
    handle: Arc<Mutex<Option<BridgeHandle>>>,
}

impl std::fmt::Debug for BridgeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeAgent")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl BridgeAgent {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    async fn call<T: DeserializeOwned + Send + 'static>(&self, task: BridgeTask) -> Result<T> {
        let stage = task.stage();
        let settings = Arc::clone(&self.settings);
        let handle = Arc::clone(&self.handle);

        let value = tokio::task::spawn_blocking(move || {
            let mut slot = handle
                .lock()
                .map_err(|_| "bridge handle poisoned by an earlier panic".to_string())?;
            if slot.is_none() {
                *slot = Some(BridgeHandle::spawn(&settings)?);
            }
            let bridge = slot.as_mut().ok_or("bridge unavailable")?;
            match bridge.send_task(&settings.model, task) {
                Ok(value) => Ok(value),
                Err(BridgeFault::Reply(msg)) => Err(msg),
                Err(BridgeFault::Broken(msg)) => {
                    // Respawned on the next call.
                    let dead = slot.take();
                    drop(slot);
                    if let Some(mut dead) = dead {
                        warn!(error = %msg, "bridge connection broken, discarding process");
                        dead.kill();
                    }
                    Err(msg)
                }
            }
        })
        .await
        .map_err(|e| KbError::agent(stage, format!("bridge task failed: {e}")))?
        .map_err(|msg| KbError::agent(stage, msg))?;

        serde_json::from_value(value)
            .map_err(|e| KbError::agent(stage, format!("unexpected bridge result shape: {e}")))
    }

    /// Ask the bridge process to exit, if one was started.
    pub async fn shutdown(&self) {
        let handle = Arc::clone(&self.handle);
        let _ = tokio::task::spawn_blocking(move || {
            let taken = match handle.lock() {
                Ok(mut slot) => slot.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(bridge) = taken {
                bridge.shutdown();
            }
        })
        .await;
    }

    async fn describe(&self, group: &TopicGroup, snapshot: &StoreSnapshot, instructions: &[String]) -> Result<String> {
        let ids = group.questions.iter().chain(&group.answers).chain(&group.notes);
        let excerpts: Vec<TopicExcerpt> = ids
            .filter_map(|id| snapshot.units().find(|u| u.id == *id))
            .take(DESCRIBE_MAX_UNITS)
            .map(|u| TopicExcerpt {
                id: u.id,
                author: u.author.clone(),
                text: u.text.chars().take(DESCRIBE_EXCERPT_CHARS).collect(),
            })
            .collect();

        let response: DescribeResponse = self
            .call(BridgeTask::DescribeTopic {
                name: group.name.clone(),
                excerpts,
                instructions: instructions.to_vec(),
            })
            .await?;
        Ok(response.description)
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        // Covers handles that were never shut down cleanly.
        self.kill();
    }
}

#[async_trait]
impl ContentAnalyzer for BridgeAgent {
    #[instrument(skip_all, fields(chunk = chunk.index))]
    async fn analyze(&self, chunk: &Chunk, instructions: &[String]) -> Result<ExtractionResult> {
        let result: ExtractionResult = self
            .call(BridgeTask::AnalyzeChunk {
                index: chunk.index,
                text: chunk.text.clone(),
                instructions: instructions.to_vec(),
            })
            .await?;
        debug!(items = result.total(), "chunk analyzed");
        Ok(result)
    }
}

#[async_trait]
impl AnswerMapper for BridgeAgent {
    async fn map_answers(
        &self,
        answers: &[AnswerLikeSummary],
        questions: &[QuestionSummary],
        instructions: &[String],
    ) -> Result<Vec<Mapping>> {
        let response: MappingResponse = self
            .call(BridgeTask::MapAnswers {
                answers: answers.to_vec(),
                questions: questions.to_vec(),
                instructions: instructions.to_vec(),
            })
            .await?;
        Ok(response.mappings)
    }
}

/// Mechanical aggregation, with a bridge-written description per topic.
#[async_trait]
impl Aggregator for BridgeAgent {
    async fn aggregate(&self, snapshot: &StoreSnapshot, instructions: &[String]) -> Result<Aggregation> {
        let mut aggregation = build_aggregation(snapshot);
        for i in 0..aggregation.topics.len() {
            let description = self.describe(&aggregation.topics[i], snapshot, instructions).await?;
            let description = description.trim();
            if !description.is_empty() {
                aggregation.topics[i].description = Some(description.to_string());
            }
        }
        Ok(aggregation)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// A shell bridge that echoes canned results, keyed by task kind.
    fn fake_bridge(script_body: &str) -> BridgeAgent {
        let script = format!(
            r#"echo '{{"type":"ready"}}'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/^{{"type":"task","id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"type":"shutdown"'*) exit 0 ;;
{script_body}
  esac
done"#
        );
        BridgeAgent::new(BridgeSettings {
            command: "sh".into(),
            args: vec!["-c".into(), script],
            working_dir: String::new(),
            model: "test-model".into(),
        })
    }

    fn chunk(text: &str) -> Chunk {
        Chunk {
            text: text.into(),
            origin: None,
            index: 0,
        }
    }

    #[tokio::test]
    async fn analyze_round_trips_through_subprocess() {
        let agent = fake_bridge(
            r#"    *analyze_chunk*) echo "{\"type\":\"result\",\"id\":\"$id\",\"result\":{\"questions\":[{\"author\":\"A\",\"text\":\"Why?\"}]}}" ;;"#,
        );

        let first = agent.analyze(&chunk("hello"), &[]).await.unwrap();
        assert_eq!(first.questions.len(), 1);
        assert_eq!(first.questions[0].text, "Why?");

        // Same process serves the second request.
        let second = agent.analyze(&chunk("again"), &[]).await.unwrap();
        assert_eq!(second.total(), 1);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn bridge_errors_carry_the_stage() {
        let agent = fake_bridge(
            r#"    *map_answers*) echo "{\"type\":\"error\",\"id\":\"$id\",\"error\":\"model overloaded\"}" ;;"#,
        );

        let err = agent.map_answers(&[], &[], &[]).await.unwrap_err();
        assert!(matches!(err, KbError::Agent { stage: AgentStage::Map, .. }));
        assert!(err.to_string().contains("model overloaded"));

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn error_reply_keeps_the_process() {
        // `n` counts requests seen by this shell; a respawn would reset it.
        let agent = fake_bridge(
            r#"    *map_answers*) n=$((n+1)); echo "{\"type\":\"error\",\"id\":\"$id\",\"error\":\"bad request\"}" ;;
    *analyze_chunk*) n=$((n+1)); echo "{\"type\":\"result\",\"id\":\"$id\",\"result\":{\"notes\":[{\"author\":\"A\",\"text\":\"call $n\"}]}}" ;;"#,
        );

        let err = agent.map_answers(&[], &[], &[]).await.unwrap_err();
        assert!(err.to_string().contains("bad request"));

        let result = agent.analyze(&chunk("after error"), &[]).await.unwrap();
        assert_eq!(result.notes[0].text, "call 2");

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn broken_bridge_is_replaced_without_blocking() {
        let agent = fake_bridge(
            r#"    *analyze_chunk*) exit 3 ;;
    *map_answers*) echo "{\"type\":\"result\",\"id\":\"$id\",\"result\":{\"mappings\":[]}}" ;;"#,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(10), async {
            let err = agent.analyze(&chunk("x"), &[]).await.unwrap_err();
            assert!(matches!(err, KbError::Agent { stage: AgentStage::Analyze, .. }));
            assert!(err.to_string().contains("closed stdout"));

            // A fresh process serves the next call.
            let mappings = agent.map_answers(&[], &[], &[]).await.unwrap();
            assert!(mappings.is_empty());
            agent.shutdown().await;
        })
        .await;
        assert!(outcome.is_ok(), "bridge calls hung after a broken pipe");
    }

    #[tokio::test]
    async fn missing_command_is_an_agent_error() {
        let agent = BridgeAgent::new(BridgeSettings {
            command: "kbforge-definitely-not-installed".into(),
            args: vec![],
            working_dir: String::new(),
            model: "m".into(),
        });
        let err = agent.analyze(&chunk("x"), &[]).await.unwrap_err();
        assert!(matches!(err, KbError::Agent { stage: AgentStage::Analyze, .. }));
    }
}
