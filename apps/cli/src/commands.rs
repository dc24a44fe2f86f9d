//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use kbforge_core::{
    Agents, Aggregator, BridgeAgent, BridgeSettings, InboxOutcome, InboxParams, Orchestrator,
    ParagraphChunker, ProgressReporter, RunResult, StructureAggregator,
};
use kbforge_shared::{
    AppConfig, PipelineOptions, ProcessingMode, RunParams, StageInstructions, init_config,
    load_config, validate_api_key,
};
use kbforge_store::{JsonCursorStore, SyncCursorStore};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// kbforge: turn chat exports into a growing markdown knowledge base.
#[derive(Parser)]
#[command(
    name = "kbforge",
    version,
    about = "Extract questions, answers, and notes from chat exports into a markdown knowledge base.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// `--mode` values.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum ModeArg {
    /// Write units, map answers, then re-aggregate the whole store.
    Full,
    /// Write units and map answers; leave derived indices untouched.
    ProcessOnly,
}

impl From<ModeArg> for ProcessingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => ProcessingMode::Full,
            ModeArg::ProcessOnly => ProcessingMode::ProcessOnly,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process one chat export into the knowledge base.
    Run {
        /// Source name (e.g. the channel the export came from).
        #[arg(short, long)]
        source: String,

        /// Chat export file to process.
        #[arg(short, long)]
        input: PathBuf,

        /// Sync timestamp recorded for the source on success (defaults to now, RFC 3339).
        #[arg(long)]
        timestamp: Option<String>,

        /// Knowledge base root (defaults to `defaults.output_dir` from config).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Delete every unit and derived index before processing.
        #[arg(long)]
        clean_output: bool,

        /// Delete this source's units before processing.
        #[arg(long)]
        clean_source: bool,

        /// Processing mode (defaults to `defaults.processing_mode` from config).
        #[arg(short, long)]
        mode: Option<ModeArg>,

        /// Extra instruction for the analysis agent (repeatable).
        #[arg(long = "analysis-instructions")]
        analysis: Vec<String>,

        /// Extra instruction for the mapping agent (repeatable).
        #[arg(long = "mapping-instructions")]
        mapping: Vec<String>,

        /// Extra instruction for the aggregation agent (repeatable).
        #[arg(long = "aggregation-instructions")]
        aggregation: Vec<String>,

        /// Ask the agent for a one-paragraph description of each topic.
        #[arg(long)]
        describe_topics: bool,
    },

    /// Recompute statistics and topic indices from the unit files.
    Rebuild {
        /// Knowledge base root (defaults to `defaults.output_dir` from config).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Source label for the log line; aggregation always covers every source.
        #[arg(short, long)]
        source: Option<String>,

        /// Ask the agent for a one-paragraph description of each topic.
        #[arg(long)]
        describe_topics: bool,
    },

    /// Process every export waiting under `inbox/raw/<source>/`, then rebuild once.
    ProcessInbox {
        /// Knowledge base root (defaults to `defaults.output_dir` from config).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Sync timestamp recorded for each processed file (defaults to now, RFC 3339).
        #[arg(long)]
        timestamp: Option<String>,

        /// Extra instruction for the analysis agent (repeatable).
        #[arg(long = "analysis-instructions")]
        analysis: Vec<String>,

        /// Extra instruction for the mapping agent (repeatable).
        #[arg(long = "mapping-instructions")]
        mapping: Vec<String>,

        /// Leave derived indices untouched after the batch.
        #[arg(long)]
        no_rebuild: bool,

        /// Ask the agent for a one-paragraph description of each topic.
        #[arg(long)]
        describe_topics: bool,
    },

    /// Show the last sync timestamp recorded for a source.
    Cursor {
        /// Source name to look up.
        #[arg(short, long)]
        source: String,

        /// Knowledge base root (defaults to `defaults.output_dir` from config).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "kbforge=info",
        1 => "kbforge=debug",
        _ => "kbforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so run summaries on stdout stay pipeable.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            source,
            input,
            timestamp,
            out,
            clean_output,
            clean_source,
            mode,
            analysis,
            mapping,
            aggregation,
            describe_topics,
        } => {
            let config = load_config()?;
            let mut params = RunParams::new(
                source,
                input,
                timestamp.unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
                resolve_root(out, &config),
            );
            params.clean_output = clean_output;
            params.clean_source_before_processing = clean_source;
            params.processing_mode = mode.map(Into::into).unwrap_or(config.defaults.processing_mode);
            params.instructions = StageInstructions {
                analysis,
                mapping,
                aggregation,
            };
            cmd_run(&config, &params, describe_topics).await
        }
        Command::Rebuild {
            out,
            source,
            describe_topics,
        } => cmd_rebuild(out, source.as_deref(), describe_topics).await,
        Command::ProcessInbox {
            out,
            timestamp,
            analysis,
            mapping,
            no_rebuild,
            describe_topics,
        } => {
            let config = load_config()?;
            let mut params = InboxParams::new(
                resolve_root(out, &config),
                timestamp.unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
            );
            params.instructions = StageInstructions {
                analysis,
                mapping,
                aggregation: Vec::new(),
            };
            params.rebuild = !no_rebuild;
            cmd_process_inbox(&config, &params, describe_topics).await
        }
        Command::Cursor { source, out } => cmd_cursor(&source, out).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

fn resolve_root(out: Option<PathBuf>, config: &AppConfig) -> PathBuf {
    out.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir))
}

/// Wire the bridge-backed agents and the file cursor for `root`.
fn build_orchestrator(
    config: &AppConfig,
    root: &std::path::Path,
    describe_topics: bool,
) -> (Orchestrator, BridgeAgent) {
    let bridge = BridgeAgent::new(BridgeSettings::from(&config.bridge));
    let aggregator: Arc<dyn Aggregator> = if describe_topics {
        Arc::new(bridge.clone())
    } else {
        Arc::new(StructureAggregator)
    };
    let agents = Agents {
        preparer: Arc::new(ParagraphChunker::new(config.pipeline.chunk_max_chars)),
        analyzer: Arc::new(bridge.clone()),
        mapper: Arc::new(bridge.clone()),
        aggregator,
        cursor: Arc::new(JsonCursorStore::for_root(root)),
    };
    (Orchestrator::new(agents, PipelineOptions::from(config)), bridge)
}

async fn cmd_run(config: &AppConfig, params: &RunParams, describe_topics: bool) -> Result<()> {
    // Fail before any side effect if the agents cannot authenticate.
    validate_api_key(config)?;

    let (orchestrator, bridge) = build_orchestrator(config, &params.output_root, describe_topics);

    info!(
        source = %params.source_name,
        input = %params.input_file.display(),
        root = %params.output_root.display(),
        mode = ?params.processing_mode,
        "processing chat export"
    );

    let reporter = CliProgress::new();
    let outcome = orchestrator.run(params, &reporter).await;
    reporter.clear();
    bridge.shutdown().await;
    let result = outcome?;

    println!();
    println!("  Run complete!");
    println!("  Run:       {}", result.run_id);
    println!("  Source:    {}", result.source_name);
    println!("  Chunks:    {}", result.chunk_count);
    println!("  Questions: {}", result.questions_created);
    println!("  Answers:   {}", result.answers_created);
    println!("  Notes:     {}", result.notes_created);
    println!("  Mapped:    {}", result.mappings_applied);
    if let Some(stats) = &result.statistics {
        println!(
            "  Store:     {} questions ({} open), {} answers, {} notes",
            stats.questions, stats.unanswered_questions, stats.answers, stats.notes
        );
    }
    println!("  Snapshot:  {}", result.analyzed_snapshot.display());
    println!("  Time:      {:.1}s", result.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_rebuild(out: Option<PathBuf>, source: Option<&str>, describe_topics: bool) -> Result<()> {
    let config = load_config()?;
    if describe_topics {
        validate_api_key(&config)?;
    }
    let root = resolve_root(out, &config);
    let (orchestrator, bridge) = build_orchestrator(&config, &root, describe_topics);

    let reporter = CliProgress::new();
    let outcome = orchestrator.rebuild(&root, source, &reporter).await;
    reporter.clear();
    bridge.shutdown().await;
    let result = outcome?;

    println!();
    println!("  Indices rebuilt!");
    println!("  Root:   {}", root.display());
    println!("  Units:  {}", result.units_scanned);
    println!("  Topics: {}", result.topics_written);
    println!("  People: {}", result.people_written);
    println!("  Areas:  {}", result.areas_written);
    println!("  Time:   {:.1}s", result.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_process_inbox(
    config: &AppConfig,
    params: &InboxParams,
    describe_topics: bool,
) -> Result<()> {
    validate_api_key(config)?;

    let (orchestrator, bridge) = build_orchestrator(config, &params.output_root, describe_topics);
    info!(root = %params.output_root.display(), "processing inbox");

    let reporter = CliProgress::new();
    let outcome = orchestrator.process_inbox(params, &reporter).await;
    reporter.clear();
    bridge.shutdown().await;
    let report = outcome?;

    println!();
    for entry in &report.entries {
        let status = match &entry.outcome {
            InboxOutcome::Processed { units_created, .. } => format!("processed ({units_created} units)"),
            InboxOutcome::Skipped { reason } => format!("skipped: {reason}"),
            InboxOutcome::Failed { error } => format!("FAILED: {error}"),
        };
        println!("  {} {}: {status}", entry.source, entry.file.display());
    }
    println!();
    println!("  Processed: {}", report.processed());
    println!("  Skipped:   {}", report.skipped());
    println!("  Failed:    {}", report.failed());
    if let Some(rebuild) = &report.rebuild {
        println!("  Topics:    {}", rebuild.topics_written);
    }
    println!("  Time:      {:.1}s", report.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_cursor(source: &str, out: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let root = resolve_root(out, &config);
    if !root.is_dir() {
        return Err(eyre!("no knowledge base found at '{}'", root.display()));
    }

    let cursor = JsonCursorStore::for_root(&root);
    match cursor.last_sync(source).await? {
        Some(ts) => println!("{ts}"),
        None => println!("{source}: never synced"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn clear(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn chunk_analyzed(&self, index: usize, completed: usize, total: usize) {
        self.spinner
            .set_message(format!("Analyzed [{completed}/{total}] chunk #{index}"));
    }

    fn done(&self, _result: &RunResult) {
        self.spinner.finish_and_clear();
    }
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
