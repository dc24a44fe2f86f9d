//! Application configuration for kbforge.
//!
//! User config lives at `~/.kbforge/kbforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KbError, Result};
use crate::types::ProcessingMode;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "kbforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".kbforge";

// ---------------------------------------------------------------------------
// Config structs (matching kbforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Orchestration tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Agent bridge subprocess settings.
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default knowledge base output root.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Processing mode used when the CLI does not pass `--mode`.
    #[serde(default)]
    pub processing_mode: ProcessingMode,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            processing_mode: ProcessingMode::default(),
        }
    }
}

fn default_output_dir() -> String {
    "./kb".into()
}

/// What to do when the QA-mapping agent fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingFailurePolicy {
    /// Log and continue with no mappings.
    #[default]
    Skip,
    /// Treat the failure like any other collaborator failure and roll back.
    Abort,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Minimum mapping confidence for a question to be marked answered.
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,

    /// Maximum number of chunks analyzed concurrently.
    #[serde(default = "default_analysis_concurrency")]
    pub analysis_concurrency: u32,

    /// Character budget per chunk for the built-in chunk preparer.
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,

    /// Behavior on QA-mapping failure.
    #[serde(default)]
    pub mapping_failure: MappingFailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: default_acceptance_threshold(),
            analysis_concurrency: default_analysis_concurrency(),
            chunk_max_chars: default_chunk_max_chars(),
            mapping_failure: MappingFailurePolicy::default(),
        }
    }
}

fn default_acceptance_threshold() -> f64 {
    0.6
}
fn default_analysis_concurrency() -> u32 {
    4
}
fn default_chunk_max_chars() -> usize {
    12_000
}

/// `[bridge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Runtime used to launch the bridge script (e.g. `bun`).
    #[serde(default = "default_bridge_command")]
    pub command: String,

    /// Bridge script path, passed as `<command> run <script>`.
    #[serde(default = "default_bridge_script")]
    pub script: String,

    /// Working directory for the bridge subprocess. Empty means current dir.
    #[serde(default)]
    pub working_dir: String,

    /// Model identifier forwarded with every task.
    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            script: default_bridge_script(),
            working_dir: String::new(),
            model: default_model(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_bridge_command() -> String {
    "bun".into()
}
fn default_bridge_script() -> String {
    "agents/bridge.ts".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}

// ---------------------------------------------------------------------------
// Pipeline options (runtime, merged from config)
// ---------------------------------------------------------------------------

/// Runtime orchestration options consumed by the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub acceptance_threshold: f64,
    pub analysis_concurrency: usize,
    pub mapping_failure: MappingFailurePolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            acceptance_threshold: config.pipeline.acceptance_threshold,
            analysis_concurrency: config.pipeline.analysis_concurrency.max(1) as usize,
            mapping_failure: config.pipeline.mapping_failure,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.kbforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| KbError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.kbforge/kbforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| KbError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| KbError::config(format!("failed to parse {}: {e}", path.display())))?;

    validate_pipeline(&config.pipeline)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| KbError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| KbError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| KbError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the bridge API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.bridge.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(KbError::config(format!(
            "agent API key not found. Set the {var_name} environment variable."
        ))),
    }
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<()> {
    if !(0.0..=1.0).contains(&pipeline.acceptance_threshold) {
        return Err(KbError::config(format!(
            "pipeline.acceptance_threshold must be within [0, 1], got {}",
            pipeline.acceptance_threshold
        )));
    }
    if pipeline.chunk_max_chars == 0 {
        return Err(KbError::config("pipeline.chunk_max_chars must be positive"));
    }
    Ok(())
}
