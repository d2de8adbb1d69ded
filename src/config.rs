//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults, so
//! a minimal config is just:
//!
//! ```toml
//! [db]
//! path = "./data/codescope.sqlite"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use codescope_core::analysis::{AnalysisSettings, Depth, Verbosity};
use codescope_core::chunk::ChunkerConfig;
use codescope_core::context::ItemLimits;
use codescope_core::roles::AgentRole;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkspaceConfig {
    /// Where git sources are cloned. Defaults to `repos/` next to the database.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourceConfig {
    /// Extra exclude patterns on top of the built-in ones.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_lines")]
    pub window_lines: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_true")]
    pub structural: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_lines: default_window_lines(),
            overlap_lines: default_overlap_lines(),
            max_file_bytes: default_max_file_bytes(),
            structural: true,
        }
    }
}

impl ChunkingConfig {
    pub fn chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            window_lines: self.window_lines,
            overlap_lines: self.overlap_lines,
            max_file_bytes: self.max_file_bytes,
            structural: self.structural,
        }
    }
}

fn default_window_lines() -> usize {
    60
}
fn default_overlap_lines() -> usize {
    10
}
fn default_max_file_bytes() -> u64 {
    1_000_000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL of the provider. Defaults per provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    /// Batches embedded at the same time during an index build.
    #[serde(default = "default_embedding_concurrency")]
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_embedding_retries(),
            timeout_secs: default_embedding_timeout(),
            concurrency: default_embedding_concurrency(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_retries() -> u32 {
    5
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_embedding_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_retries: default_generation_retries(),
            timeout_secs: default_generation_timeout(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_temperature() -> f32 {
    0.3
}
fn default_generation_retries() -> u32 {
    3
}
fn default_generation_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k: default_k() }
    }
}

fn default_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_depth")]
    pub depth: String,
    #[serde(default = "default_verbosity")]
    pub verbosity: String,
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
    /// Nodes generating at the same time.
    #[serde(default = "default_analysis_concurrency")]
    pub concurrency: usize,
    /// Named template; overrides depth, verbosity and roles.
    #[serde(default)]
    pub template: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            verbosity: default_verbosity(),
            roles: default_roles(),
            concurrency: default_analysis_concurrency(),
            template: None,
        }
    }
}

fn default_depth() -> String {
    "standard".to_string()
}
fn default_verbosity() -> String {
    "medium".to_string()
}
fn default_roles() -> Vec<String> {
    vec!["sde".to_string(), "pm".to_string()]
}
fn default_analysis_concurrency() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Most recent turns considered for context.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: usize,
    #[serde(default = "default_turn_chars")]
    pub turn_chars: usize,
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_turns: default_history_turns(),
            budget_tokens: default_budget_tokens(),
            turn_chars: default_turn_chars(),
            chunk_chars: default_chunk_chars(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

impl ChatConfig {
    pub fn item_limits(&self) -> ItemLimits {
        ItemLimits {
            turn_chars: self.turn_chars,
            chunk_chars: self.chunk_chars,
        }
    }
}

fn default_history_turns() -> usize {
    6
}
fn default_budget_tokens() -> usize {
    3000
}
fn default_turn_chars() -> usize {
    150
}
fn default_chunk_chars() -> usize {
    1500
}
fn default_excerpt_chars() -> usize {
    600
}

impl Config {
    /// Config with every optional section at its default.
    pub fn with_db(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            workspace: WorkspaceConfig::default(),
            source: SourceConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            analysis: AnalysisConfig::default(),
            chat: ChatConfig::default(),
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        match &self.workspace.cache_dir {
            Some(dir) => dir.clone(),
            None => self
                .db
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("repos"),
        }
    }

    /// Analysis settings from `[analysis]`, template first.
    pub fn analysis_settings(&self) -> Result<AnalysisSettings> {
        let settings = match &self.analysis.template {
            Some(name) => AnalysisSettings::template(name).with_context(|| {
                format!(
                    "unknown analysis template '{}'. Must be one of: {}",
                    name,
                    AnalysisSettings::TEMPLATES.join(", ")
                )
            })?,
            None => AnalysisSettings {
                depth: self.analysis.depth.parse::<Depth>()?,
                verbosity: self.analysis.verbosity.parse::<Verbosity>()?,
                roles: self
                    .analysis
                    .roles
                    .iter()
                    .map(|r| r.parse::<AgentRole>())
                    .collect::<Result<Vec<_>>>()?,
                temperature: self.generation.temperature,
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Analysis settings with command-line overrides applied.
    ///
    /// A template replaces the whole `[analysis]` selection; any of the
    /// individual flags drops a configured template.
    pub fn analysis_settings_with(&self, overrides: &AnalysisOverrides) -> Result<AnalysisSettings> {
        let mut analysis = self.analysis.clone();
        if overrides.template.is_some() {
            analysis.template = overrides.template.clone();
        } else if overrides.depth.is_some() || overrides.verbosity.is_some() || overrides.roles.is_some() {
            analysis.template = None;
        }
        if let Some(depth) = &overrides.depth {
            analysis.depth = depth.clone();
        }
        if let Some(verbosity) = &overrides.verbosity {
            analysis.verbosity = verbosity.clone();
        }
        if let Some(roles) = &overrides.roles {
            analysis.roles = roles
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
        }
        Config {
            analysis,
            ..self.clone()
        }
        .analysis_settings()
    }
}

/// Command-line overrides of `[analysis]`.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOverrides {
    pub template: Option<String>,
    pub depth: Option<String>,
    pub verbosity: Option<String>,
    /// Comma-separated role list.
    pub roles: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.window_lines == 0 {
        anyhow::bail!("chunking.window_lines must be > 0");
    }
    if config.chunking.overlap_lines >= config.chunking.window_lines {
        anyhow::bail!("chunking.overlap_lines must be smaller than chunking.window_lines");
    }

    // Retrieval and chat
    if config.retrieval.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }
    if config.chat.budget_tokens == 0 {
        anyhow::bail!("chat.budget_tokens must be > 0");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 || config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.batch_size and embedding.concurrency must be > 0");
    }

    // Generation
    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.model.is_none() {
        anyhow::bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }
    if !(0.0..=1.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 1.0]");
    }

    // Analysis
    if config.analysis.concurrency == 0 {
        anyhow::bail!("analysis.concurrency must be > 0");
    }
    config.analysis_settings()?;

    Ok(())
}
