//! Configuration loading for research-crew.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::broker::BrokerStrategy;
use crate::error::{Error, Result};

/// Get the research-crew home directory (~/.research-crew).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".research-crew"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.research-crew/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::debug!("Using default settings: {}", e);
        Settings::default()
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.broker.poll_interval_ms == 0 {
        return Err(Error::Config(
            "broker.poll_interval_ms must be greater than zero".to_string(),
        ));
    }

    if settings.llm.provider.requires_api_key() && settings.llm.resolve_api_key().is_none() {
        return Err(Error::Config(format!(
            "llm.provider '{}' needs an api_key (or {})",
            settings.llm.provider,
            settings.llm.provider.api_key_env().unwrap_or_default()
        )));
    }

    let pipeline = &settings.pipeline;
    let timeouts = [
        ("mining_timeout_secs", pipeline.mining_timeout_secs),
        ("graph_timeout_secs", pipeline.graph_timeout_secs),
        ("answer_timeout_secs", pipeline.answer_timeout_secs),
        ("validate_timeout_secs", pipeline.validate_timeout_secs),
        ("report_timeout_secs", pipeline.report_timeout_secs),
    ];
    for (name, secs) in timeouts {
        if secs == 0 {
            return Err(Error::Config(format!("pipeline.{} must be greater than zero", name)));
        }
    }

    let mut seen = HashSet::new();
    for id in pipeline.agent_ids() {
        if id.trim().is_empty() {
            return Err(Error::Config("pipeline agent ids must not be empty".to_string()));
        }
        if !seen.insert(id) {
            return Err(Error::Config(format!(
                "pipeline agent id '{}' is used by more than one stage",
                id
            )));
        }
    }

    Ok(())
}

/// Message broker configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BrokerConfig {
    #[serde(default)]
    pub strategy: BrokerStrategy,
    /// Spool root for the `spool` strategy (default ~/.research-crew/spool)
    pub spool_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            strategy: BrokerStrategy::default(),
            spool_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn resolve_spool_dir(&self) -> Result<PathBuf> {
        match &self.spool_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_home_dir()?.join("spool")),
        }
    }
}

/// Supported LLM backends.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    #[default]
    Ollama,
    Groq,
    Openrouter,
}

impl LlmProviderKind {
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, LlmProviderKind::Ollama)
    }

    /// Environment variable consulted when no api_key is configured.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProviderKind::Ollama => None,
            LlmProviderKind::Groq => Some("GROQ_API_KEY"),
            LlmProviderKind::Openrouter => Some("OPENROUTER_API_KEY"),
        }
    }
}

impl std::fmt::Display for LlmProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProviderKind::Ollama => write!(f, "ollama"),
            LlmProviderKind::Groq => write!(f, "groq"),
            LlmProviderKind::Openrouter => write!(f, "openrouter"),
        }
    }
}

/// LLM provider configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProviderKind,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub retries: u32,
    #[serde(default = "default_llm_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_llm_retries() -> u32 {
    1
}

fn default_llm_backoff_ms() -> u64 {
    500
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::default(),
            model: None,
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            retries: default_llm_retries(),
            backoff_ms: default_llm_backoff_ms(),
        }
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                self.provider
                    .api_key_env()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.trim().is_empty())
            })
    }
}

/// Pipeline wiring: which agent runs each stage and how long to wait for it.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PipelineConfig {
    #[serde(default = "default_data_miner_id")]
    pub data_miner_id: String,
    #[serde(default = "default_knowledge_graph_id")]
    pub knowledge_graph_id: String,
    #[serde(default = "default_answerer_id")]
    pub answerer_id: String,
    #[serde(default = "default_validator_id")]
    pub validator_id: String,
    #[serde(default = "default_writer_id")]
    pub writer_id: String,

    #[serde(default = "default_mining_timeout_secs")]
    pub mining_timeout_secs: u64,
    #[serde(default = "default_graph_timeout_secs")]
    pub graph_timeout_secs: u64,
    #[serde(default = "default_answer_timeout_secs")]
    pub answer_timeout_secs: u64,
    #[serde(default = "default_validate_timeout_secs")]
    pub validate_timeout_secs: u64,
    #[serde(default = "default_report_timeout_secs")]
    pub report_timeout_secs: u64,

    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_output_path")]
    pub output_path: String,
    #[serde(default = "default_max_sub_queries")]
    pub max_sub_queries: usize,
}

fn default_data_miner_id() -> String {
    "data_miner".to_string()
}

fn default_knowledge_graph_id() -> String {
    "knowledge_graph".to_string()
}

fn default_answerer_id() -> String {
    "lite_rag".to_string()
}

fn default_validator_id() -> String {
    "validator".to_string()
}

fn default_writer_id() -> String {
    "writer".to_string()
}

fn default_mining_timeout_secs() -> u64 {
    3600
}

fn default_graph_timeout_secs() -> u64 {
    3600
}

fn default_answer_timeout_secs() -> u64 {
    300
}

fn default_validate_timeout_secs() -> u64 {
    300
}

fn default_report_timeout_secs() -> u64 {
    1800
}

fn default_max_results() -> u32 {
    400
}

fn default_output_path() -> String {
    "report.pdf".to_string()
}

fn default_max_sub_queries() -> usize {
    5
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_miner_id: default_data_miner_id(),
            knowledge_graph_id: default_knowledge_graph_id(),
            answerer_id: default_answerer_id(),
            validator_id: default_validator_id(),
            writer_id: default_writer_id(),
            mining_timeout_secs: default_mining_timeout_secs(),
            graph_timeout_secs: default_graph_timeout_secs(),
            answer_timeout_secs: default_answer_timeout_secs(),
            validate_timeout_secs: default_validate_timeout_secs(),
            report_timeout_secs: default_report_timeout_secs(),
            max_results: default_max_results(),
            output_path: default_output_path(),
            max_sub_queries: default_max_sub_queries(),
        }
    }
}

impl PipelineConfig {
    pub fn agent_ids(&self) -> [&str; 5] {
        [
            &self.data_miner_id,
            &self.knowledge_graph_id,
            &self.answerer_id,
            &self.validator_id,
            &self.writer_id,
        ]
    }

    pub fn mining_timeout(&self) -> Duration {
        Duration::from_secs(self.mining_timeout_secs)
    }

    pub fn graph_timeout(&self) -> Duration {
        Duration::from_secs(self.graph_timeout_secs)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_secs(self.validate_timeout_secs)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }
}

/// Content store used by the reference agents.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StoreConfig {
    /// SQLite database path (default ~/.research-crew/crew.db)
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("crew.db")),
        }
    }
}

/// Reference data miner configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MinerConfig {
    /// URL templates; `{query}` is replaced with the encoded query
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_sources() -> Vec<String> {
    vec![
        "https://en.wikipedia.org/w/index.php?search={query}".to_string(),
        "https://html.duckduckgo.com/html/?q={query}".to_string(),
    ]
}

fn default_min_content_length() -> usize {
    200
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            min_content_length: default_min_content_length(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// research-crew settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub miner: MinerConfig,
}
