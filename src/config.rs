//! Configuration for replica

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default persona used when `REPLICA_PERSONA` is not set
pub const DEFAULT_PERSONA: &str = "You are replying to chat messages as the phone's owner. \
Reply EXACTLY as they would: same tone, vocabulary, slang, length and energy.

Rules:
1. Keep replies short unless the message genuinely needs detail
2. Match the energy of the incoming message
3. NEVER sound like a bot or an assistant; you ARE the person
4. Reply ONLY with the message text: no quotes, no \"Reply:\", no explanations
5. If you don't know something, say so casually instead of inventing facts
6. Use emojis sparingly and only the way the person does in the examples";

/// Configuration for the reply service
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Embedding model name (for reference, actual model set in embedding.rs)
    pub embedding_model: String,

    /// Embedding dimensions (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    /// Whether to embed and retrieve style exemplars at all
    pub rag_enabled: bool,

    /// Number of exemplars to retrieve per reply
    pub retrieval_top_k: usize,

    /// Exemplars at or below this relevance weight are never retrieved
    pub min_relevance_weight: f32,

    /// Number of recent turns fetched for context
    pub history_limit: usize,

    /// Token budget for recent turns in the prompt
    pub history_token_budget: u32,

    /// General persona instructions
    pub persona: String,

    /// OpenAI-compatible chat completions endpoint base
    pub llm_base_url: String,

    /// API key for the language-model provider
    pub llm_api_key: Option<String>,

    /// Model identifier sent to the provider
    pub llm_model: String,

    pub llm_temperature: f32,

    pub llm_max_tokens: u32,

    /// Retries after a transient language-model failure
    pub llm_max_retries: u32,

    pub embed_timeout: Duration,

    pub llm_timeout: Duration,

    /// Wall-clock bound for a whole reply, including waiting for the contact lock
    pub pipeline_timeout: Duration,

    /// Worker pool size for concurrent replies
    pub max_concurrent_replies: usize,

    /// Confidence reported when no exemplars back a reply
    pub base_confidence: f32,

    /// HTTP server bind address
    pub server_host: String,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("replica");

        Self {
            data_dir,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_dimensions: 384, // MiniLM-L6-v2 outputs 384-dim vectors
            rag_enabled: true,
            retrieval_top_k: 8,
            min_relevance_weight: 0.3,
            history_limit: 10,
            history_token_budget: 1500,
            persona: DEFAULT_PERSONA.to_string(),
            llm_base_url: "https://api.groq.com/openai/v1".to_string(),
            llm_api_key: None,
            llm_model: "llama-3.3-70b-versatile".to_string(),
            llm_temperature: 0.75,
            llm_max_tokens: 256,
            llm_max_retries: 1,
            embed_timeout: Duration::from_secs(5),
            llm_timeout: Duration::from_secs(30),
            pipeline_timeout: Duration::from_secs(60),
            max_concurrent_replies: 16,
            base_confidence: 0.35,
            server_host: "127.0.0.1".to_string(),
            server_port: 8000,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Build a config from defaults overlaid with environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("REPLICA_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup("REPLICA_HOST") {
            config.server_host = host;
        }
        if let Some(port) = lookup("REPLICA_PORT") {
            config.server_port = parse_var("REPLICA_PORT", &port)?;
        }
        config.llm_api_key = lookup("LLM_API_KEY")
            .or_else(|| lookup("GROQ_API_KEY"))
            .filter(|key| !key.trim().is_empty());
        if let Some(url) = lookup("LLM_BASE_URL") {
            config.llm_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = lookup("LLM_MODEL") {
            config.llm_model = model;
        }
        if let Some(temperature) = lookup("LLM_TEMPERATURE") {
            config.llm_temperature = parse_var("LLM_TEMPERATURE", &temperature)?;
        }
        if let Some(max_tokens) = lookup("LLM_MAX_TOKENS") {
            config.llm_max_tokens = parse_var("LLM_MAX_TOKENS", &max_tokens)?;
        }
        if let Some(disable) = lookup("DISABLE_RAG") {
            config.rag_enabled = !matches!(
                disable.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(persona) = lookup("REPLICA_PERSONA") {
            config.persona = persona;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimensions == 0 {
            return Err(Error::config("embedding_dimensions must be positive"));
        }
        if self.retrieval_top_k == 0 {
            return Err(Error::config("retrieval_top_k must be positive"));
        }
        if !(self.min_relevance_weight >= 0.0) {
            return Err(Error::config("min_relevance_weight must be non-negative"));
        }
        if self.max_concurrent_replies == 0 {
            return Err(Error::config("max_concurrent_replies must be positive"));
        }
        if !(0.0..=1.0).contains(&self.base_confidence) {
            return Err(Error::config("base_confidence must be within [0, 1]"));
        }
        Ok(())
    }

    /// The API key, or a configuration error if none was provided
    pub fn require_api_key(&self) -> Result<&str> {
        self.llm_api_key
            .as_deref()
            .ok_or_else(|| Error::config("LLM_API_KEY (or GROQ_API_KEY) is required"))
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("replica.db")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid value for {}: {:?}", key, value)))
}
