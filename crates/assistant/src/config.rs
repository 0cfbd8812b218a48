use serde_yaml::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::rag::trigger::{TriggerRule, TriggerRules};
use crate::{Error, Result};

pub const DEFAULT_EMBEDDING_MODEL: &str = "embedding-3";
pub const DEFAULT_EMBEDDING_API_BASE: &str = "https://open.bigmodel.cn/api/paas/v4/embeddings";
/// Largest batch the embedding provider accepts in one request.
pub const MAX_EMBEDDING_BATCH: usize = 64;

/// Raw YAML settings addressed by dot-separated key paths, e.g. `rag.retrieval.top_k`.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    root: Option<Value>,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(raw)?;
        Ok(Self { root: Some(root) })
    }

    /// Look up a value by key path. Missing segments and non-mapping parents yield `None`.
    pub fn get(&self, key_path: &str) -> Option<&Value> {
        let mut value = self.root.as_ref()?;
        for key in key_path.split('.') {
            value = value.as_mapping()?.get(key)?;
        }
        if value.is_null() {
            None
        } else {
            Some(value)
        }
    }

    pub fn get_string(&self, key_path: &str) -> Option<String> {
        match self.get(key_path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_u64(&self, key_path: &str) -> Result<Option<u64>> {
        match self.get(key_path) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| Error::Config(format!("{} must be a non-negative integer", key_path))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::Config(format!("{} must be a non-negative integer", key_path))),
            Some(_) => Err(Error::Config(format!("{} must be a non-negative integer", key_path))),
        }
    }

    pub fn get_bool(&self, key_path: &str) -> Result<Option<bool>> {
        match self.get(key_path) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => parse_bool(s)
                .map(Some)
                .ok_or_else(|| Error::Config(format!("{} must be a boolean", key_path))),
            Some(_) => Err(Error::Config(format!("{} must be a boolean", key_path))),
        }
    }

    fn get_usize(&self, key_path: &str) -> Result<Option<usize>> {
        Ok(self.get_u64(key_path)?.map(|v| v as usize))
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has an invalid value: {}", name, raw))),
    }
}

#[derive(Clone)]
pub struct EmbeddingConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub api_base: String,
    pub dimensions: Option<u32>,
    pub batch_size: usize,
    pub request_delay: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            api_base: DEFAULT_EMBEDDING_API_BASE.to_string(),
            dimensions: None,
            batch_size: 10,
            request_delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("dimensions", &self.dimensions)
            .field("batch_size", &self.batch_size)
            .field("request_delay", &self.request_delay)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub max_attempts: u32,
    /// Base wait between attempts on the same batch; attempt `n` waits `n * retry_wait`.
    pub retry_wait: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay: Duration::from_millis(500),
            max_attempts: 3,
            retry_wait: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentsConfig {
    pub dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/knowledge"),
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub enabled: bool,
    /// Length above which a final answer without tool calls triggers retrieval. `None` disables it.
    pub min_answer_chars: Option<usize>,
    pub rules: TriggerRules,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_answer_chars: Some(100),
            rules: TriggerRules::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub embedding: EmbeddingConfig,
    pub store: StoreConfig,
    pub documents: DocumentsConfig,
    pub top_k: usize,
    pub trigger: TriggerConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            store: StoreConfig::default(),
            documents: DocumentsConfig::default(),
            top_k: 4,
            trigger: TriggerConfig::default(),
        }
    }
}

impl RagConfig {
    /// Load from an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let settings = match path {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };

        let mut config = Self::from_settings(&settings)?;
        config.apply_env_overrides()?;
        config.validate()?;

        if config.embedding.api_key.is_none() {
            tracing::warn!(
                "rag.embedding.api_key / EMBEDDING_API_KEY is not set. Knowledge-base ingestion will fail."
            );
        }

        Ok(config)
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let defaults = Self::default();

        let embedding = EmbeddingConfig {
            api_key: settings.get_string("rag.embedding.api_key").filter(|k| !k.is_empty()),
            model: settings
                .get_string("rag.embedding.model")
                .unwrap_or(defaults.embedding.model),
            api_base: settings
                .get_string("rag.embedding.api_base")
                .unwrap_or(defaults.embedding.api_base),
            dimensions: settings.get_u64("rag.embedding.dimensions")?.map(|d| d as u32),
            batch_size: settings
                .get_usize("rag.embedding.batch_size")?
                .unwrap_or(defaults.embedding.batch_size),
            request_delay: settings
                .get_u64("rag.embedding.request_delay_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.embedding.request_delay),
            timeout: settings
                .get_u64("rag.embedding.timeout_secs")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.embedding.timeout),
            max_retries: settings
                .get_u64("rag.embedding.max_retries")?
                .map(|r| r as u32)
                .unwrap_or(defaults.embedding.max_retries),
        };

        let store = StoreConfig {
            batch_size: settings
                .get_usize("rag.store.batch_size")?
                .unwrap_or(defaults.store.batch_size),
            batch_delay: settings
                .get_u64("rag.store.batch_delay_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.store.batch_delay),
            max_attempts: settings
                .get_u64("rag.store.max_attempts")?
                .map(|a| a as u32)
                .unwrap_or(defaults.store.max_attempts),
            retry_wait: defaults.store.retry_wait,
        };

        let documents = DocumentsConfig {
            dir: settings
                .get_string("rag.documents.dir")
                .map(PathBuf::from)
                .unwrap_or(defaults.documents.dir),
            chunk_size: settings
                .get_usize("rag.documents.chunk_size")?
                .unwrap_or(defaults.documents.chunk_size),
            chunk_overlap: settings
                .get_usize("rag.documents.chunk_overlap")?
                .unwrap_or(defaults.documents.chunk_overlap),
        };

        let trigger = TriggerConfig {
            enabled: settings
                .get_bool("rag.trigger.enabled")?
                .unwrap_or(defaults.trigger.enabled),
            min_answer_chars: match settings.get_usize("rag.trigger.min_answer_chars")? {
                Some(0) => None,
                Some(n) => Some(n),
                None => defaults.trigger.min_answer_chars,
            },
            rules: match settings.get("rag.trigger.phrases") {
                Some(value) => parse_trigger_phrases(value)?,
                None => defaults.trigger.rules,
            },
        };

        Ok(Self {
            embedding,
            store,
            documents,
            top_k: settings
                .get_usize("rag.retrieval.top_k")?
                .unwrap_or(defaults.top_k),
            trigger,
        })
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(key) = env_var("EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(key);
        }
        if let Some(model) = env_var("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(api_base) = env_var("EMBEDDING_API_BASE") {
            self.embedding.api_base = api_base;
        }
        if let Some(dimensions) = env_parse("EMBEDDING_DIMENSIONS")? {
            self.embedding.dimensions = Some(dimensions);
        }
        if let Some(batch_size) = env_parse("EMBEDDING_BATCH_SIZE")? {
            self.embedding.batch_size = batch_size;
        }
        if let Some(delay_ms) = env_parse("EMBEDDING_REQUEST_DELAY_MS")? {
            self.embedding.request_delay = Duration::from_millis(delay_ms);
        }
        if let Some(batch_size) = env_parse("RAG_STORE_BATCH_SIZE")? {
            self.store.batch_size = batch_size;
        }
        if let Some(dir) = env_var("RAG_DOCUMENTS_DIR") {
            self.documents.dir = PathBuf::from(dir);
        }
        if let Some(chunk_size) = env_parse("RAG_CHUNK_SIZE")? {
            self.documents.chunk_size = chunk_size;
        }
        if let Some(chunk_overlap) = env_parse("RAG_CHUNK_OVERLAP")? {
            self.documents.chunk_overlap = chunk_overlap;
        }
        if let Some(top_k) = env_parse("RAG_TOP_K")? {
            self.top_k = top_k;
        }
        if let Some(raw) = env_var("RAG_TRIGGER_ENABLED") {
            self.trigger.enabled = parse_bool(&raw).ok_or_else(|| {
                Error::Config(format!("RAG_TRIGGER_ENABLED has an invalid value: {}", raw))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.documents.chunk_size == 0 {
            return Err(Error::Config("rag.documents.chunk_size must be positive".to_string()));
        }
        if self.documents.chunk_overlap >= self.documents.chunk_size {
            return Err(Error::Config(format!(
                "rag.documents.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.documents.chunk_overlap, self.documents.chunk_size
            )));
        }
        if self.embedding.batch_size == 0 || self.store.batch_size == 0 {
            return Err(Error::Config("batch sizes must be positive".to_string()));
        }
        if self.store.max_attempts == 0 {
            return Err(Error::Config("rag.store.max_attempts must be at least 1".to_string()));
        }
        if self.top_k == 0 {
            return Err(Error::Config("rag.retrieval.top_k must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Accepts either a list of phrases (all enabled) or a `phrase: bool` mapping.
fn parse_trigger_phrases(value: &Value) -> Result<TriggerRules> {
    let rules = match value {
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|phrase| TriggerRule::new(phrase, true))
                    .ok_or_else(|| Error::Config("rag.trigger.phrases entries must be strings".to_string()))
            })
            .collect::<Result<Vec<_>>>()?,
        Value::Mapping(map) => map
            .iter()
            .map(|(k, v)| match (k.as_str(), v.as_bool()) {
                (Some(phrase), Some(enabled)) => Ok(TriggerRule::new(phrase, enabled)),
                _ => Err(Error::Config(
                    "rag.trigger.phrases must map phrases to booleans".to_string(),
                )),
            })
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(Error::Config(
                "rag.trigger.phrases must be a list or a mapping".to_string(),
            ))
        }
    };
    Ok(TriggerRules::default().with_phrases(rules))
}
