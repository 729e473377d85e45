//! TOML configuration.
//!
//! Every section has defaults, so an empty file (or [`Config::default`]) is a
//! valid configuration that keeps all state under `./data` and uses the local
//! embedding model with no generation backend.
//!
//! ```toml
//! [data]
//! dir = "./data"
//!
//! [chunking]
//! size = 800
//! overlap = 120
//!
//! [embedding]
//! provider = "local"          # local | openai | hash | disabled
//!
//! [generation]
//! provider = "gemini"
//! api_key_env = "GOOGLE_API_KEY"
//!
//! [mirror]                    # optional, best-effort S3 copy of the index
//! bucket = "my-index"
//! region = "us-east-1"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mirror: Option<MirrorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl DataConfig {
    pub fn index_path(&self) -> PathBuf {
        self.dir.join("index.bin")
    }
    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join("metadata.json")
    }
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }
    pub fn jobs_path(&self) -> PathBuf {
        self.dir.join("jobs.json")
    }
    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join("metrics.jsonl")
    }
    pub fn uploads_dir(&self) -> PathBuf {
        self.dir.join("uploads")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_max_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            api_key_env: default_api_key_env(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "gemini".to_string()
}
fn default_generation_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_api_key_env() -> String {
    "GOOGLE_API_KEY".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}

impl GenerationConfig {
    /// The API key, if the configured variable is set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7860".to_string()
}

/// S3 (or S3-compatible) bucket that receives a copy of the index files.
#[derive(Debug, Deserialize, Clone)]
pub struct MirrorConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for MinIO, LocalStack, etc.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Config {
    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.size == 0 {
            bail!("chunking.size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.size {
            bail!(
                "chunking.overlap ({}) must be smaller than chunking.size ({})",
                self.chunking.overlap,
                self.chunking.size
            );
        }
        if self.retrieval.top_k == 0 || self.retrieval.top_k > self.retrieval.max_top_k {
            bail!(
                "retrieval.top_k must be in [1, {}]",
                self.retrieval.max_top_k
            );
        }
        if self.generation.max_attempts == 0 {
            bail!("generation.max_attempts must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "local" | "hash" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, local, or hash.",
                other
            ),
        }
        if self.embedding.provider == "openai" && self.embedding.model.is_none() {
            bail!("embedding.model must be specified when provider is 'openai'");
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }

        match self.generation.provider.as_str() {
            "gemini" | "disabled" => {}
            other => bail!(
                "Unknown generation provider: '{}'. Must be gemini or disabled.",
                other
            ),
        }

        if let Some(ref mirror) = self.mirror {
            if mirror.bucket.trim().is_empty() {
                bail!("mirror.bucket must not be empty");
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Load the config if the file exists, otherwise fall back to defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.chunking.size, 800);
        assert_eq!(config.chunking.overlap, 120);
        assert_eq!(config.retrieval.top_k, 4);
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.generation.max_attempts, 3);
        assert!(config.mirror.is_none());
        assert_eq!(
            config.data.metadata_path(),
            PathBuf::from("./data/metadata.json")
        );
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let config: Config = toml::from_str("[chunking]\nsize = 100\noverlap = 100\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn unknown_embedding_provider_rejected() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"magic\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn mirror_section_parses() {
        let config: Config =
            toml::from_str("[mirror]\nbucket = \"b\"\nprefix = \"idx/\"\n").unwrap();
        config.validate().unwrap();
        let mirror = config.mirror.unwrap();
        assert_eq!(mirror.region, "us-east-1");
        assert_eq!(mirror.prefix, "idx/");
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/docqa.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
