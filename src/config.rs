use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::segment::HeadingLevel;
use crate::storage::{BackendLocal, StorageManager};
use crate::store::{DEFAULT_DIMENSIONS, DEFAULT_INDEX_NAME, DEFAULT_MAX_ELEMENTS};

pub const CONFIG_FILE: &str = "config.yaml";

/// Environment variable overriding the data directory
pub const BASE_PATH_ENV: &str = "NOTEBLOCKS_BASE_PATH";

const DEFAULT_HEADING_MARKER: &str = "###";
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_TOP_K: usize = 10;

/// Default embedding model
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_EMBEDDING_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
/// Request timeout for the embedding API in seconds
const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 60;

/// Remote embedding service settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name sent with every request
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            base_url: DEFAULT_EMBEDDING_BASE_URL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            timeout_secs: DEFAULT_EMBEDDING_TIMEOUT_SECS,
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_embedding_base_url() -> String {
    DEFAULT_EMBEDDING_BASE_URL.to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_embedding_timeout_secs() -> u64 {
    DEFAULT_EMBEDDING_TIMEOUT_SECS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Heading run that starts a new block, e.g. "###"
    #[serde(default = "default_heading_marker")]
    pub heading_marker: String,

    /// File name of the binary vector index
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /// Embedding dimensionality, fixed for the lifetime of an index
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Vector index capacity
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,

    /// Documents indexed concurrently per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Default number of related blocks returned
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heading_marker: DEFAULT_HEADING_MARKER.to_string(),
            index_name: DEFAULT_INDEX_NAME.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            max_elements: DEFAULT_MAX_ELEMENTS,
            batch_size: DEFAULT_BATCH_SIZE,
            top_k: DEFAULT_TOP_K,
            embedding: EmbeddingConfig::default(),
            base_path: String::new(),
        }
    }
}

fn default_heading_marker() -> String {
    DEFAULT_HEADING_MARKER.to_string()
}

fn default_index_name() -> String {
    DEFAULT_INDEX_NAME.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_max_elements() -> usize {
    DEFAULT_MAX_ELEMENTS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

/// Data directory: `NOTEBLOCKS_BASE_PATH`, else `~/.local/share/noteblocks`.
pub fn default_base_path() -> anyhow::Result<String> {
    if let Ok(path) = std::env::var(BASE_PATH_ENV) {
        return Ok(path);
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(format!("{}/.local/share/noteblocks", home.to_string_lossy()))
}

impl Config {
    fn validate(&mut self) -> anyhow::Result<()> {
        // normalize the marker so a hand-edited "### " or "h3" still saves cleanly
        self.heading_marker = self.heading_level().marker();

        if self.index_name.trim().is_empty() {
            bail!("index_name must not be empty");
        }
        if self.index_name.contains(&['/', '\\'][..]) {
            bail!("index_name must be a file name, got '{}'", self.index_name);
        }
        if self.dimensions == 0 {
            bail!("dimensions must be greater than 0");
        }
        if self.max_elements == 0 {
            bail!("max_elements must be greater than 0");
        }
        if self.batch_size == 0 {
            self.batch_size = 1
        }
        if self.top_k == 0 {
            bail!("top_k must be greater than 0");
        }
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }
        if !self.embedding.base_url.starts_with("http://")
            && !self.embedding.base_url.starts_with("https://")
        {
            bail!(
                "embedding.base_url must be an http(s) URL, got '{}'",
                self.embedding.base_url
            );
        }
        if self.embedding.timeout_secs == 0 {
            bail!("embedding.timeout_secs must be greater than 0");
        }

        Ok(())
    }

    pub fn heading_level(&self) -> HeadingLevel {
        HeadingLevel::from_marker(&self.heading_marker)
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(&default_base_path()?)
    }

    pub fn load_with(base_path: &str) -> anyhow::Result<Self> {
        let store = BackendLocal::new(base_path)
            .with_context(|| format!("failed to create data directory {base_path}"))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }
}
