use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Dimensionality of the embedding vectors produced by the configured model.
pub const EMBEDDING_DIM: usize = 384;

/// Estimated in-memory footprint of one indexed message: the vector
/// (4 bytes per dimension) plus metadata overhead.
pub const BYTES_PER_MESSAGE: usize = EMBEDDING_DIM * 4 + 1064;

/// Environment override for the memory limit, in megabytes.
pub const MEMORY_LIMIT_ENV: &str = "KIRO_RECALL_MEMORY_LIMIT_MB";

/// When set, disables the memory limit entirely.
pub const MEMORY_LIMIT_DISABLED_ENV: &str = "KIRO_RECALL_NO_MEMORY_LIMIT";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub cli: CliSourceConfig,
    #[serde(default)]
    pub ide: IdeSourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CliSourceConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cli_paths")]
    pub paths: Vec<String>,
}

impl Default for CliSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: default_cli_paths(),
        }
    }
}

impl CliSourceConfig {
    /// First configured database path that exists on disk.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.paths
            .iter()
            .map(|p| expand_tilde(p))
            .find(|p| p.exists())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdeSourceConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ide_patterns")]
    pub patterns: Vec<String>,
}

impl Default for IdeSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: default_ide_patterns(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Messages longer than this are dropped at load time to cap
    /// embedding cost on pathological inputs.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            cache_dir: default_cache_dir(),
            batch_size: default_batch_size(),
            max_content_length: default_max_content_length(),
        }
    }
}

impl EmbeddingConfig {
    pub fn cache_path(&self) -> PathBuf {
        expand_tilde(&self.cache_dir)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.cache_path().join("embeddings.bin")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.cache_path().join("embeddings.lock")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_threshold")]
    pub default_threshold: f32,
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
    #[serde(default = "default_context_window")]
    pub default_context_window: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_threshold(),
            default_max_results: default_max_results(),
            default_context_window: default_context_window(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    /// Fraction of physical RAM the index may use when no explicit
    /// limit is set.
    #[serde(default = "default_memory_fraction")]
    pub fraction: f64,
    #[serde(default)]
    pub limit_mb: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            fraction: default_memory_fraction(),
            limit_mb: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_cli_paths() -> Vec<String> {
    vec![
        "~/Library/Application Support/kiro-cli/data.sqlite3".to_string(),
        "~/.local/share/kiro-cli/data.sqlite3".to_string(),
        "~/AppData/Roaming/kiro-cli/data.sqlite3".to_string(),
    ]
}

fn default_ide_patterns() -> Vec<String> {
    vec![
        "~/Library/Application Support/Kiro/User/globalStorage/kiro.kiroagent/*/*.chat".to_string(),
        "~/.config/Kiro/User/globalStorage/kiro.kiroagent/*/*.chat".to_string(),
        "~/AppData/Roaming/Kiro/User/globalStorage/kiro.kiroagent/*/*.chat".to_string(),
    ]
}

fn default_model() -> String {
    "all-minilm-l6-v2".to_string()
}

fn default_cache_dir() -> String {
    "~/.cache/kiro-total-recall".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_max_content_length() -> usize {
    8192
}

fn default_threshold() -> f32 {
    0.2
}

fn default_max_results() -> usize {
    10
}

fn default_context_window() -> usize {
    3
}

fn default_memory_fraction() -> f64 {
    1.0 / 3.0
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

/// Default user config location: `~/.config/kiro-total-recall/config.toml`.
pub fn default_config_path() -> PathBuf {
    expand_tilde("~/.config/kiro-total-recall/config.toml")
}

/// Load and validate the configuration.
///
/// A missing file is not an error — defaults cover the standard install
/// locations of both stores. A file that exists but fails to parse or
/// validate is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if !(0.0..=1.0).contains(&config.search.default_threshold) {
        anyhow::bail!("search.default_threshold must be in [0.0, 1.0]");
    }
    if config.search.default_max_results < 1 {
        anyhow::bail!("search.default_max_results must be >= 1");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_content_length == 0 {
        anyhow::bail!("embedding.max_content_length must be > 0");
    }
    if !(0.0..=1.0).contains(&config.memory.fraction) || config.memory.fraction == 0.0 {
        anyhow::bail!("memory.fraction must be in (0.0, 1.0]");
    }
    if config.embedding.model.trim().is_empty() {
        anyhow::bail!("embedding.model must not be empty");
    }

    Ok(config)
}
