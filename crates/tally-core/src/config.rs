use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TallyError};

/// Top-level configuration for Tally.
///
/// Loaded from `~/.tally/config.toml` by default. Every section is optional
/// and falls back to its `Default`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl TallyConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TallyConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| TallyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Data directory with a leading `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    /// Resolve a configured file name against the data directory.
    ///
    /// Absolute paths are returned unchanged.
    pub fn resolve_file(&self, file: &str) -> PathBuf {
        let path = expand_home(file);
        if path.is_absolute() {
            path
        } else {
            self.data_dir().join(path)
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.resolve_file(&self.index.index_file)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.resolve_file(&self.index.metadata_file)
    }

    pub fn audit_db_path(&self) -> PathBuf {
        self.resolve_file(&self.audit.db_file)
    }
}

/// Expand `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the index, metadata and audit files.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.tally/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Vector index and metadata store files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Binary vector index file.
    pub index_file: String,
    /// JSON-lines metadata file.
    pub metadata_file: String,
    /// Number of results when the caller does not choose one.
    pub default_top_k: usize,
    /// Upper bound on requested results.
    pub max_top_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_file: "vectors.idx".to_string(),
            metadata_file: "metadata.jsonl".to_string(),
            default_top_k: 5,
            max_top_k: 100,
        }
    }
}

impl IndexConfig {
    /// Clamp a requested `k` to `max_top_k`, using the default when absent.
    pub fn effective_top_k(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_top_k).min(self.max_top_k)
    }
}

/// Embedding backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Backend: "mock" or "onnx".
    pub backend: String,
    /// Directory holding `model.onnx` and `tokenizer.json`.
    pub model_dir: String,
    /// Vector dimension for the mock backend.
    pub dimensions: usize,
    /// Timeout for a single embedding call.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: "mock".to_string(),
            model_dir: "~/.tally/models/all-MiniLM-L6-v2".to_string(),
            dimensions: 384,
            timeout_secs: 30,
        }
    }
}

/// Answer generator selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Backend: "extractive" or "openai".
    pub backend: String,
    /// Base URL of an OpenAI-compatible API (Ollama serves one under /v1).
    pub endpoint: String,
    /// Model name sent with each completion request.
    pub model: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    pub system_prompt: String,
    pub temperature: f32,
    /// Timeout for a single generation call.
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            backend: "extractive".to_string(),
            endpoint: "http://localhost:11434/v1".to_string(),
            model: "phi3:mini".to_string(),
            api_key: None,
            system_prompt: "You are a helpful financial assistant.".to_string(),
            temperature: 0.1,
            timeout_secs: 60,
        }
    }
}

/// Audit log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Record actions in SQLite. When false, actions only go to the tracing log.
    pub enabled: bool,
    pub db_file: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_file: "audit.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = TallyConfig::default();
        assert_eq!(config.general.data_dir, "~/.tally/data");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.index.index_file, "vectors.idx");
        assert_eq!(config.index.metadata_file, "metadata.jsonl");
        assert_eq!(config.index.default_top_k, 5);
        assert_eq!(config.embedding.backend, "mock");
        assert_eq!(config.embedding.dimensions, 384);
        assert_eq!(config.generator.backend, "extractive");
        assert!((config.generator.temperature - 0.1).abs() < f32::EPSILON);
        assert!(config.generator.api_key.is_none());
        assert!(config.audit.enabled);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[general]
data_dir = "/srv/tally"

[generator]
backend = "openai"
model = "llama3"
"#;
        let file = create_temp_config(content);
        let config = TallyConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/srv/tally");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.generator.backend, "openai");
        assert_eq!(config.generator.model, "llama3");
        assert_eq!(config.generator.endpoint, "http://localhost:11434/v1");
        assert_eq!(config.index.max_top_k, 100);
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        assert!(TallyConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = TallyConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.general.data_dir, "~/.tally/data");
    }

    #[test]
    fn test_load_missing_file_is_not_found() {
        match TallyConfig::load(Path::new("/nonexistent/config.toml")) {
            Err(TallyError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected not-found io error, got {:?}", other.map(|_| ())),
        }
        let file = create_temp_config("this is {{ not valid TOML");
        assert!(!matches!(
            TallyConfig::load(file.path()),
            Err(TallyError::Io(_))
        ));
    }

    #[test]
    fn test_save_creates_parent_dirs_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut config = TallyConfig::default();
        config.index.default_top_k = 7;
        config.generator.api_key = Some("secret".to_string());
        config.save(&path).unwrap();

        let reloaded = TallyConfig::load(&path).unwrap();
        assert_eq!(reloaded.index.default_top_k, 7);
        assert_eq!(reloaded.generator.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_resolve_file_relative_and_absolute() {
        let mut config = TallyConfig::default();
        config.general.data_dir = "/var/lib/tally".to_string();
        assert_eq!(
            config.index_path(),
            PathBuf::from("/var/lib/tally/vectors.idx")
        );

        config.index.metadata_file = "/elsewhere/meta.jsonl".to_string();
        assert_eq!(
            config.metadata_path(),
            PathBuf::from("/elsewhere/meta.jsonl")
        );
    }

    #[test]
    fn test_effective_top_k() {
        let index = IndexConfig::default();
        assert_eq!(index.effective_top_k(None), 5);
        assert_eq!(index.effective_top_k(Some(3)), 3);
        assert_eq!(index.effective_top_k(Some(1_000)), 100);
    }

    #[test]
    fn test_expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("/tmp/x"), PathBuf::from("/tmp/x"));
        assert_eq!(expand_home("rel/x"), PathBuf::from("rel/x"));
    }
}
