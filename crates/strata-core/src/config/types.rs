use std::fmt;

use serde::{Deserialize, Serialize};
use strata_index::{BoostConfig, ExtractConfig};
use strata_memory::{DistanceMetric, HnswParams, MetaKey};

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub extract: ExtractConfig,
    pub embedding: EmbeddingSettings,
    pub index: IndexSettings,
    pub retrieval: RetrievalSettings,
    #[serde(skip)]
    pub secrets: ResolvedSecrets,
}

/// Embedding provider selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Ollama,
    /// Deterministic in-process embedder, available with the `mock` feature.
    Mock,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_model() -> String {
    "text-embedding-3-small".into()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: ProviderKind,
    pub model: String,
    pub base_url: String,
    /// Vector size. Known models resolve automatically, others are probed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
    pub batch_size: usize,
    pub normalize: bool,
    pub concurrency: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: default_model(),
            base_url: default_base_url(),
            dimension: None,
            batch_size: 25,
            normalize: true,
            concurrency: 4,
            timeout_secs: 60,
        }
    }
}

/// Vector index backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Qdrant,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Qdrant => "qdrant",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexSettings {
    pub backend: BackendKind,
    pub metric: DistanceMetric,
    /// Per-operation deadline; 0 disables it.
    pub timeout_secs: u64,
    pub insert_batch_size: usize,
    pub hnsw: HnswParams,
    pub sqlite: SqliteSettings,
    pub qdrant: QdrantSettings,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            metric: DistanceMetric::default(),
            timeout_secs: 30,
            insert_batch_size: 100,
            hnsw: HnswParams::default(),
            sqlite: SqliteSettings::default(),
            qdrant: QdrantSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SqliteSettings {
    pub path: String,
    pub exact_scan_limit: usize,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            path: "data/strata.db".into(),
            exact_scan_limit: 1024,
        }
    }
}

fn default_filterable_fields() -> Vec<String> {
    [
        MetaKey::ChunkId,
        MetaKey::Module,
        MetaKey::FilePath,
        MetaKey::FileType,
        MetaKey::ChunkType,
        MetaKey::Layer,
        MetaKey::ClassName,
        MetaKey::Package,
    ]
    .iter()
    .map(|k| k.as_str().to_owned())
    .collect()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QdrantSettings {
    pub url: String,
    pub collection: String,
    pub max_metadata_keys: usize,
    pub max_filterable_bytes: usize,
    pub filterable_fields: Vec<String>,
}

impl Default for QdrantSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".into(),
            collection: "strata_chunks".into(),
            max_metadata_keys: 10,
            max_filterable_bytes: 2048,
            filterable_fields: default_filterable_fields(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub overfetch_factor: usize,
    pub max_candidates: usize,
    /// Bound on one retrieval call; 0 disables it.
    pub timeout_secs: u64,
    /// Default boosts, merged under per-query boosts.
    pub boosts: BoostConfig,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            overfetch_factor: 4,
            max_candidates: 200,
            timeout_secs: 30,
            boosts: BoostConfig::default(),
        }
    }
}

/// Wrapper for sensitive strings with redacted Debug/Display.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Credentials read from the environment, never from the config file.
#[derive(Debug, Default)]
pub struct ResolvedSecrets {
    pub embedding_api_key: Option<Secret>,
}
