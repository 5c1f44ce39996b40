mod env;
mod types;


pub use types::*;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use strata_index::{IngestConfig, RetrievalConfig};
use strata_llm::EmbeddingConfig;
use strata_memory::metadata::validate_field_name;
use strata_memory::{Capabilities, FilterableFields, MetadataLimits};

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.embedding.dimension == Some(0) {
            bail!("embedding.dimension must be positive");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be positive");
        }
        if self.embedding.concurrency == 0 {
            bail!("embedding.concurrency must be positive");
        }
        if self.extract.max_declaration_lines == 0 {
            bail!("extract.max_declaration_lines must be positive");
        }
        if self.index.insert_batch_size == 0 {
            bail!("index.insert_batch_size must be positive");
        }
        let hnsw = &self.index.hnsw;
        if hnsw.m < 2 || hnsw.ef_construction == 0 || hnsw.ef_search == 0 {
            bail!("index.hnsw needs m >= 2 and positive ef values");
        }
        if self.index.qdrant.max_metadata_keys < 3 {
            bail!("index.qdrant.max_metadata_keys must leave room for content, attributes and chunk_id");
        }
        for field in &self.index.qdrant.filterable_fields {
            validate_field_name(field)
                .with_context(|| format!("index.qdrant.filterable_fields: `{field}`"))?;
        }
        self.retrieval_config()
            .validate()
            .context("invalid [retrieval] section")?;
        Ok(())
    }

    #[must_use]
    pub fn embedding_config(&self, dimension: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dimension,
            batch_size: self.embedding.batch_size,
            normalize: self.embedding.normalize,
            concurrency: self.embedding.concurrency,
            timeout: optional_secs(self.embedding.timeout_secs),
        }
    }

    #[must_use]
    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            insert_batch_size: self.index.insert_batch_size,
            metric: self.index.metric,
            hnsw: self.index.hnsw,
        }
    }

    #[must_use]
    pub fn retrieval_config(&self) -> RetrievalConfig {
        RetrievalConfig {
            top_k: self.retrieval.top_k,
            overfetch_factor: self.retrieval.overfetch_factor,
            max_candidates: self.retrieval.max_candidates,
            timeout: optional_secs(self.retrieval.timeout_secs),
            default_boosts: self.retrieval.boosts.clone(),
        }
    }

    /// Capabilities emulated on the Qdrant backend.
    #[must_use]
    pub fn qdrant_capabilities(&self) -> Capabilities {
        let q = &self.index.qdrant;
        Capabilities {
            filterable: FilterableFields::only(q.filterable_fields.iter().cloned()),
            limits: Some(MetadataLimits {
                max_keys: q.max_metadata_keys,
                max_filterable_bytes: q.max_filterable_bytes,
            }),
        }
    }

    #[must_use]
    pub fn index_timeout(&self) -> Option<Duration> {
        optional_secs(self.index.timeout_secs)
    }
}
