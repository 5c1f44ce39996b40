//! Pipeline bootstrap: config resolution, embedder and vector index construction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use strata_index::{HybridRetriever, Ingestor};
use strata_llm::ollama::OllamaEmbedder;
use strata_llm::openai::OpenAiEmbedder;
use strata_llm::provider::EmbeddingProvider;
use strata_llm::{AnyEmbedder, EmbeddingClient, known_dimension};
use strata_memory::{QdrantIndex, SqliteIndex, VectorIndex};

use crate::config::{BackendKind, Config, ProviderKind};

/// Priority: `--config` > `STRATA_CONFIG` > `config/default.toml`.
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("STRATA_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config/default.toml")
}

/// Load and validate the configuration.
///
/// # Errors
///
/// Returns an error if the file cannot be parsed or holds invalid values.
pub fn load_config(cli: Option<&Path>) -> anyhow::Result<Config> {
    let path = resolve_config_path(cli);
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Build the configured embedding provider.
///
/// # Errors
///
/// Returns an error if the provider cannot be constructed or is not compiled in.
pub fn create_embedder(config: &Config) -> anyhow::Result<AnyEmbedder> {
    let settings = &config.embedding;
    match settings.provider {
        ProviderKind::OpenAi => {
            let api_key = config
                .secrets
                .embedding_api_key
                .as_ref()
                .map(|s| s.expose().to_owned());
            if api_key.is_none() {
                tracing::warn!("no STRATA_EMBEDDING_API_KEY or OPENAI_API_KEY set");
            }
            let mut embedder = OpenAiEmbedder::new(
                api_key,
                settings.base_url.clone(),
                settings.model.clone(),
                Duration::from_secs(settings.timeout_secs.max(1)),
            )?;
            if let Some(dimension) = settings.dimension
                && known_dimension(&settings.model).is_some_and(|native| native != dimension)
            {
                embedder = embedder.with_dimensions(dimension);
            }
            Ok(AnyEmbedder::OpenAi(embedder))
        }
        ProviderKind::Ollama => Ok(AnyEmbedder::Ollama(OllamaEmbedder::new(
            &settings.base_url,
            settings.model.clone(),
        ))),
        #[cfg(feature = "mock")]
        ProviderKind::Mock => Ok(AnyEmbedder::Mock(strata_llm::mock::MockEmbedder::new(
            settings.dimension.unwrap_or(8),
        ))),
        #[allow(unreachable_patterns)]
        other => bail!("embedding provider {other} not available (feature not enabled)"),
    }
}

/// Vector length produced by `embedder`.
///
/// A configured dimension wins, then the table of known models. Anything else is
/// probed with one embedding call.
///
/// # Errors
///
/// Returns an error if the probe fails or returns an empty vector.
pub async fn resolve_dimension<P: EmbeddingProvider>(
    config: &Config,
    embedder: &P,
) -> anyhow::Result<usize> {
    if let Some(dimension) = config.embedding.dimension {
        return Ok(dimension);
    }
    if let Some(dimension) = known_dimension(embedder.model()) {
        return Ok(dimension);
    }
    tracing::info!(model = embedder.model(), "probing embedding dimension");
    let probe = embedder
        .embed_many(&["dimension probe".to_owned()])
        .await
        .context("embedding dimension probe failed")?;
    match probe.first().map(Vec::len) {
        Some(dimension) if dimension > 0 => Ok(dimension),
        _ => bail!("embedding dimension probe returned no vector"),
    }
}

/// Open the configured vector index.
///
/// # Errors
///
/// Returns an error if the backend cannot be opened or reached.
pub async fn create_index(config: &Config) -> anyhow::Result<Arc<dyn VectorIndex>> {
    let timeout = config.index_timeout();
    match config.index.backend {
        BackendKind::Sqlite => {
            let path = &config.index.sqlite.path;
            if path != ":memory:"
                && let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty())
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let index = SqliteIndex::open(path)
                .await
                .with_context(|| format!("opening sqlite index at {path}"))?
                .with_exact_scan_limit(config.index.sqlite.exact_scan_limit)
                .with_operation_timeout(timeout);
            Ok(Arc::new(index))
        }
        BackendKind::Qdrant => {
            let q = &config.index.qdrant;
            let index = QdrantIndex::open(&q.url, q.collection.clone())
                .await
                .with_context(|| format!("opening qdrant collection {} at {}", q.collection, q.url))?
                .with_capabilities(config.qdrant_capabilities())
                .with_operation_timeout(timeout);
            Ok(Arc::new(index))
        }
    }
}

/// Embedder and index wired together from one configuration.
pub struct Pipeline {
    config: Config,
    embedder: Arc<EmbeddingClient<AnyEmbedder>>,
    index: Arc<dyn VectorIndex>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("provider", &self.embedder.provider().name())
            .field("model", &self.embedder.provider().model())
            .field("dimension", &self.embedder.dimension())
            .field("backend", &self.index.backend())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Construct the embedder, resolve its dimension and open the index.
    ///
    /// # Errors
    ///
    /// Returns an error if any component cannot be built.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let provider = create_embedder(&config)?;
        let dimension = resolve_dimension(&config, &provider).await?;
        let index = create_index(&config).await?;
        tracing::info!(
            provider = provider.name(),
            model = provider.model(),
            dimension,
            backend = index.backend(),
            "pipeline ready"
        );
        let embedder = EmbeddingClient::new(Arc::new(provider), config.embedding_config(dimension));
        Ok(Self::from_parts(config, embedder, index))
    }

    #[must_use]
    pub fn from_parts(
        config: Config,
        embedder: EmbeddingClient<AnyEmbedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            config,
            embedder: Arc::new(embedder),
            index,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    #[must_use]
    pub fn embedder(&self) -> &Arc<EmbeddingClient<AnyEmbedder>> {
        &self.embedder
    }

    #[must_use]
    pub fn ingestor(&self) -> Ingestor<AnyEmbedder> {
        Ingestor::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.config.ingest_config(),
        )
    }

    /// # Errors
    ///
    /// Returns an error if the retrieval settings are invalid.
    pub fn retriever(&self) -> anyhow::Result<HybridRetriever<AnyEmbedder>> {
        Ok(HybridRetriever::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.config.retrieval_config(),
        )?)
    }
}
