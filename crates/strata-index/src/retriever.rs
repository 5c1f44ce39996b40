//! Hybrid retrieval: query embedding, filtered vector search, boost reranking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_llm::{EmbeddingClient, EmbeddingProvider, l2_normalize};
use strata_memory::{
    DistanceMetric, Metadata, MetadataFilter, RecordId, SearchHit, VectorIndex, VectorIndexError,
};

use crate::error::{IndexError, Result};

/// Per-field boost multipliers: `field -> value -> factor`.
///
/// Unmatched fields and values are neutral (1.0).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoostConfig(BTreeMap<String, BTreeMap<String, f32>>);

impl BoostConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>, factor: f32) -> Self {
        self.insert(field, value, factor);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>, factor: f32) {
        self.0
            .entry(field.into())
            .or_default()
            .insert(value.into(), factor);
    }

    /// Parse `field=value:factor` specs.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Other`] for a malformed spec or a negative or non-finite
    /// factor.
    pub fn from_specs<I, S>(specs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut boosts = Self::new();
        for spec in specs {
            let spec = spec.as_ref();
            let malformed = || IndexError::Other(format!("boost `{spec}` is not field=value:factor"));
            let (field, rest) = spec.split_once('=').ok_or_else(malformed)?;
            let (value, factor) = rest.rsplit_once(':').ok_or_else(malformed)?;
            let factor: f32 = factor.trim().parse().map_err(|_| malformed())?;
            if field.trim().is_empty() || !factor.is_finite() || factor < 0.0 {
                return Err(malformed());
            }
            boosts.insert(field.trim(), value.trim(), factor);
        }
        Ok(boosts)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    /// Entries of `self` override those of `defaults` for the same field and value.
    #[must_use]
    pub fn merged_over(&self, defaults: &Self) -> Self {
        let mut merged = defaults.clone();
        for (field, values) in &self.0 {
            let slot = merged.0.entry(field.clone()).or_default();
            for (value, factor) in values {
                slot.insert(value.clone(), *factor);
            }
        }
        merged
    }

    /// Product over configured fields of the multiplier matching `metadata`.
    ///
    /// A list-valued field contributes the largest multiplier among its matching
    /// elements. Integers and booleans match on their rendering.
    #[must_use]
    pub fn multiplier(&self, metadata: &Metadata) -> f32 {
        self.0
            .iter()
            .filter_map(|(field, values)| {
                let candidates = metadata.field(field)?.match_candidates();
                candidates
                    .iter()
                    .filter_map(|c| values.get(c).copied())
                    .reduce(f32::max)
            })
            .product()
    }
}

/// Stage of a retrieval call, logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalPhase {
    Idle,
    EmbeddingQuery,
    Searching,
    Reranking,
    Done,
}

impl RetrievalPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::EmbeddingQuery => "embedding-query",
            Self::Searching => "searching",
            Self::Reranking => "reranking",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for RetrievalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieval configuration.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Results returned when a request does not say (default: 5).
    pub top_k: usize,
    /// Candidate multiplier applied when boosts are present, within 3..=5 (default: 4).
    pub overfetch_factor: usize,
    /// Upper bound on fetched candidates (default: 200).
    pub max_candidates: usize,
    /// Bound on a whole retrieval call.
    pub timeout: Option<Duration>,
    /// Boosts applied to every request, overridden by per-request boosts.
    pub default_boosts: BoostConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            overfetch_factor: 4,
            max_candidates: 200,
            timeout: None,
            default_boosts: BoostConfig::default(),
        }
    }
}

impl RetrievalConfig {
    /// # Errors
    ///
    /// Returns [`IndexError::Other`] if `overfetch_factor` is outside 3..=5.
    pub fn validate(&self) -> Result<()> {
        if !(3..=5).contains(&self.overfetch_factor) {
            return Err(IndexError::Other(format!(
                "overfetch_factor must be within 3..=5, got {}",
                self.overfetch_factor
            )));
        }
        Ok(())
    }
}

/// One retrieval query.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    pub filter: Option<MetadataFilter>,
    pub boosts: BoostConfig,
}

impl SearchRequest {
    #[must_use]
    pub fn new(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            top_k,
            filter: None,
            boosts: BoostConfig::default(),
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = (!filter.is_empty()).then_some(filter);
        self
    }

    #[must_use]
    pub fn with_boosts(mut self, boosts: BoostConfig) -> Self {
        self.boosts = boosts;
        self
    }
}

/// A reranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub id: RecordId,
    pub content: String,
    pub metadata: Metadata,
    /// Semantic score from the index.
    pub similarity: f32,
    /// Final rank score after boosts.
    pub boosted_similarity: f32,
}

/// Apply `boosts` to `hits` and keep the best `top_k`.
///
/// The sort is stable, so equal scores keep the index order.
#[must_use]
pub fn rerank(hits: Vec<SearchHit>, boosts: &BoostConfig, top_k: usize) -> Vec<RankedResult> {
    let mut ranked: Vec<RankedResult> = hits
        .into_iter()
        .map(|hit| {
            let boosted_similarity = hit.similarity * boosts.multiplier(&hit.metadata);
            RankedResult {
                id: hit.id,
                content: hit.content,
                metadata: hit.metadata,
                similarity: hit.similarity,
                boosted_similarity,
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.boosted_similarity.total_cmp(&a.boosted_similarity));
    ranked.truncate(top_k);
    ranked
}

/// Stateless hybrid retriever over a vector index.
pub struct HybridRetriever<P> {
    embedder: Arc<EmbeddingClient<P>>,
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
}

impl<P> fmt::Debug for HybridRetriever<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridRetriever")
            .field("backend", &self.index.backend())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: EmbeddingProvider> HybridRetriever<P> {
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(
        embedder: Arc<EmbeddingClient<P>>,
        index: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            embedder,
            index,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Number of candidates requested from the index.
    #[must_use]
    pub fn candidate_count(&self, top_k: usize, boosted: bool) -> usize {
        if !boosted {
            return top_k;
        }
        top_k
            .saturating_mul(self.config.overfetch_factor)
            .min(self.config.max_candidates)
            .max(top_k)
    }

    /// Run one retrieval.
    ///
    /// An empty result is a valid answer, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding or the index search fails, or
    /// [`IndexError::Timeout`] if the configured timeout elapses.
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<RankedResult>> {
        log_phase(RetrievalPhase::Idle);
        if request.top_k == 0 {
            log_phase(RetrievalPhase::Done);
            return Ok(Vec::new());
        }
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(request))
                .await
                .map_err(|_| IndexError::Timeout(limit))?,
            None => self.run(request).await,
        }
    }

    async fn run(&self, request: SearchRequest) -> Result<Vec<RankedResult>> {
        let params = self.index.params().ok_or(VectorIndexError::NotConfigured)?;
        let boosts = request.boosts.merged_over(&self.config.default_boosts);

        log_phase(RetrievalPhase::EmbeddingQuery);
        let mut query = self.embedder.embed(&request.query).await?;
        if params.metric == DistanceMetric::Cosine {
            l2_normalize(&mut query);
        }

        let candidates = self.candidate_count(request.top_k, !boosts.is_empty());
        tracing::debug!(
            phase = %RetrievalPhase::Searching,
            top_k = request.top_k,
            candidates,
            filtered = request.filter.is_some(),
            "retrieval phase"
        );
        let hits = self.index.search(query, candidates, request.filter).await?;

        tracing::debug!(
            phase = %RetrievalPhase::Reranking,
            hits = hits.len(),
            "retrieval phase"
        );
        let ranked = rerank(hits, &boosts, request.top_k);

        log_phase(RetrievalPhase::Done);
        Ok(ranked)
    }
}

fn log_phase(phase: RetrievalPhase) {
    tracing::debug!(phase = %phase, "retrieval phase");
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use strata_llm::EmbeddingConfig;
    use strata_llm::mock::MockEmbedder;
    use strata_memory::{IndexParams, InMemoryIndex, MetaKey, NewRecord};

    use super::*;

    fn meta(id: &str, layer: &str) -> Metadata {
        Metadata::new()
            .with(MetaKey::ChunkId, id)
            .with(MetaKey::Layer, layer)
    }

    fn hit(id: &str, layer: &str, similarity: f32) -> SearchHit {
        SearchHit {
            id: RecordId(id.to_owned()),
            content: id.to_owned(),
            metadata: meta(id, layer),
            embedding: Vec::new(),
            similarity,
        }
    }

    async fn setup(
        mock: MockEmbedder,
        records: Vec<NewRecord>,
        config: RetrievalConfig,
    ) -> (HybridRetriever<MockEmbedder>, Arc<MockEmbedder>) {
        let dimension = mock.dimension;
        let index = InMemoryIndex::new();
        index.configure(IndexParams::new(dimension)).await.unwrap();
        let report = index.insert_batch(records).await.unwrap();
        assert_eq!(report.failed(), 0);
        let mock = Arc::new(mock);
        let client = EmbeddingClient::new(Arc::clone(&mock), EmbeddingConfig::new(dimension));
        let retriever = HybridRetriever::new(Arc::new(client), Arc::new(index), config).unwrap();
        (retriever, mock)
    }

    fn scenario_records() -> Vec<NewRecord> {
        vec![
            NewRecord::new("svc", vec![0.8, 0.6], meta("svc", "service")),
            NewRecord::new("ctl", vec![0.85, 0.526_78], meta("ctl", "controller")),
        ]
    }

    fn query_embedder() -> MockEmbedder {
        MockEmbedder::new(2).with_vector("find orders", vec![1.0, 0.0])
    }

    #[tokio::test]
    async fn service_boost_reorders_results() {
        let (retriever, _) =
            setup(query_embedder(), scenario_records(), RetrievalConfig::default()).await;

        let plain = retriever
            .search(SearchRequest::new("find orders", 2))
            .await
            .unwrap();
        assert_eq!(plain[0].id.as_str(), "ctl");

        let boosted = retriever
            .search(
                SearchRequest::new("find orders", 2)
                    .with_boosts(BoostConfig::new().with("layer", "service", 1.5)),
            )
            .await
            .unwrap();
        assert_eq!(boosted[0].id.as_str(), "svc");
        assert!((boosted[0].similarity - 0.80).abs() < 1e-4);
        assert!((boosted[0].boosted_similarity - 1.20).abs() < 1e-4);
        assert!((boosted[1].boosted_similarity - 0.85).abs() < 1e-4);
        assert!((boosted[1].similarity - boosted[1].boosted_similarity).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn filter_selects_the_single_controller() {
        let (retriever, _) =
            setup(query_embedder(), scenario_records(), RetrievalConfig::default()).await;
        let results = retriever
            .search(
                SearchRequest::new("find orders", 10)
                    .with_filter(MetadataFilter::new().text_eq("layer", "controller")),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id.as_str(), "ctl");
    }

    #[tokio::test]
    async fn zero_top_k_skips_embedding() {
        let (retriever, mock) =
            setup(query_embedder(), scenario_records(), RetrievalConfig::default()).await;
        assert!(
            retriever
                .search(SearchRequest::new("find orders", 0))
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn no_match_is_an_empty_result() {
        let (retriever, _) =
            setup(query_embedder(), scenario_records(), RetrievalConfig::default()).await;
        let results = retriever
            .search(
                SearchRequest::new("find orders", 3)
                    .with_filter(MetadataFilter::new().text_eq("layer", "repository")),
            )
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_index_is_an_error() {
        let client = EmbeddingClient::new(Arc::new(query_embedder()), EmbeddingConfig::new(2));
        let retriever = HybridRetriever::new(
            Arc::new(client),
            Arc::new(InMemoryIndex::new()),
            RetrievalConfig::default(),
        )
        .unwrap();
        let err = retriever
            .search(SearchRequest::new("find orders", 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::VectorIndex(VectorIndexError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn slow_embedding_times_out() {
        let config = RetrievalConfig {
            timeout: Some(Duration::from_millis(20)),
            ..RetrievalConfig::default()
        };
        let (retriever, _) = setup(query_embedder().with_delay(500), scenario_records(), config).await;
        let err = retriever
            .search(SearchRequest::new("find orders", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Timeout(_)));
    }

    #[tokio::test]
    async fn default_boosts_apply_and_yield_to_request_boosts() {
        let config = RetrievalConfig {
            default_boosts: BoostConfig::new().with("layer", "service", 1.5),
            ..RetrievalConfig::default()
        };
        let (retriever, _) = setup(query_embedder(), scenario_records(), config).await;

        let results = retriever
            .search(SearchRequest::new("find orders", 2))
            .await
            .unwrap();
        assert_eq!(results[0].id.as_str(), "svc");

        let results = retriever
            .search(
                SearchRequest::new("find orders", 2)
                    .with_boosts(BoostConfig::new().with("layer", "service", 1.0)),
            )
            .await
            .unwrap();
        assert_eq!(results[0].id.as_str(), "ctl");
    }

    #[test]
    fn candidate_count_overfetches_only_with_boosts() {
        let client = EmbeddingClient::new(Arc::new(query_embedder()), EmbeddingConfig::new(2));
        let retriever = HybridRetriever::new(
            Arc::new(client),
            Arc::new(InMemoryIndex::new()),
            RetrievalConfig {
                max_candidates: 30,
                ..RetrievalConfig::default()
            },
        )
        .unwrap();
        assert_eq!(retriever.candidate_count(5, false), 5);
        assert_eq!(retriever.candidate_count(5, true), 20);
        assert_eq!(retriever.candidate_count(10, true), 30);
        assert_eq!(retriever.candidate_count(50, true), 50);
    }

    #[test]
    fn overfetch_factor_is_validated() {
        for factor in [2, 6] {
            let config = RetrievalConfig {
                overfetch_factor: factor,
                ..RetrievalConfig::default()
            };
            assert!(config.validate().is_err());
        }
        assert!(RetrievalConfig::default().validate().is_ok());
    }

    #[test]
    fn list_fields_use_the_best_matching_boost() {
        let boosts = BoostConfig::new()
            .with("annotations", "@Transactional", 1.2)
            .with("annotations", "@Service", 1.5)
            .with("layer", "service", 2.0);
        let metadata = Metadata::new()
            .with(
                MetaKey::Annotations,
                vec!["@Service".to_owned(), "@Transactional".to_owned()],
            )
            .with(MetaKey::Layer, "service");
        assert!((boosts.multiplier(&metadata) - 3.0).abs() < 1e-6);
        assert!((boosts.multiplier(&Metadata::new()) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn integer_fields_match_on_rendering() {
        let boosts = BoostConfig::new().with("heading_level", "1", 2.0);
        let metadata = Metadata::new().with(MetaKey::HeadingLevel, 1_i64);
        assert!((boosts.multiplier(&metadata) - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn parse_boost_specs() {
        let boosts = BoostConfig::from_specs(["layer=service:1.5", "api_path=/a:b:2"]).unwrap();
        assert_eq!(
            boosts,
            BoostConfig::new()
                .with("layer", "service", 1.5)
                .with("api_path", "/a:b", 2.0)
        );
        assert!(BoostConfig::from_specs(["layer"]).is_err());
        assert!(BoostConfig::from_specs(["layer=service"]).is_err());
        assert!(BoostConfig::from_specs(["layer=service:-1"]).is_err());
        assert!(BoostConfig::from_specs(["=x:1"]).is_err());
    }

    #[test]
    fn rerank_ties_keep_index_order() {
        let hits = vec![hit("a", "x", 0.5), hit("b", "x", 0.5), hit("c", "x", 0.5)];
        let ids: Vec<_> = rerank(hits, &BoostConfig::new(), 3)
            .into_iter()
            .map(|r| r.id.0)
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    fn layer_strategy() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec!["controller", "service", "repository", "other"])
    }

    proptest! {
        #[test]
        fn rerank_is_ordered_and_bounded(
            sims in prop::collection::vec((0.0f32..1.0, layer_strategy()), 0..40),
            factor in 0.5f32..3.0,
            top_k in 0usize..50,
        ) {
            let mut hits: Vec<SearchHit> = sims
                .iter()
                .enumerate()
                .map(|(i, (s, layer))| hit(&i.to_string(), layer, *s))
                .collect();
            hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
            let n = hits.len();

            let ranked = rerank(hits, &BoostConfig::new().with("layer", "service", factor), top_k);
            prop_assert_eq!(ranked.len(), top_k.min(n));
            for pair in ranked.windows(2) {
                prop_assert!(pair[0].boosted_similarity >= pair[1].boosted_similarity);
            }
        }

        #[test]
        fn empty_boosts_are_neutral(sims in prop::collection::vec(0.0f32..1.0, 0..30)) {
            let mut hits: Vec<SearchHit> = sims
                .iter()
                .enumerate()
                .map(|(i, s)| hit(&i.to_string(), "service", *s))
                .collect();
            hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
            let expected: Vec<RecordId> = hits.iter().map(|h| h.id.clone()).collect();

            let ranked = rerank(hits, &BoostConfig::new(), usize::MAX);
            let ids: Vec<RecordId> = ranked.iter().map(|r| r.id.clone()).collect();
            prop_assert_eq!(ids, expected);
            for r in &ranked {
                prop_assert!((r.similarity - r.boosted_similarity).abs() < f32::EPSILON);
            }
        }

        #[test]
        fn filtered_search_is_exact_and_complete(
            layers in prop::collection::vec(layer_strategy(), 1..40),
            wanted in layer_strategy(),
            top_k in 0usize..50,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let results = rt.block_on(async {
                let records = layers
                    .iter()
                    .enumerate()
                    .map(|(i, layer)| {
                        let id = format!("r{i}");
                        let x = f32::from(u8::try_from(i).unwrap());
                        NewRecord::new(id.clone(), vec![1.0, x, 0.5, -x], meta(&id, layer))
                    })
                    .collect();
                let (retriever, _) =
                    setup(MockEmbedder::new(4), records, RetrievalConfig::default()).await;
                retriever
                    .search(
                        SearchRequest::new("query", top_k)
                            .with_filter(MetadataFilter::new().text_eq("layer", wanted)),
                    )
                    .await
                    .unwrap()
            });

            let matching = layers.iter().filter(|l| **l == wanted).count();
            prop_assert_eq!(results.len(), top_k.min(matching));
            for r in &results {
                prop_assert_eq!(r.metadata.text(MetaKey::Layer), Some(wanted));
            }
            for pair in results.windows(2) {
                prop_assert!(pair[0].boosted_similarity >= pair[1].boosted_similarity);
            }
        }
    }
}
