use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Result, VectorIndexError};
use crate::limits::Capabilities;
use crate::metadata::{Metadata, MetadataFilter};
use crate::vector_index::{
    BatchInsertReport, BoxFuture, IndexParams, NewRecord, RecordId, SearchHit, VectorIndex,
    prepare_record, rank_hits,
};

struct StoredRecord {
    content: String,
    embedding: Vec<f32>,
    metadata: Metadata,
}

#[derive(Default)]
struct State {
    params: Option<IndexParams>,
    records: HashMap<String, StoredRecord>,
}

/// Exact-scan index kept entirely in process memory.
///
/// Useful in tests and as a reference for backend behaviour. Capabilities default to
/// unrestricted but can be narrowed to emulate a limited backend.
pub struct InMemoryIndex {
    state: RwLock<State>,
    capabilities: Capabilities,
}

impl InMemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            capabilities: Capabilities::unrestricted(),
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn insert_one(&self, state: &mut State, record: NewRecord) -> Result<RecordId> {
        let params = state.params.ok_or(VectorIndexError::NotConfigured)?;
        let prepared = prepare_record(record, &params, &self.capabilities)?;
        state.records.insert(
            prepared.id.0.clone(),
            StoredRecord {
                content: prepared.content,
                embedding: prepared.embedding,
                metadata: prepared.metadata,
            },
        );
        Ok(prepared.id)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryIndex").finish_non_exhaustive()
    }
}

impl VectorIndex for InMemoryIndex {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn params(&self) -> Option<IndexParams> {
        self.state.read().ok().and_then(|s| s.params)
    }

    fn configure(&self, params: IndexParams) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self
                .state
                .write()
                .map_err(|e| VectorIndexError::Configuration(e.to_string()))?;
            if let Some(current) = state.params
                && current.is_incompatible_with(&params)
                && !state.records.is_empty()
            {
                return Err(VectorIndexError::Configuration(format!(
                    "index holds {} records at dimension {} ({}); cannot switch to {} ({})",
                    state.records.len(),
                    current.dimension,
                    current.metric,
                    params.dimension,
                    params.metric
                )));
            }
            state.params = Some(params);
            Ok(())
        })
    }

    fn insert(&self, record: NewRecord) -> BoxFuture<'_, Result<RecordId>> {
        Box::pin(async move {
            let mut state = self
                .state
                .write()
                .map_err(|e| VectorIndexError::Upsert(e.to_string()))?;
            self.insert_one(&mut state, record)
        })
    }

    fn insert_batch(&self, records: Vec<NewRecord>) -> BoxFuture<'_, Result<BatchInsertReport>> {
        Box::pin(async move {
            let mut state = self
                .state
                .write()
                .map_err(|e| VectorIndexError::Upsert(e.to_string()))?;
            if state.params.is_none() {
                return Err(VectorIndexError::NotConfigured);
            }
            let outcomes = records
                .into_iter()
                .map(|r| self.insert_one(&mut state, r))
                .collect();
            Ok(BatchInsertReport { outcomes })
        })
    }

    fn search(
        &self,
        query: Vec<f32>,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> BoxFuture<'_, Result<Vec<SearchHit>>> {
        Box::pin(async move {
            let state = self
                .state
                .read()
                .map_err(|e| VectorIndexError::Search(e.to_string()))?;
            let params = state.params.ok_or(VectorIndexError::NotConfigured)?;
            params.check_dimension(&query)?;
            if let Some(f) = &filter {
                self.capabilities.check_filter(f)?;
            }
            if top_k == 0 {
                return Ok(Vec::new());
            }

            let hits = state
                .records
                .iter()
                .filter(|(_, r)| filter.as_ref().is_none_or(|f| f.matches(&r.metadata)))
                .map(|(id, r)| SearchHit {
                    id: RecordId(id.clone()),
                    content: r.content.clone(),
                    metadata: r.metadata.clone(),
                    embedding: r.embedding.clone(),
                    similarity: params.metric.similarity(&query, &r.embedding),
                })
                .collect();
            Ok(rank_hits(hits, top_k))
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_owned();
        Box::pin(async move {
            let mut state = self
                .state
                .write()
                .map_err(|e| VectorIndexError::Delete(e.to_string()))?;
            Ok(state.records.remove(&id).is_some())
        })
    }

    fn delete_all(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self
                .state
                .write()
                .map_err(|e| VectorIndexError::Delete(e.to_string()))?;
            state.records.clear();
            Ok(())
        })
    }

    fn count(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let state = self
                .state
                .read()
                .map_err(|e| VectorIndexError::Count(e.to_string()))?;
            Ok(state.records.len() as u64)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{FilterableFields, MetadataLimits};
    use crate::metadata::MetaKey;

    fn record(id: &str, layer: &str, v: Vec<f32>) -> NewRecord {
        NewRecord::new(
            format!("content of {id}"),
            v,
            Metadata::new()
                .with(MetaKey::ChunkId, id)
                .with(MetaKey::Layer, layer),
        )
    }

    async fn configured(dim: usize) -> InMemoryIndex {
        let index = InMemoryIndex::new();
        index.configure(IndexParams::new(dim)).await.unwrap();
        index
    }

    #[tokio::test]
    async fn insert_before_configure_fails() {
        let index = InMemoryIndex::new();
        let err = index
            .insert(record("a", "service", vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, VectorIndexError::NotConfigured));
    }

    #[tokio::test]
    async fn insert_and_search_orders_by_similarity() {
        let index = configured(2).await;
        index.insert(record("a", "service", vec![1.0, 0.0])).await.unwrap();
        index.insert(record("b", "service", vec![0.0, 1.0])).await.unwrap();
        index.insert(record("c", "service", vec![0.7, 0.7])).await.unwrap();

        let hits = index.search(vec![1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id.as_str(), "a");
        assert_eq!(hits[1].id.as_str(), "c");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn search_returns_min_of_top_k_and_matching() {
        let index = configured(2).await;
        index.insert(record("a", "service", vec![1.0, 0.0])).await.unwrap();
        index.insert(record("b", "controller", vec![0.0, 1.0])).await.unwrap();
        let filter = MetadataFilter::new().text_eq("layer", "controller");
        let hits = index.search(vec![1.0, 0.0], 10, Some(filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "b");
    }

    #[tokio::test]
    async fn insert_is_upsert_by_chunk_id() {
        let index = configured(2).await;
        index.insert(record("a", "service", vec![1.0, 0.0])).await.unwrap();
        index.insert(record("a", "controller", vec![0.0, 1.0])).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        let hits = index.search(vec![0.0, 1.0], 1, None).await.unwrap();
        assert_eq!(hits[0].metadata.text(MetaKey::Layer), Some("controller"));
    }

    #[tokio::test]
    async fn batch_reports_per_position() {
        let index = configured(2).await;
        let report = index
            .insert_batch(vec![
                record("a", "service", vec![1.0, 0.0]),
                record("b", "service", vec![1.0]),
                record("c", "service", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(report.inserted(), 2);
        assert!(matches!(
            report.outcomes[1],
            Err(VectorIndexError::DimensionMismatch { .. })
        ));
        assert_eq!(index.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reconfigure_with_records_rejects_dimension_change() {
        let index = configured(2).await;
        index.insert(record("a", "service", vec![1.0, 0.0])).await.unwrap();
        assert!(index.configure(IndexParams::new(2)).await.is_ok());
        assert!(matches!(
            index.configure(IndexParams::new(3)).await,
            Err(VectorIndexError::Configuration(_))
        ));
        index.delete_all().await.unwrap();
        assert!(index.configure(IndexParams::new(3)).await.is_ok());
    }

    #[tokio::test]
    async fn delete_all_keeps_configuration() {
        let index = configured(2).await;
        index.insert(record("a", "service", vec![1.0, 0.0])).await.unwrap();
        index.delete_all().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert_eq!(index.params(), Some(IndexParams::new(2)));
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let index = configured(2).await;
        index.insert(record("a", "service", vec![1.0, 0.0])).await.unwrap();
        assert!(index.delete("a").await.unwrap());
        assert!(!index.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn limited_capabilities_are_enforced() {
        let index = InMemoryIndex::new().with_capabilities(Capabilities {
            filterable: FilterableFields::only(["layer", "module"]),
            limits: Some(MetadataLimits {
                max_keys: 4,
                max_filterable_bytes: 2048,
            }),
        });
        index.configure(IndexParams::new(2)).await.unwrap();
        index.insert(record("a", "service", vec![1.0, 0.0])).await.unwrap();

        let err = index
            .search(
                vec![1.0, 0.0],
                5,
                Some(MetadataFilter::new().text_eq("package", "x")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VectorIndexError::NonFilterableField(_)));

        let err = index
            .insert(NewRecord::new(
                "c",
                vec![1.0, 0.0],
                Metadata::new()
                    .with(MetaKey::ChunkId, "b")
                    .with(MetaKey::Layer, "service")
                    .with(MetaKey::Module, "m"),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, VectorIndexError::TooManyMetadataKeys { .. }));
    }

    #[tokio::test]
    async fn zero_top_k_is_empty() {
        let index = configured(2).await;
        index.insert(record("a", "service", vec![1.0, 0.0])).await.unwrap();
        assert!(index.search(vec![1.0, 0.0], 0, None).await.unwrap().is_empty());
    }
}
