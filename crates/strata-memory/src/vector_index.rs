//! Backend-polymorphic vector index contract.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VectorIndexError};
use crate::limits::{Capabilities, SplitMetadata};
use crate::metadata::{MetaKey, Metadata, MetadataFilter};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
}

impl DistanceMetric {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
        }
    }

    /// Parse the stored name of a metric.
    ///
    /// # Errors
    ///
    /// Returns [`VectorIndexError::Configuration`] for unknown names.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "cosine" => Ok(Self::Cosine),
            "euclidean" => Ok(Self::Euclidean),
            other => Err(VectorIndexError::Configuration(format!(
                "unknown distance metric `{other}`"
            ))),
        }
    }

    /// Distance between two vectors; smaller is closer.
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => 1.0 - cosine_similarity(a, b),
            Self::Euclidean => euclidean_distance(a, b),
        }
    }

    /// Map a distance produced by [`Self::distance`] to a similarity where higher is closer.
    #[must_use]
    pub fn similarity_from_distance(self, distance: f32) -> f32 {
        match self {
            Self::Cosine => 1.0 - distance,
            Self::Euclidean => 1.0 / (1.0 + distance),
        }
    }

    #[must_use]
    pub fn similarity(self, a: &[f32], b: &[f32]) -> f32 {
        self.similarity_from_distance(self.distance(a, b))
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[must_use]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Proximity graph tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswParams {
    /// Neighbours kept per node on upper layers; layer 0 keeps twice as many.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 64,
            ef_search: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub hnsw: HnswParams,
}

impl IndexParams {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: DistanceMetric::Cosine,
            hnsw: HnswParams::default(),
        }
    }

    #[must_use]
    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    #[must_use]
    pub fn with_hnsw(mut self, hnsw: HnswParams) -> Self {
        self.hnsw = hnsw;
        self
    }

    /// Whether switching from `self` to `next` would invalidate stored vectors.
    #[must_use]
    pub fn is_incompatible_with(&self, next: &Self) -> bool {
        self.dimension != next.dimension || self.metric != next.metric
    }

    /// # Errors
    ///
    /// Returns [`VectorIndexError::DimensionMismatch`] if `vector` has the wrong length.
    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() == self.dimension {
            Ok(())
        } else {
            Err(VectorIndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            })
        }
    }
}

/// A record to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

impl NewRecord {
    #[must_use]
    pub fn new(content: impl Into<String>, embedding: Vec<f32>, metadata: Metadata) -> Self {
        Self {
            content: content.into(),
            embedding,
            metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: RecordId,
    pub content: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
    pub similarity: f32,
}

/// Per-position outcome of [`VectorIndex::insert_batch`], in input order.
#[derive(Debug, Default)]
pub struct BatchInsertReport {
    pub outcomes: Vec<Result<RecordId>>,
}

impl BatchInsertReport {
    #[must_use]
    pub fn inserted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.inserted()
    }

    /// Failed positions with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &VectorIndexError)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().err().map(|e| (i, e)))
    }
}

/// A record validated against the index parameters and capabilities, ready to write.
#[derive(Debug, Clone)]
pub(crate) struct PreparedRecord {
    pub id: RecordId,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
    pub split: SplitMetadata,
}

/// Assign the record id (minting a UUID v4 when `chunk_id` is absent), check the
/// dimension and split metadata for the backend.
pub(crate) fn prepare_record(
    mut record: NewRecord,
    params: &IndexParams,
    capabilities: &Capabilities,
) -> Result<PreparedRecord> {
    params.check_dimension(&record.embedding)?;
    let id = match record.metadata.chunk_id() {
        Some(id) if !id.is_empty() => id.to_owned(),
        _ => {
            let id = uuid::Uuid::new_v4().to_string();
            record.metadata.set(MetaKey::ChunkId, id.as_str());
            id
        }
    };
    let split = capabilities.split(&record.metadata)?;
    Ok(PreparedRecord {
        id: RecordId(id),
        content: record.content,
        embedding: record.embedding,
        metadata: record.metadata,
        split,
    })
}

/// Run `fut` under an optional deadline.
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| VectorIndexError::Timeout(limit))?,
        None => fut.await,
    }
}

/// Write `pending` `(position, item)` pairs in sub-batches of `chunk` through `write`.
///
/// All sub-batches share one deadline. A failed or timed-out sub-batch marks its own
/// positions; once the deadline passes every unwritten position is marked
/// [`VectorIndexError::Timeout`]. Positions of committed sub-batches keep their outcome.
pub(crate) async fn write_sub_batches<T, W, F>(
    outcomes: &mut [Result<RecordId>],
    pending: Vec<(usize, T)>,
    chunk: usize,
    timeout: Option<Duration>,
    mut write: W,
) where
    W: FnMut(Vec<T>) -> F,
    F: Future<Output = Result<()>>,
{
    let deadline = timeout.map(|limit| (tokio::time::Instant::now() + limit, limit));
    let mut remaining = pending.into_iter().peekable();
    while remaining.peek().is_some() {
        let (positions, items): (Vec<usize>, Vec<T>) =
            remaining.by_ref().take(chunk.max(1)).unzip();
        let result = match deadline {
            Some((at, limit)) => tokio::time::timeout_at(at, write(items))
                .await
                .unwrap_or(Err(VectorIndexError::Timeout(limit))),
            None => write(items).await,
        };
        if let Err(e) = result {
            tracing::warn!(records = positions.len(), error = %e, "sub-batch failed");
            let expired = match &e {
                VectorIndexError::Timeout(limit) => Some(*limit),
                _ => None,
            };
            let message = e.to_string();
            for pos in positions {
                outcomes[pos] = Err(match expired {
                    Some(limit) => VectorIndexError::Timeout(limit),
                    None => VectorIndexError::Upsert(message.clone()),
                });
            }
            if let Some(limit) = expired {
                for (pos, _) in remaining.by_ref() {
                    outcomes[pos] = Err(VectorIndexError::Timeout(limit));
                }
            }
        }
    }
}

/// Sort hits by descending similarity and keep the best `top_k`.
pub(crate) fn rank_hits(mut hits: Vec<SearchHit>, top_k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    hits.truncate(top_k);
    hits
}

/// Storage for embedded chunks with filtered nearest-neighbour search.
///
/// Object-safe so callers can hold any backend as `Arc<dyn VectorIndex>`.
pub trait VectorIndex: Send + Sync {
    /// Short backend name for logs and reports.
    fn backend(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Parameters the index is currently configured with, if any.
    fn params(&self) -> Option<IndexParams>;

    /// Set dimension, metric and graph tuning.
    ///
    /// Idempotent for equal parameters. Changing dimension or metric while records
    /// exist fails with [`VectorIndexError::Configuration`].
    fn configure(&self, params: IndexParams) -> BoxFuture<'_, Result<()>>;

    /// Store one record, replacing any record with the same id.
    fn insert(&self, record: NewRecord) -> BoxFuture<'_, Result<RecordId>>;

    /// Store many records through the backend's multi-record path.
    ///
    /// Per-record failures are reported by position; the outer error is reserved for
    /// failures that prevent the call from starting, such as an unconfigured index.
    fn insert_batch(&self, records: Vec<NewRecord>) -> BoxFuture<'_, Result<BatchInsertReport>>;

    /// Nearest records to `query` by descending similarity, at most `top_k` of them.
    fn search(
        &self,
        query: Vec<f32>,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> BoxFuture<'_, Result<Vec<SearchHit>>>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    /// Remove every record, keeping the configuration.
    fn delete_all(&self) -> BoxFuture<'_, Result<()>>;

    fn count(&self) -> BoxFuture<'_, Result<u64>>;

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}
