//! Ingestion orchestrator: composed records → embed → batch insert.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use strata_llm::{EmbeddingClient, EmbeddingProvider};
use strata_memory::{DistanceMetric, HnswParams, IndexParams, NewRecord, VectorIndex};

use crate::composer::ComposedChunk;
use crate::error::Result;

/// Ingestor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Records per `insert_batch` call (default: 100).
    pub insert_batch_size: usize,
    pub metric: DistanceMetric,
    pub hnsw: HnswParams,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            insert_batch_size: 100,
            metric: DistanceMetric::Cosine,
            hnsw: HnswParams::default(),
        }
    }
}

/// Summary of an ingestion run.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub records: usize,
    pub inserted: usize,
    /// Chunk ids whose embedding fell back to a zero vector. They are not stored.
    pub embedding_fallbacks: Vec<String>,
    /// `(chunk_id, error)` for records the index rejected.
    pub failed: Vec<(String, String)>,
    pub duration_ms: u64,
}

/// Embeds composed records and stores them in a vector index.
pub struct Ingestor<P> {
    embedder: Arc<EmbeddingClient<P>>,
    index: Arc<dyn VectorIndex>,
    config: IngestConfig,
}

impl<P> std::fmt::Debug for Ingestor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("backend", &self.index.backend())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: EmbeddingProvider> Ingestor<P> {
    #[must_use]
    pub fn new(
        embedder: Arc<EmbeddingClient<P>>,
        index: Arc<dyn VectorIndex>,
        config: IngestConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    /// Index parameters implied by the embedder and configuration.
    #[must_use]
    pub fn index_params(&self) -> IndexParams {
        IndexParams::new(self.embedder.dimension())
            .with_metric(self.config.metric)
            .with_hnsw(self.config.hnsw)
    }

    /// Configure the index for the embedder's dimension. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the index already holds records with other parameters.
    pub async fn prepare(&self) -> Result<IndexParams> {
        let params = self.index_params();
        if params.metric == DistanceMetric::Cosine && !self.embedder.normalizes() {
            tracing::warn!("cosine index with normalisation disabled; vectors are stored as returned");
        }
        self.index.configure(params).await?;
        Ok(params)
    }

    /// Embed and insert `records`.
    ///
    /// Records whose embedding falls back to a zero vector are reported and skipped.
    /// Index rejections are reported per record and do not stop the run. A batch the
    /// index fails outright is reported against every record in it.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be configured.
    pub async fn ingest(&self, records: Vec<ComposedChunk>) -> Result<IngestReport> {
        let start = Instant::now();
        let mut report = IngestReport {
            records: records.len(),
            ..IngestReport::default()
        };
        self.prepare().await?;

        let texts: Vec<String> = records.iter().map(|r| r.composed_text.clone()).collect();
        let embeddings = self.embedder.embed_batch_default(&texts).await;
        tracing::info!(records = records.len(), "embedding complete");

        let mut pending: Vec<(String, NewRecord)> = Vec::with_capacity(records.len());
        for (position, (record, embedding)) in records.into_iter().zip(embeddings).enumerate() {
            let id = record
                .chunk_id()
                .map_or_else(|| format!("#{position}"), str::to_owned);
            if embedding.fallback {
                tracing::warn!(chunk_id = %id, "embedding fell back to zero vector; not stored");
                report.embedding_fallbacks.push(id);
                continue;
            }
            pending.push((
                id,
                NewRecord::new(record.content, embedding.vector, record.metadata),
            ));
        }

        let batch_size = self.config.insert_batch_size.max(1);
        let total_batches = pending.len().div_ceil(batch_size);
        let mut pending = pending.into_iter().peekable();
        let mut batch_no = 0usize;
        while pending.peek().is_some() {
            batch_no += 1;
            let (ids, batch): (Vec<String>, Vec<NewRecord>) =
                pending.by_ref().take(batch_size).unzip();
            let outcome = match self.index.insert_batch(batch).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(
                        batch = batch_no,
                        records = ids.len(),
                        error = %e,
                        "batch insert failed"
                    );
                    let message = e.to_string();
                    report.failed.extend(ids.into_iter().map(|id| (id, message.clone())));
                    continue;
                }
            };
            for (id, result) in ids.into_iter().zip(outcome.outcomes) {
                match result {
                    Ok(_) => report.inserted += 1,
                    Err(e) => {
                        tracing::warn!(chunk_id = %id, error = %e, "insert failed");
                        report.failed.push((id, e.to_string()));
                    }
                }
            }
            tracing::info!(
                progress = format_args!("{batch_no}/{total_batches}"),
                inserted = report.inserted,
                "batch stored"
            );
        }

        report.duration_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        tracing::info!(
            records = report.records,
            inserted = report.inserted,
            fallbacks = report.embedding_fallbacks.len(),
            failed = report.failed.len(),
            duration_ms = report.duration_ms,
            "ingest complete"
        );
        Ok(report)
    }
}
