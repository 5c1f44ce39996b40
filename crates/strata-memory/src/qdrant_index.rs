//! Qdrant-backed index with the metadata ceilings of an object-store vector service.
//!
//! Only a small set of fields is stored as top-level payload keys and indexed for
//! filtering. Everything else travels in one `attributes` object, with the raw chunk
//! text under `content`.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Distance, FieldType, Filter, HnswConfigDiffBuilder, ListValue,
    PointStruct, PointsIdsList, ScoredPoint, SearchParamsBuilder, SearchPointsBuilder, Struct,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder, value::Kind,
    vectors_config, vectors_output::VectorsOptions,
};

use crate::error::{Result, VectorIndexError};
use crate::limits::{
    ATTRIBUTES_KEY, CONTENT_KEY, Capabilities, FilterableFields, MetadataLimits, SplitMetadata,
};
use crate::metadata::{
    FieldCondition, FieldValue, MetaKey, MetaValue, Metadata, MetadataFilter, ValueKind,
    validate_field_name,
};
use crate::vector_index::{
    BatchInsertReport, BoxFuture, DistanceMetric, IndexParams, NewRecord, PreparedRecord,
    RecordId, SearchHit, VectorIndex, prepare_record, rank_hits, with_timeout,
    write_sub_batches,
};

/// Points per upsert call.
pub const UPSERT_BATCH_SIZE: usize = 500;

type Payload = HashMap<String, QdrantValue>;

pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    capabilities: Capabilities,
    params: RwLock<Option<IndexParams>>,
    timeout: Option<Duration>,
}

impl fmt::Debug for QdrantIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QdrantIndex")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

fn lock_poisoned(e: impl fmt::Display) -> VectorIndexError {
    VectorIndexError::Configuration(format!("index state lock poisoned: {e}"))
}

/// Stable Qdrant point id for a record id.
#[must_use]
pub fn point_id(record_id: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, record_id.as_bytes()).to_string()
}

fn qdrant_distance(metric: DistanceMetric) -> Distance {
    match metric {
        DistanceMetric::Cosine => Distance::Cosine,
        DistanceMetric::Euclidean => Distance::Euclid,
    }
}

fn metric_from_qdrant(distance: i32) -> Result<DistanceMetric> {
    if distance == Distance::Cosine as i32 {
        Ok(DistanceMetric::Cosine)
    } else if distance == Distance::Euclid as i32 {
        Ok(DistanceMetric::Euclidean)
    } else {
        Err(VectorIndexError::Configuration(format!(
            "collection uses unsupported distance {distance}"
        )))
    }
}

fn qdrant_to_json(value: QdrantValue) -> serde_json::Value {
    match value.kind {
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::ListValue(ListValue { values })) => {
            serde_json::Value::Array(values.into_iter().map(qdrant_to_json).collect())
        }
        Some(Kind::StructValue(Struct { fields })) => serde_json::Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_to_json(v)))
                .collect(),
        ),
        Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
    }
}

/// Lay a split record out as a payload: filterable fields, `content`, `attributes`.
fn build_payload(split: &SplitMetadata, content: &str) -> Result<Payload> {
    let mut object = serde_json::Map::new();
    for (key, value) in &split.filterable {
        if key == CONTENT_KEY || key == ATTRIBUTES_KEY {
            return Err(VectorIndexError::Serialization(format!(
                "metadata field `{key}` collides with a reserved payload key"
            )));
        }
        object.insert(key.clone(), serde_json::to_value(value)?);
    }
    object.insert(CONTENT_KEY.to_owned(), serde_json::Value::from(content));
    object.insert(
        ATTRIBUTES_KEY.to_owned(),
        serde_json::Value::Object(split.attributes.clone()),
    );
    serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|e| VectorIndexError::Serialization(e.to_string()))
}

/// Inverse of [`build_payload`].
fn decode_payload(payload: Payload) -> Result<(String, Metadata)> {
    let mut content = String::new();
    let mut attributes = serde_json::Map::new();
    let mut filterable = Vec::new();
    for (key, value) in payload {
        let json = qdrant_to_json(value);
        match key.as_str() {
            CONTENT_KEY => content = json.as_str().unwrap_or_default().to_owned(),
            ATTRIBUTES_KEY => {
                if let serde_json::Value::Object(map) = json {
                    attributes = map;
                }
            }
            _ => filterable.push((key, serde_json::from_value::<MetaValue>(json)?)),
        }
    }
    let metadata = SplitMetadata::rejoin(filterable, attributes)?;
    Ok((content, metadata))
}

fn condition_to_qdrant(cond: &FieldCondition) -> Condition {
    let field = cond.field.clone();
    match &cond.value {
        FieldValue::Integer(i) => Condition::matches(field, *i),
        FieldValue::Text(text) => {
            // Text conditions match the rendered value, so scalars stored as integers or
            // booleans need an alternative of their own type.
            let mut alternatives = vec![Condition::matches(field.clone(), text.clone())];
            if let Ok(i) = text.parse::<i64>() {
                alternatives.push(Condition::matches(field.clone(), i));
            }
            match text.as_str() {
                "true" => alternatives.push(Condition::matches(field, true)),
                "false" => alternatives.push(Condition::matches(field, false)),
                _ => {}
            }
            if alternatives.len() == 1 {
                alternatives.remove(0)
            } else {
                Filter::should(alternatives).into()
            }
        }
    }
}

fn filter_to_qdrant(filter: &MetadataFilter) -> Filter {
    Filter::must(filter.must.iter().map(condition_to_qdrant))
}

#[allow(deprecated)]
fn dense_vector(point: &ScoredPoint) -> Vec<f32> {
    match point.vectors.as_ref().and_then(|v| v.vectors_options.as_ref()) {
        Some(VectorsOptions::Vector(out)) => out.data.clone(),
        _ => Vec::new(),
    }
}

impl QdrantIndex {
    /// Build a client for `url` without contacting the server.
    ///
    /// Capabilities default to the essential filterable fields under
    /// [`MetadataLimits::default`].
    ///
    /// # Errors
    ///
    /// Returns [`VectorIndexError::Connection`] if the client cannot be created.
    pub fn new(url: &str, collection: impl Into<String>) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| VectorIndexError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            collection: collection.into(),
            capabilities: Capabilities {
                filterable: FilterableFields::essential(),
                limits: Some(MetadataLimits::default()),
            },
            params: RwLock::new(None),
            timeout: None,
        })
    }

    /// Connect and pick up dimension and metric from an existing collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created or the collection cannot be read.
    pub async fn open(url: &str, collection: impl Into<String>) -> Result<Self> {
        let index = Self::new(url, collection)?;
        if let Some(params) = index.stored_params().await? {
            *index.params.write().map_err(lock_poisoned)? = Some(params);
            tracing::info!(
                collection = %index.collection,
                dimension = params.dimension,
                "opened qdrant index"
            );
        }
        Ok(index)
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn require_params(&self) -> Result<IndexParams> {
        self.params
            .read()
            .map_err(lock_poisoned)?
            .ok_or(VectorIndexError::NotConfigured)
    }

    async fn stored_params(&self) -> Result<Option<IndexParams>> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| VectorIndexError::Connection(e.to_string()))?;
        if !exists {
            return Ok(None);
        }
        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(|e| VectorIndexError::Collection(e.to_string()))?;
        let vector_params = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config);
        match vector_params {
            Some(vectors_config::Config::Params(p)) => {
                let dimension = usize::try_from(p.size)
                    .map_err(|e| VectorIndexError::Configuration(e.to_string()))?;
                let base = self.params().unwrap_or_else(|| IndexParams::new(dimension));
                Ok(Some(IndexParams {
                    dimension,
                    metric: metric_from_qdrant(p.distance)?,
                    hnsw: base.hnsw,
                }))
            }
            _ => Err(VectorIndexError::Configuration(format!(
                "collection `{}` does not use a single unnamed vector",
                self.collection
            ))),
        }
    }

    async fn point_count(&self) -> Result<u64> {
        let response = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await
            .map_err(|e| VectorIndexError::Count(e.to_string()))?;
        Ok(response.result.map_or(0, |r| r.count))
    }

    async fn create_collection(&self, params: IndexParams) -> Result<()> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(
                        params.dimension as u64,
                        qdrant_distance(params.metric),
                    ))
                    .hnsw_config(
                        HnswConfigDiffBuilder::default()
                            .m(params.hnsw.m as u64)
                            .ef_construct(params.hnsw.ef_construction as u64),
                    ),
            )
            .await
            .map_err(|e| VectorIndexError::Collection(e.to_string()))?;

        if let FilterableFields::Only(fields) = &self.capabilities.filterable {
            for field in fields {
                let field_type = match MetaKey::parse(field).map(MetaKey::kind) {
                    Some(ValueKind::Int) => FieldType::Integer,
                    _ => FieldType::Keyword,
                };
                self.client
                    .create_field_index(
                        CreateFieldIndexCollectionBuilder::new(
                            &self.collection,
                            field.as_str(),
                            field_type,
                        )
                        .wait(true),
                    )
                    .await
                    .map_err(|e| VectorIndexError::Collection(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn drop_collection(&self) -> Result<()> {
        self.client
            .delete_collection(&self.collection)
            .await
            .map_err(|e| VectorIndexError::Collection(e.to_string()))?;
        Ok(())
    }

    fn to_point(&self, record: NewRecord, params: &IndexParams) -> Result<(RecordId, PointStruct)> {
        let PreparedRecord {
            id,
            content,
            embedding,
            split,
            ..
        } = prepare_record(record, params, &self.capabilities)?;
        let payload = build_payload(&split, &content)?;
        let point = PointStruct::new(point_id(id.as_str()), embedding, payload);
        Ok((id, point))
    }

    async fn upsert(&self, points: Vec<PointStruct>) -> Result<()> {
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(|e| VectorIndexError::Upsert(e.to_string()))?;
        Ok(())
    }
}

impl VectorIndex for QdrantIndex {
    fn backend(&self) -> &'static str {
        "qdrant"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn params(&self) -> Option<IndexParams> {
        self.params.read().ok().and_then(|p| *p)
    }

    fn configure(&self, params: IndexParams) -> BoxFuture<'_, Result<()>> {
        Box::pin(with_timeout(self.timeout, async move {
            match self.stored_params().await? {
                None => self.create_collection(params).await?,
                Some(current) if current.is_incompatible_with(&params) => {
                    let stored = self.point_count().await?;
                    if stored > 0 {
                        return Err(VectorIndexError::Configuration(format!(
                            "collection `{}` holds {stored} points at dimension {} ({}); \
                             clear it before switching to {} ({})",
                            self.collection,
                            current.dimension,
                            current.metric,
                            params.dimension,
                            params.metric
                        )));
                    }
                    self.drop_collection().await?;
                    self.create_collection(params).await?;
                }
                Some(_) => {}
            }
            *self.params.write().map_err(lock_poisoned)? = Some(params);
            tracing::info!(
                collection = %self.collection,
                dimension = params.dimension,
                metric = %params.metric,
                "configured qdrant index"
            );
            Ok(())
        }))
    }

    fn insert(&self, record: NewRecord) -> BoxFuture<'_, Result<RecordId>> {
        Box::pin(with_timeout(self.timeout, async move {
            let params = self.require_params()?;
            let (id, point) = self.to_point(record, &params)?;
            self.upsert(vec![point]).await?;
            Ok(id)
        }))
    }

    /// Upserts in sub-batches of [`UPSERT_BATCH_SIZE`] under one shared deadline.
    ///
    /// Sub-batches committed before a failure or the deadline stay reported as stored.
    fn insert_batch(&self, records: Vec<NewRecord>) -> BoxFuture<'_, Result<BatchInsertReport>> {
        Box::pin(async move {
            let params = self.require_params()?;
            let mut outcomes: Vec<Result<RecordId>> = Vec::with_capacity(records.len());
            let mut pending: Vec<(usize, PointStruct)> = Vec::new();

            for (pos, record) in records.into_iter().enumerate() {
                match self.to_point(record, &params) {
                    Ok((id, point)) => {
                        outcomes.push(Ok(id));
                        pending.push((pos, point));
                    }
                    Err(e) => outcomes.push(Err(e)),
                }
            }

            write_sub_batches(&mut outcomes, pending, UPSERT_BATCH_SIZE, self.timeout, |points| {
                self.upsert(points)
            })
            .await;

            Ok(BatchInsertReport { outcomes })
        })
    }

    fn search(
        &self,
        query: Vec<f32>,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> BoxFuture<'_, Result<Vec<SearchHit>>> {
        Box::pin(with_timeout(self.timeout, async move {
            let params = self.require_params()?;
            params.check_dimension(&query)?;
            let filter = filter.filter(|f| !f.is_empty());
            if let Some(f) = &filter {
                for field in f.fields() {
                    validate_field_name(field)?;
                }
                self.capabilities.check_filter(f)?;
            }
            if top_k == 0 {
                return Ok(Vec::new());
            }

            let mut builder = SearchPointsBuilder::new(&self.collection, query, top_k as u64)
                .with_payload(true)
                .with_vectors(true)
                .params(SearchParamsBuilder::default().hnsw_ef(params.hnsw.ef_search as u64));
            if let Some(f) = &filter {
                builder = builder.filter(filter_to_qdrant(f));
            }
            let response = self
                .client
                .search_points(builder)
                .await
                .map_err(|e| VectorIndexError::Search(e.to_string()))?;

            let mut hits = Vec::with_capacity(response.result.len());
            for point in response.result {
                let embedding = dense_vector(&point);
                let similarity = match params.metric {
                    DistanceMetric::Cosine => point.score,
                    DistanceMetric::Euclidean => params.metric.similarity_from_distance(point.score),
                };
                let (content, metadata) = decode_payload(point.payload)?;
                let id = metadata.chunk_id().unwrap_or_default().to_owned();
                hits.push(SearchHit {
                    id: RecordId(id),
                    content,
                    metadata,
                    embedding,
                    similarity,
                });
            }
            Ok(rank_hits(hits, top_k))
        }))
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_owned();
        Box::pin(with_timeout(self.timeout, async move {
            let existing = self
                .client
                .count(
                    CountPointsBuilder::new(&self.collection)
                        .filter(Filter::must([Condition::matches(
                            MetaKey::ChunkId.as_str(),
                            id.clone(),
                        )]))
                        .exact(true),
                )
                .await
                .map_err(|e| VectorIndexError::Count(e.to_string()))?
                .result
                .map_or(0, |r| r.count);
            self.client
                .delete_points(
                    DeletePointsBuilder::new(&self.collection)
                        .points(PointsIdsList {
                            ids: vec![point_id(&id).into()],
                        })
                        .wait(true),
                )
                .await
                .map_err(|e| VectorIndexError::Delete(e.to_string()))?;
            Ok(existing > 0)
        }))
    }

    fn delete_all(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(with_timeout(self.timeout, async move {
            let params = self.require_params()?;
            self.drop_collection().await?;
            self.create_collection(params).await?;
            tracing::info!(collection = %self.collection, "cleared qdrant index");
            Ok(())
        }))
    }

    fn count(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(with_timeout(self.timeout, self.point_count()))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
