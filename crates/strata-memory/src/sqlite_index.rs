use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::{Result, VectorIndexError};
use crate::hnsw::HnswGraph;
use crate::limits::Capabilities;
use crate::metadata::{FieldValue, MetaKey, Metadata, MetadataFilter, ValueKind, validate_field_name};
use crate::vector_index::{
    BatchInsertReport, BoxFuture, DistanceMetric, HnswParams, IndexParams, NewRecord,
    PreparedRecord, RecordId, SearchHit, VectorIndex, prepare_record, with_timeout,
};

/// Rows per multi-row `INSERT`; keeps bind parameters well under `SQLite` limits.
const ROWS_PER_STATEMENT: usize = 200;
const IDS_PER_LOOKUP: usize = 500;
const DEFAULT_EXACT_SCAN_LIMIT: usize = 1024;

const BUMP_GENERATION: &str =
    "UPDATE index_state SET generation = generation + 1 WHERE id = 1 RETURNING generation";

const UPSERT_TAIL: &str = " ON CONFLICT(id) DO UPDATE SET content = excluded.content, \
     embedding = excluded.embedding, metadata = excluded.metadata";

/// Vector index in a single `SQLite` file.
///
/// Records live in the `records` table with metadata as JSON text, so filters run as
/// `json_extract` / `json_each` predicates. Nearest-neighbour search runs over an
/// in-memory HNSW graph loaded from the table. Every write bumps a generation counter
/// in the same transaction; the graph is reloaded whenever the stored generation is not
/// the one it was built at (another instance wrote to the same file).
pub struct SqliteIndex {
    pool: SqlitePool,
    params: RwLock<Option<IndexParams>>,
    graph: RwLock<Option<SyncedGraph>>,
    exact_scan_limit: usize,
    timeout: Option<Duration>,
}

impl fmt::Debug for SqliteIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteIndex")
            .field("exact_scan_limit", &self.exact_scan_limit)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Graph plus the write generation it reflects.
struct SyncedGraph {
    graph: HnswGraph,
    generation: i64,
}

fn lock_poisoned(e: impl fmt::Display) -> VectorIndexError {
    VectorIndexError::Configuration(format!("index state lock poisoned: {e}"))
}

fn to_i64(value: usize) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| VectorIndexError::Configuration(format!("{value} does not fit in i64")))
}

fn to_usize(value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| VectorIndexError::Configuration(format!("stored value {value} is negative")))
}

#[must_use]
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// # Errors
///
/// Returns [`VectorIndexError::Serialization`] if the blob length is not a multiple of 4.
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(VectorIndexError::Serialization(format!(
            "embedding blob of {} bytes is not a list of f32",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Append one `AND ...` predicate per filter condition.
///
/// Known scalar fields compared with a value of their own type use `json_extract` so the
/// expression indexes apply. Everything else goes through `json_each`, which matches
/// both scalars and array elements.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &MetadataFilter) -> Result<()> {
    for cond in &filter.must {
        validate_field_name(&cond.field)?;
        let kind = MetaKey::parse(&cond.field).map(MetaKey::kind);
        let indexed = matches!(
            (&cond.value, kind),
            (FieldValue::Integer(_), Some(ValueKind::Int)) | (FieldValue::Text(_), Some(ValueKind::Text))
        );
        match (&cond.value, indexed) {
            (FieldValue::Integer(i), true) => {
                qb.push(format!(" AND json_extract(metadata, '$.{}') = ", cond.field));
                qb.push_bind(*i);
            }
            (FieldValue::Text(v), true) => {
                qb.push(format!(" AND json_extract(metadata, '$.{}') = ", cond.field));
                qb.push_bind(v.clone());
            }
            (FieldValue::Integer(i), false) => {
                qb.push(format!(
                    " AND EXISTS (SELECT 1 FROM json_each(records.metadata, '$.\"{}\"') AS j \
                     WHERE j.type = 'integer' AND j.value = ",
                    cond.field
                ));
                qb.push_bind(*i);
                qb.push(")");
            }
            (FieldValue::Text(v), false) => {
                qb.push(format!(
                    " AND EXISTS (SELECT 1 FROM json_each(records.metadata, '$.\"{}\"') AS j \
                     WHERE (j.type IN ('text', 'integer', 'real') AND CAST(j.value AS TEXT) = ",
                    cond.field
                ));
                qb.push_bind(v.clone());
                qb.push(") OR (j.type = 'true' AND ");
                qb.push_bind(v.clone());
                qb.push(" = 'true') OR (j.type = 'false' AND ");
                qb.push_bind(v.clone());
                qb.push(" = 'false'))");
            }
        }
    }
    Ok(())
}

impl SqliteIndex {
    /// Open (or create) the index database and run migrations.
    ///
    /// Stored parameters, if any, are loaded and the graph is built from the table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, migrations fail, or the stored
    /// configuration is unreadable.
    pub async fn open(path: &str) -> Result<Self> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // An in-memory database lives and dies with its single connection.
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let index = Self {
            pool,
            params: RwLock::new(None),
            graph: RwLock::new(None),
            exact_scan_limit: DEFAULT_EXACT_SCAN_LIMIT,
            timeout: None,
        };
        if let Some(params) = index.load_params().await? {
            *index.params.write().map_err(lock_poisoned)? = Some(params);
            let nodes = index.reload_graph(params).await?;
            tracing::info!(path, dimension = params.dimension, nodes, "opened sqlite index");
        } else {
            tracing::info!(path, "opened unconfigured sqlite index");
        }
        Ok(index)
    }

    /// Deadline applied to every operation.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Eligible-set size at or below which search scans exactly instead of walking the graph.
    #[must_use]
    pub fn with_exact_scan_limit(mut self, limit: usize) -> Self {
        self.exact_scan_limit = limit;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn graph_read<T>(&self, f: impl FnOnce(Option<&HnswGraph>) -> T) -> Result<T> {
        let guard = self.graph.read().map_err(lock_poisoned)?;
        Ok(f(guard.as_ref().map(|s| &s.graph)))
    }

    fn synced_generation(&self) -> Result<Option<i64>> {
        let guard = self.graph.read().map_err(lock_poisoned)?;
        Ok(guard.as_ref().map(|s| s.generation))
    }

    /// Apply a committed write to the graph if the graph was current just before it.
    ///
    /// Otherwise the graph is left stale and the next search reloads it.
    fn apply_write(&self, generation: i64, f: impl FnOnce(&mut HnswGraph)) -> Result<()> {
        let mut guard = self.graph.write().map_err(lock_poisoned)?;
        match guard.as_mut() {
            Some(state) if state.generation == generation - 1 => {
                f(&mut state.graph);
                state.generation = generation;
            }
            Some(state) => {
                tracing::debug!(
                    graph = state.generation,
                    stored = generation,
                    "concurrent write detected; graph will reload"
                );
            }
            None => {}
        }
        Ok(())
    }

    fn require_params(&self) -> Result<IndexParams> {
        self.params
            .read()
            .map_err(lock_poisoned)?
            .ok_or(VectorIndexError::NotConfigured)
    }

    async fn load_params(&self) -> Result<Option<IndexParams>> {
        let row: Option<(i64, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT dimension, metric, hnsw_m, hnsw_ef_construction, hnsw_ef_search \
             FROM index_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(dimension, metric, m, ef_construction, ef_search)| {
            Ok(IndexParams {
                dimension: to_usize(dimension)?,
                metric: DistanceMetric::parse(&metric)?,
                hnsw: HnswParams {
                    m: to_usize(m)?,
                    ef_construction: to_usize(ef_construction)?,
                    ef_search: to_usize(ef_search)?,
                },
            })
        })
        .transpose()
    }

    async fn row_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn stored_generation(&self) -> Result<i64> {
        let (generation,): (i64,) =
            sqlx::query_as("SELECT generation FROM index_state WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(generation)
    }

    /// Rebuild the in-memory graph from every stored row.
    ///
    /// Generation and rows are read in one transaction so they describe the same snapshot.
    async fn reload_graph(&self, params: IndexParams) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let (generation,): (i64,) =
            sqlx::query_as("SELECT generation FROM index_state WHERE id = 1")
                .fetch_one(&mut *tx)
                .await?;
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT id, embedding FROM records ORDER BY rowid")
                .fetch_all(&mut *tx)
                .await?;
        tx.commit().await?;
        let mut graph = HnswGraph::new(params.hnsw, params.metric);
        for (id, blob) in rows {
            let vector = decode_embedding(&blob)?;
            if vector.len() == params.dimension {
                graph.insert(&id, vector);
            } else {
                tracing::warn!(id = %id, len = vector.len(), "skipping stored vector with wrong dimension");
            }
        }
        let nodes = graph.len();
        *self.graph.write().map_err(lock_poisoned)? = Some(SyncedGraph { graph, generation });
        Ok(nodes)
    }

    async fn sync_graph(&self, params: IndexParams) -> Result<()> {
        let stored = self.stored_generation().await?;
        let in_memory = self.synced_generation()?;
        if in_memory != Some(stored) {
            tracing::debug!(stored, ?in_memory, "graph out of sync with table; reloading");
            self.reload_graph(params).await?;
        }
        Ok(())
    }

    async fn eligible_ids(&self, filter: &MetadataFilter) -> Result<HashSet<String>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id FROM records WHERE 1 = 1");
        push_filter(&mut qb, filter)?;
        let rows: Vec<(String,)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn fetch_hits(
        &self,
        ranked: &[(String, f32)],
        metric: DistanceMetric,
    ) -> Result<Vec<SearchHit>> {
        let mut rows: HashMap<String, (String, Vec<u8>, String)> = HashMap::new();
        for chunk in ranked.chunks(IDS_PER_LOOKUP) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT id, content, embedding, metadata FROM records WHERE id IN (",
            );
            let mut ids = qb.separated(", ");
            for (id, _) in chunk {
                ids.push_bind(id.as_str());
            }
            qb.push(")");
            let found: Vec<(String, String, Vec<u8>, String)> =
                qb.build_query_as().fetch_all(&self.pool).await?;
            rows.extend(
                found
                    .into_iter()
                    .map(|(id, content, blob, meta)| (id, (content, blob, meta))),
            );
        }

        let mut hits = Vec::with_capacity(ranked.len());
        for (id, distance) in ranked {
            // Deleted between graph lookup and fetch.
            let Some((content, blob, meta)) = rows.remove(id) else {
                continue;
            };
            hits.push(SearchHit {
                id: RecordId(id.clone()),
                content,
                metadata: serde_json::from_str::<Metadata>(&meta)?,
                embedding: decode_embedding(&blob)?,
                similarity: metric.similarity_from_distance(*distance),
            });
        }
        Ok(hits)
    }

    /// Upsert `rows` in one transaction. Returns the new write generation.
    async fn write_rows(&self, rows: &[(PreparedRecord, String)]) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let (generation,): (i64,) = sqlx::query_as(BUMP_GENERATION).fetch_one(&mut *tx).await?;
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut qb =
                QueryBuilder::<Sqlite>::new("INSERT INTO records (id, content, embedding, metadata) ");
            qb.push_values(chunk, |mut b, (rec, meta)| {
                b.push_bind(rec.id.as_str())
                    .push_bind(rec.content.as_str())
                    .push_bind(encode_embedding(&rec.embedding))
                    .push_bind(meta.as_str());
            });
            qb.push(UPSERT_TAIL);
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(generation)
    }

    fn add_to_graph(&self, generation: i64, rows: &[(PreparedRecord, String)]) -> Result<()> {
        self.apply_write(generation, |graph| {
            for (rec, _) in rows {
                graph.insert(rec.id.as_str(), rec.embedding.clone());
            }
        })
    }

    /// Run `sql` (bound to `id` when given) after bumping the generation, in one transaction.
    async fn delete_rows(&self, sql: &str, id: Option<&str>) -> Result<(i64, u64)> {
        let mut tx = self.pool.begin().await?;
        let (generation,): (i64,) = sqlx::query_as(BUMP_GENERATION).fetch_one(&mut *tx).await?;
        let mut query = sqlx::query(sql);
        if let Some(id) = id {
            query = query.bind(id);
        }
        let result = query.execute(&mut *tx).await?;
        tx.commit().await?;
        Ok((generation, result.rows_affected()))
    }

    fn prepare(record: NewRecord, params: &IndexParams) -> Result<(PreparedRecord, String)> {
        let prepared = prepare_record(record, params, &Capabilities::unrestricted())?;
        let meta = serde_json::to_string(&prepared.metadata)?;
        Ok((prepared, meta))
    }
}

impl VectorIndex for SqliteIndex {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::unrestricted()
    }

    fn params(&self) -> Option<IndexParams> {
        self.params.read().ok().and_then(|p| *p)
    }

    fn configure(&self, params: IndexParams) -> BoxFuture<'_, Result<()>> {
        Box::pin(with_timeout(self.timeout, async move {
            let current = self.params();
            if current == Some(params) {
                return Ok(());
            }
            if let Some(cur) = current
                && cur.is_incompatible_with(&params)
            {
                let stored = self.row_count().await?;
                if stored > 0 {
                    return Err(VectorIndexError::Configuration(format!(
                        "index holds {stored} records at dimension {} ({}); \
                         clear it before switching to {} ({})",
                        cur.dimension, cur.metric, params.dimension, params.metric
                    )));
                }
            }

            sqlx::query(
                "INSERT INTO index_config \
                 (id, dimension, metric, hnsw_m, hnsw_ef_construction, hnsw_ef_search) \
                 VALUES (1, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET dimension = excluded.dimension, \
                 metric = excluded.metric, hnsw_m = excluded.hnsw_m, \
                 hnsw_ef_construction = excluded.hnsw_ef_construction, \
                 hnsw_ef_search = excluded.hnsw_ef_search, updated_at = datetime('now')",
            )
            .bind(to_i64(params.dimension)?)
            .bind(params.metric.as_str())
            .bind(to_i64(params.hnsw.m)?)
            .bind(to_i64(params.hnsw.ef_construction)?)
            .bind(to_i64(params.hnsw.ef_search)?)
            .execute(&self.pool)
            .await?;

            *self.params.write().map_err(lock_poisoned)? = Some(params);
            let nodes = self.reload_graph(params).await?;
            tracing::info!(
                dimension = params.dimension,
                metric = %params.metric,
                m = params.hnsw.m,
                nodes,
                "configured sqlite index"
            );
            Ok(())
        }))
    }

    fn insert(&self, record: NewRecord) -> BoxFuture<'_, Result<RecordId>> {
        Box::pin(with_timeout(self.timeout, async move {
            let params = self.require_params()?;
            let row = Self::prepare(record, &params)?;
            let rows = [row];
            let generation = self.write_rows(&rows).await?;
            self.add_to_graph(generation, &rows)?;
            let [(prepared, _)] = rows;
            Ok(prepared.id)
        }))
    }

    fn insert_batch(&self, records: Vec<NewRecord>) -> BoxFuture<'_, Result<BatchInsertReport>> {
        Box::pin(with_timeout(self.timeout, async move {
            let params = self.require_params()?;
            let mut outcomes: Vec<Option<Result<RecordId>>> = Vec::with_capacity(records.len());
            let mut ready: Vec<(PreparedRecord, String)> = Vec::new();
            let mut positions: Vec<usize> = Vec::new();

            for (pos, record) in records.into_iter().enumerate() {
                match Self::prepare(record, &params) {
                    Ok(row) => {
                        positions.push(pos);
                        ready.push(row);
                        outcomes.push(None);
                    }
                    Err(e) => outcomes.push(Some(Err(e))),
                }
            }

            if !ready.is_empty() {
                match self.write_rows(&ready).await {
                    Ok(generation) => {
                        self.add_to_graph(generation, &ready)?;
                        for (pos, (rec, _)) in positions.iter().zip(ready) {
                            outcomes[*pos] = Some(Ok(rec.id));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(records = ready.len(), error = %e, "batch insert failed");
                        let message = e.to_string();
                        for pos in &positions {
                            outcomes[*pos] = Some(Err(VectorIndexError::Upsert(message.clone())));
                        }
                    }
                }
            }

            Ok(BatchInsertReport {
                outcomes: outcomes
                    .into_iter()
                    .map(|o| {
                        o.unwrap_or_else(|| {
                            Err(VectorIndexError::Upsert("record was not written".into()))
                        })
                    })
                    .collect(),
            })
        }))
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
            }
            if top_k == 0 {
                return Ok(Vec::new());
            }

            self.sync_graph(params).await?;
            let eligible = match &filter {
                Some(f) => Some(self.eligible_ids(f).await?),
                None => None,
            };
            let eligible_count = match &eligible {
                Some(ids) => ids.len(),
                None => self.graph_read(|g| g.map_or(0, HnswGraph::len))?,
            };
            let wanted = top_k.min(eligible_count);
            if wanted == 0 {
                return Ok(Vec::new());
            }

            let allow = |id: &str| eligible.as_ref().is_none_or(|ids| ids.contains(id));
            let exact_scan_limit = self.exact_scan_limit;
            let ranked = self.graph_read(|g| {
                let Some(graph) = g else {
                    return Vec::new();
                };
                if eligible_count <= exact_scan_limit {
                    return graph.exact_search(&query, top_k, &allow);
                }
                let approx = graph.search(&query, top_k, &allow);
                if approx.len() < wanted {
                    tracing::debug!(
                        found = approx.len(),
                        wanted,
                        "graph search came up short; scanning exactly"
                    );
                    graph.exact_search(&query, top_k, &allow)
                } else {
                    approx
                }
            })?;

            self.fetch_hits(&ranked, params.metric).await
        }))
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_owned();
        Box::pin(with_timeout(self.timeout, async move {
            let (generation, deleted) = self
                .delete_rows("DELETE FROM records WHERE id = ?", Some(&id))
                .await?;
            self.apply_write(generation, |graph| {
                graph.remove(&id);
            })?;
            Ok(deleted > 0)
        }))
    }

    fn delete_all(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(with_timeout(self.timeout, async move {
            let (generation, deleted) = self.delete_rows("DELETE FROM records", None).await?;
            self.apply_write(generation, HnswGraph::clear)?;
            tracing::info!(deleted, "cleared sqlite index");
            Ok(())
        }))
    }

    fn count(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(with_timeout(self.timeout, self.row_count()))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.pool.close().await;
            Ok(())
        })
    }
}
