//! Vector index abstraction with `SQLite`, Qdrant and in-memory backends.

pub mod error;
pub mod hnsw;
pub mod in_memory_index;
pub mod limits;
pub mod metadata;
pub mod qdrant_index;
pub mod sqlite_index;
pub mod vector_index;

pub use error::VectorIndexError;
pub use in_memory_index::InMemoryIndex;
pub use limits::{Capabilities, FilterableFields, MetadataLimits};
pub use metadata::{FieldCondition, FieldValue, MetaKey, MetaValue, Metadata, MetadataFilter};
pub use qdrant_index::QdrantIndex;
pub use sqlite_index::SqliteIndex;
pub use vector_index::{
    BatchInsertReport, DistanceMetric, HnswParams, IndexParams, NewRecord, RecordId, SearchHit,
    VectorIndex,
};
