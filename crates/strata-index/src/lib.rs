//! Code-RAG pipeline: syntax-aware chunk extraction, content composition, ingestion
//! into a vector index, and hybrid retrieval.
//!
//! Source trees are split into semantic chunks (Java declarations and methods,
//! `OpenAPI` operations and schemas, Markdown sections, Gradle blocks), each chunk is
//! composed into a metadata-headed embedding text, written to a JSON ingest file,
//! embedded and stored. Retrieval combines filtered vector search with metadata boosts.

pub mod chunk;
pub mod composer;
pub mod error;
pub mod extractor;
pub mod indexer;
pub mod ingest_file;
pub mod languages;
pub mod retriever;
pub mod verify;

pub use chunk::{Chunk, ChunkType, Layer};
pub use composer::{COMPOSER_VERSION, ComposedChunk, compose, compose_chunk, recompose};
pub use error::{IndexError, Result};
pub use extractor::{ExtractConfig, Extraction, ExtractionReport, extract_file, extract_tree};
pub use indexer::{IngestConfig, IngestReport, Ingestor};
pub use ingest_file::{read_ingest_file, write_ingest_file};
pub use languages::FileKind;
pub use retriever::{
    BoostConfig, HybridRetriever, RankedResult, RetrievalConfig, RetrievalPhase, SearchRequest,
};
pub use verify::{CoverageReport, verify_coverage};
