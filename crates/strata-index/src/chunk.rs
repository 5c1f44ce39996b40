//! The unit of retrieval and its closed vocabularies.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_memory::Metadata;

/// Kind of semantic unit a chunk holds. Stored as the `type` metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Class,
    Interface,
    Enum,
    Record,
    Annotation,
    Method,
    Constructor,
    ApiInfo,
    ApiEndpoint,
    ApiSchema,
    Documentation,
    BuildConfigFull,
    BuildDependencies,
    BuildPlugins,
    File,
}

impl ChunkType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Enum => "enum",
            Self::Record => "record",
            Self::Annotation => "annotation",
            Self::Method => "method",
            Self::Constructor => "constructor",
            Self::ApiInfo => "api_info",
            Self::ApiEndpoint => "api_endpoint",
            Self::ApiSchema => "api_schema",
            Self::Documentation => "documentation",
            Self::BuildConfigFull => "build_config_full",
            Self::BuildDependencies => "build_dependencies",
            Self::BuildPlugins => "build_plugins",
            Self::File => "file",
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Architectural layer. Never omitted: unmatched code is [`Layer::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Controller,
    Service,
    Repository,
    Config,
    Exception,
    Model,
    Dto,
    Api,
    Documentation,
    Build,
    Other,
}

impl Layer {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Service => "service",
            Self::Repository => "repository",
            Self::Config => "config",
            Self::Exception => "exception",
            Self::Model => "model",
            Self::Dto => "dto",
            Self::Api => "api",
            Self::Documentation => "documentation",
            Self::Build => "build",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw extracted text plus its metadata, before composition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub metadata: Metadata,
}

/// Deterministic id for the `ordinal`-th chunk of a file.
///
/// First 32 hex characters of `blake3(module \0 file_path \0 ordinal)`.
#[must_use]
pub fn chunk_id(module: &str, file_path: &str, ordinal: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(module.as_bytes());
    hasher.update(&[0]);
    hasher.update(file_path.as_bytes());
    hasher.update(&[0]);
    hasher.update(ordinal.to_string().as_bytes());
    let hex = hasher.finalize().to_hex();
    hex[..32].to_owned()
}
